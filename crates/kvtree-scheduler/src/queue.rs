//! Bounded waiting queue for submitted requests

use kvtree_types::{Request, RequestId};
use std::collections::VecDeque;

/// FIFO queue of requests waiting for admission
#[derive(Debug, Default)]
pub struct WaitingQueue {
    requests: VecDeque<Request>,
    max_size: usize,
}

impl WaitingQueue {
    /// Create new queue with capacity limit
    pub fn new(max_size: usize) -> Self {
        Self {
            requests: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Add request to back of queue, handing it back when full
    pub fn push(&mut self, request: Request) -> Result<(), Request> {
        if self.is_full() {
            Err(request)
        } else {
            self.requests.push_back(request);
            Ok(())
        }
    }

    /// Put an already accepted request back at the front, ignoring the bound
    pub fn push_front(&mut self, request: Request) {
        self.requests.push_front(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.requests.len() >= self.max_size
    }

    /// Remove specific request from queue
    pub fn remove(&mut self, request_id: &RequestId) -> Option<Request> {
        let pos = self.requests.iter().position(|req| &req.id == request_id)?;
        self.requests.remove(pos)
    }

    /// Get reference to request by ID
    pub fn get(&self, request_id: &RequestId) -> Option<&Request> {
        self.requests.iter().find(|req| &req.id == request_id)
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.get(request_id).is_some()
    }

    /// Iterate in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }
}
