//! Request and batch result types exchanged with the scheduler

use crate::{RequestId, TokenId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generation request submitted to the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request identifier
    pub id: RequestId,
    /// Prompt token ids
    pub prompt: Vec<TokenId>,
    /// Upper bound on generated tokens
    pub max_new_tokens: usize,
    /// Request creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Request {
    /// Create a new request for the given prompt tokens
    pub fn new(prompt: Vec<TokenId>) -> Self {
        Self {
            id: RequestId::new(),
            prompt,
            max_new_tokens: 256,
            created_at: Utc::now(),
        }
    }

    /// Set the generation limit
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Request state in the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Waiting in queue
    Queued,
    /// Admitted, prompt suffix being computed
    Prefilling,
    /// Generating tokens one step at a time
    Decoding,
    /// Finished normally
    Completed,
    /// Cancelled or timed out
    Aborted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Prefilling | Self::Decoding)
    }
}

/// Outcome of one computed batch entry, reported back by the model runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    /// Request this result belongs to
    pub request_id: RequestId,
    /// Tokens generated during this step
    pub new_tokens: Vec<TokenId>,
    /// Whether generation is done
    pub finished: bool,
}

impl BatchResult {
    pub fn new(request_id: RequestId, new_tokens: Vec<TokenId>, finished: bool) -> Self {
        Self {
            request_id,
            new_tokens,
            finished,
        }
    }
}
