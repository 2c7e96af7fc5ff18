//! Batches handed to the model runner

use chrono::{DateTime, Utc};
use kvtree_types::{BatchId, PageId, RequestId, TokenId};
use serde::{Deserialize, Serialize};

/// Which phase a batch computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// Uncached prompt suffixes of newly admitted requests
    Prefill,
    /// One token per decoding request
    Decode,
}

/// One request's share of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub request_id: RequestId,
    /// Tokens to run through the model this step
    pub tokens: Vec<TokenId>,
    /// Leading positions whose KV is already present in `pages`
    pub cached_len: usize,
    /// Page table for the whole sequence, cached prefix first
    pub pages: Vec<PageId>,
}

/// Batch of work for one model step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub kind: BatchKind,
    pub entries: Vec<BatchEntry>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(kind: BatchKind, entries: Vec<BatchEntry>) -> Self {
        Self {
            id: BatchId::new(),
            kind,
            entries,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn request_ids(&self) -> impl Iterator<Item = &RequestId> {
        self.entries.iter().map(|e| &e.request_id)
    }
}
