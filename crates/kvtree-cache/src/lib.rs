//! # kvtree cache
//!
//! Prefix-sharing KV cache for transformer inference.
//!
//! The [`PrefixTree`] is a radix tree keyed by token sequences. Each node owns
//! the logical pages holding the KV state for its key segment; pages come from
//! and return to a [`PageAllocator`]. Requests pin the path they depend on with
//! [`PrefixTree::lock`], and eviction only ever reclaims unlocked leaves, in the
//! order chosen by a pluggable [`EvictionStrategy`].

pub mod eviction;
pub mod pages;
pub mod tree;

pub use eviction::{
    strategy_for, EvictionCandidate, EvictionKey, EvictionStrategy, FifoEviction,
    LargestFirstEviction, LfuEviction, LruEviction,
};
pub use pages::{PageAllocator, PagePool, PagePoolStats};
pub use tree::{InsertResult, MatchResult, NodeId, NodeSnapshot, PrefixTree, PrefixTreeStats};

pub use kvtree_types::{CacheConfig, KvTreeError, PageId, Result, TokenId};
