//! Eviction strategies for the prefix tree
//!
//! The tree gathers every unlocked leaf as a candidate and evicts in the order
//! of the strategy's key. Strategies never touch the tree itself, so
//! recency-, frequency- and size-based orderings can be swapped freely.

use crate::tree::NodeId;
use kvtree_types::EvictionPolicyKind;

/// Snapshot of an evictable leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Leaf node
    pub node: NodeId,
    /// Logical time of the last access
    pub last_used: u64,
    /// Logical time of creation
    pub created_at: u64,
    /// Number of times the node was hit by a lookup
    pub hit_count: u64,
    /// Pages released if this leaf is evicted
    pub pages: usize,
}

/// Ordering key; the candidate with the smallest key is evicted first
pub type EvictionKey = (u64, u64, u64);

/// Eviction strategy trait
pub trait EvictionStrategy: Send + Sync + std::fmt::Debug {
    /// Rank a candidate. Keys must only depend on the candidate itself.
    fn eviction_key(&self, candidate: &EvictionCandidate) -> EvictionKey;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Index of the next victim in `candidates`, or `None` when empty
    fn choose_victim(&self, candidates: &[EvictionCandidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, candidate)| self.eviction_key(candidate))
            .map(|(idx, _)| idx)
    }
}

/// Larger nodes sort first among otherwise equal candidates
fn size_rank(pages: usize) -> u64 {
    u64::MAX - pages as u64
}

/// Least Recently Used (LRU) eviction, more pages first on ties
#[derive(Debug, Default, Clone, Copy)]
pub struct LruEviction;

impl EvictionStrategy for LruEviction {
    fn eviction_key(&self, c: &EvictionCandidate) -> EvictionKey {
        (c.last_used, size_rank(c.pages), 0)
    }

    fn name(&self) -> &str {
        "LRU"
    }
}

/// Least Frequently Used (LFU) eviction, LRU among equally hit nodes
#[derive(Debug, Default, Clone, Copy)]
pub struct LfuEviction;

impl EvictionStrategy for LfuEviction {
    fn eviction_key(&self, c: &EvictionCandidate) -> EvictionKey {
        (c.hit_count, c.last_used, size_rank(c.pages))
    }

    fn name(&self) -> &str {
        "LFU"
    }
}

/// First In, First Out (FIFO) eviction by node creation time
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoEviction;

impl EvictionStrategy for FifoEviction {
    fn eviction_key(&self, c: &EvictionCandidate) -> EvictionKey {
        (c.created_at, c.last_used, size_rank(c.pages))
    }

    fn name(&self) -> &str {
        "FIFO"
    }
}

/// Largest leaf first, LRU among equally sized leaves
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestFirstEviction;

impl EvictionStrategy for LargestFirstEviction {
    fn eviction_key(&self, c: &EvictionCandidate) -> EvictionKey {
        (size_rank(c.pages), c.last_used, 0)
    }

    fn name(&self) -> &str {
        "LargestFirst"
    }
}

/// Build the strategy named by the configuration
pub fn strategy_for(kind: EvictionPolicyKind) -> Box<dyn EvictionStrategy> {
    match kind {
        EvictionPolicyKind::Lru => Box::new(LruEviction),
        EvictionPolicyKind::Lfu => Box::new(LfuEviction),
        EvictionPolicyKind::Fifo => Box::new(FifoEviction),
        EvictionPolicyKind::Largest => Box::new(LargestFirstEviction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        node: usize,
        last_used: u64,
        created_at: u64,
        hits: u64,
        pages: usize,
    ) -> EvictionCandidate {
        EvictionCandidate {
            node: NodeId(node),
            last_used,
            created_at,
            hit_count: hits,
            pages,
        }
    }

    #[test]
    fn test_lru_eviction() {
        let candidates = [
            candidate(1, 30, 1, 0, 1),
            candidate(2, 10, 2, 5, 1),
            candidate(3, 20, 3, 0, 1),
        ];
        assert_eq!(LruEviction.choose_victim(&candidates), Some(1));
    }

    #[test]
    fn test_lru_ties_prefer_larger_nodes() {
        let candidates = [candidate(1, 10, 1, 0, 2), candidate(2, 10, 2, 0, 7)];
        assert_eq!(LruEviction.choose_victim(&candidates), Some(1));
    }

    #[test]
    fn test_lfu_eviction() {
        let candidates = [
            candidate(1, 1, 1, 4, 1),
            candidate(2, 50, 2, 1, 1),
            candidate(3, 60, 3, 1, 1),
        ];
        assert_eq!(LfuEviction.choose_victim(&candidates), Some(1));
    }

    #[test]
    fn test_fifo_eviction() {
        let candidates = [candidate(1, 1, 9, 0, 1), candidate(2, 99, 3, 0, 1)];
        assert_eq!(FifoEviction.choose_victim(&candidates), Some(1));
    }

    #[test]
    fn test_largest_first_eviction() {
        let candidates = [candidate(1, 1, 1, 0, 2), candidate(2, 99, 2, 0, 8)];
        assert_eq!(LargestFirstEviction.choose_victim(&candidates), Some(1));
    }

    #[test]
    fn test_keys_order_like_choose_victim() {
        let old_small = candidate(1, 5, 1, 0, 1);
        let old_big = candidate(2, 5, 2, 0, 4);
        let recent = candidate(3, 9, 3, 0, 8);
        let lru = LruEviction;
        assert!(lru.eviction_key(&old_big) < lru.eviction_key(&old_small));
        assert!(lru.eviction_key(&old_small) < lru.eviction_key(&recent));

        let largest = LargestFirstEviction;
        assert!(largest.eviction_key(&recent) < largest.eviction_key(&old_big));
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(LruEviction.choose_victim(&[]), None);
        assert_eq!(strategy_for(EvictionPolicyKind::Fifo).choose_victim(&[]), None);
    }

    #[test]
    fn test_factory_names() {
        assert_eq!(strategy_for(EvictionPolicyKind::Lru).name(), "LRU");
        assert_eq!(strategy_for(EvictionPolicyKind::Lfu).name(), "LFU");
        assert_eq!(strategy_for(EvictionPolicyKind::Fifo).name(), "FIFO");
        assert_eq!(strategy_for(EvictionPolicyKind::Largest).name(), "LargestFirst");
    }
}
