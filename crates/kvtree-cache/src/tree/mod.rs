//! Radix prefix tree over token sequences
//!
//! Nodes live in an arena and refer to each other by [`NodeId`], so the
//! parent links used for locking never own anything. Keys are compared a page
//! at a time: with `page_size > 1` only whole pages are ever cached, matched or
//! split, which keeps every node's pages separable at its key boundaries.

mod evict;
mod inspect;
mod node;

pub use inspect::{NodeSnapshot, PrefixTreeStats};
pub use node::NodeId;

use crate::eviction::{strategy_for, EvictionStrategy};
use crate::pages::PageAllocator;
use kvtree_types::{CacheConfig, KvTreeError, PageId, Result, TokenId};
use node::{ChildKey, Node, PageList};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Result of a longest-prefix lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Leading tokens already cached, a multiple of the page size
    pub matched_len: usize,
    /// Deepest node reached; its key may only be partially matched
    pub last_node: NodeId,
    /// Cached pages backing the matched prefix, in order
    pub pages: Vec<PageId>,
}

impl MatchResult {
    fn empty() -> Self {
        Self {
            matched_len: 0,
            last_node: PrefixTree::ROOT,
            pages: Vec::new(),
        }
    }

    pub fn has_match(&self) -> bool {
        self.matched_len > 0
    }
}

/// Result of an insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertResult {
    /// Node whose path spells the inserted (page aligned) sequence
    pub node: NodeId,
    /// Tokens that were already cached before this insert
    pub prefix_len: usize,
    /// Tokens newly added to the tree
    pub new_tokens: usize,
}

/// Prefix-sharing cache of KV pages
#[derive(Debug)]
pub struct PrefixTree {
    config: CacheConfig,
    /// Node arena; `None` marks a free slot
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    allocator: Arc<dyn PageAllocator>,
    strategy: Box<dyn EvictionStrategy>,
    /// Logical clock for recency
    clock: u64,
    /// Accounting, in pages
    total_pages: usize,
    evictable_pages: usize,
    protected_pages: usize,
    /// Statistics
    evicted_pages: u64,
    evicted_nodes: u64,
    splits: u64,
}

impl PrefixTree {
    /// The root is always slot 0
    pub const ROOT: NodeId = NodeId(0);

    /// Create an empty tree drawing pages from `allocator`
    pub fn new(config: CacheConfig, allocator: Arc<dyn PageAllocator>) -> Result<Self> {
        config.validate()?;
        let strategy = strategy_for(config.eviction_policy);

        debug!(
            "Creating prefix tree: page_size={}, capacity={}, enabled={}, eviction={}",
            config.page_size,
            config.capacity,
            config.enabled,
            strategy.name()
        );

        Ok(Self {
            config,
            nodes: vec![Some(Node::root())],
            free_slots: Vec::new(),
            allocator,
            strategy,
            clock: 0,
            total_pages: 0,
            evictable_pages: 0,
            protected_pages: 0,
            evicted_pages: 0,
            evicted_nodes: 0,
            splits: 0,
        })
    }

    /// Replace the eviction strategy
    pub fn with_strategy(mut self, strategy: Box<dyn EvictionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Pages held by all nodes
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Tokens held by all nodes
    pub fn cached_tokens(&self) -> usize {
        self.total_pages * self.config.page_size
    }

    /// Pages held by unlocked nodes
    pub fn evictable_pages(&self) -> usize {
        self.evictable_pages
    }

    /// Pages held by locked nodes
    pub fn protected_pages(&self) -> usize {
        self.protected_pages
    }

    /// Live nodes, root included
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free_slots.len()
    }

    /// Round a length down to whole pages
    pub fn aligned_len(&self, len: usize) -> usize {
        len / self.config.page_size * self.config.page_size
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    /// Edge label of a node
    pub fn key(&self, id: NodeId) -> Result<&[TokenId]> {
        Ok(&self.get(id)?.key)
    }

    /// Current lock count of a node
    pub fn ref_count(&self, id: NodeId) -> Result<usize> {
        Ok(self.get(id)?.ref_count)
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.get(id)?.parent)
    }

    /// Children in lexical order of their first page
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>> {
        Ok(self.get(id)?.children.values().copied().collect())
    }

    /// Tokens spelled by the path from the root to `id`
    pub fn path_tokens(&self, id: NodeId) -> Result<Vec<TokenId>> {
        let mut segments = Vec::new();
        let mut cur = Some(id);
        while let Some(node_id) = cur {
            let node = self.get(node_id)?;
            segments.push(node.key.as_slice());
            cur = node.parent;
        }
        Ok(segments.into_iter().rev().flatten().copied().collect())
    }

    /// Find the longest cached prefix of `tokens`.
    ///
    /// Read-only: neither recency nor lock counts change. Callers that intend
    /// to use the match should [`lock`](Self::lock) and [`touch`](Self::touch)
    /// the returned node.
    pub fn match_prefix(&self, tokens: &[TokenId]) -> MatchResult {
        let ps = self.config.page_size;
        if !self.config.enabled || tokens.len() < ps {
            return MatchResult::empty();
        }

        let tokens = &tokens[..self.aligned_len(tokens.len())];
        let mut node = Self::ROOT;
        let mut matched = 0;
        let mut pages = Vec::new();

        while matched < tokens.len() {
            let rest = &tokens[matched..];
            let child = match self.node(node).children.get(&rest[..ps]) {
                Some(&child) => child,
                None => break,
            };

            let child_node = self.node(child);
            let shared = self.shared_len(&child_node.key, rest);
            pages.extend_from_slice(&child_node.value[..shared / ps]);
            matched += shared;
            node = child;

            if shared < child_node.key.len() {
                break;
            }
        }

        trace!("Matched {}/{} tokens at {}", matched, tokens.len(), node);

        MatchResult {
            matched_len: matched,
            last_node: node,
            pages,
        }
    }

    /// Cache `tokens` backed by `pages` (one page per whole page of tokens).
    ///
    /// Only the page-aligned prefix of `tokens` is cached; surplus pages stay
    /// with the caller. Where the tree already holds a page for a position, a
    /// different caller page for that position is a duplicate and is released
    /// through the allocator. Partially overlapping edges are split.
    pub fn insert(&mut self, tokens: &[TokenId], pages: &[PageId]) -> Result<InsertResult> {
        if !self.config.enabled {
            return Ok(InsertResult {
                node: Self::ROOT,
                prefix_len: 0,
                new_tokens: 0,
            });
        }

        let ps = self.config.page_size;
        let aligned = self.aligned_len(tokens.len());
        let page_count = aligned / ps;
        if pages.len() < page_count {
            return Err(KvTreeError::invalid_parameter(format!(
                "Insert of {} tokens needs {} pages, got {}",
                aligned,
                page_count,
                pages.len()
            )));
        }

        let tokens = &tokens[..aligned];
        let pages = &pages[..page_count];

        // Release caller pages for positions the tree already holds before
        // touching the structure, so a failed free leaves the tree as it was
        let held = self.match_prefix(tokens);
        let duplicates: Vec<PageId> = pages
            .iter()
            .zip(&held.pages)
            .filter(|(mine, theirs)| mine != theirs)
            .map(|(mine, _)| *mine)
            .collect();
        if !duplicates.is_empty() {
            trace!("Releasing {} duplicate pages", duplicates.len());
            self.allocator.free(&duplicates)?;
        }

        let now = self.tick();
        let mut node = Self::ROOT;
        let mut pos = 0;
        let mut new_tokens = 0;

        while pos < aligned {
            let rest = &tokens[pos..];
            let next = self.node(node).children.get(&rest[..ps]).copied();
            let child = match next {
                Some(child) => child,
                None => {
                    let value: PageList = pages[pos / ps..].iter().copied().collect();
                    node = self.add_leaf(node, rest.to_vec(), value, now);
                    new_tokens = rest.len();
                    break;
                }
            };

            let (shared, key_len) = {
                let child_node = self.node(child);
                (
                    self.shared_len(&child_node.key, rest),
                    child_node.key.len(),
                )
            };

            node = if shared < key_len {
                self.split(child, shared)
            } else {
                child
            };
            self.node_mut(node).last_used = now;
            pos += shared;
        }

        #[cfg(debug_assertions)]
        self.validate()?;

        debug!(
            "Inserted {} tokens ({} new) ending at {}",
            aligned, new_tokens, node
        );

        Ok(InsertResult {
            node,
            prefix_len: aligned - new_tokens,
            new_tokens,
        })
    }

    /// Pin `id` and its ancestors against eviction. Locking the root is a no-op.
    pub fn lock(&mut self, id: NodeId) -> Result<()> {
        self.get(id)?;

        let mut cur = id;
        while cur != Self::ROOT {
            let (pages, newly_locked, parent) = {
                let node = self.node_mut(cur);
                node.ref_count += 1;
                (node.pages(), node.ref_count == 1, node.parent)
            };
            if newly_locked {
                self.evictable_pages -= pages;
                self.protected_pages += pages;
            }
            cur = parent.ok_or_else(|| {
                KvTreeError::invariant_violation(format!("{} has no parent", cur))
            })?;
        }

        Ok(())
    }

    /// Release one lock on `id` and its ancestors.
    ///
    /// The whole path is checked before anything is decremented: an unlock
    /// that would drive any count below zero is a `LockImbalance` and leaves
    /// the tree untouched.
    pub fn unlock(&mut self, id: NodeId) -> Result<()> {
        self.get(id)?;

        let mut cur = id;
        while cur != Self::ROOT {
            let node = self.node(cur);
            if node.ref_count == 0 {
                error!("Unlock of {} reached unlocked ancestor {}", id, cur);
                return Err(KvTreeError::lock_imbalance(format!(
                    "unlock of {} found zero lock count at {}",
                    id, cur
                )));
            }
            cur = node.parent.ok_or_else(|| {
                KvTreeError::invariant_violation(format!("{} has no parent", cur))
            })?;
        }

        let mut cur = id;
        while cur != Self::ROOT {
            let (pages, released, parent) = {
                let node = self.node_mut(cur);
                node.ref_count -= 1;
                (node.pages(), node.ref_count == 0, node.parent)
            };
            if released {
                self.protected_pages -= pages;
                self.evictable_pages += pages;
            }
            match parent {
                Some(parent) => cur = parent,
                None => break,
            }
        }

        Ok(())
    }

    /// Refresh recency and hit counts along the path to `id`
    pub fn touch(&mut self, id: NodeId) -> Result<()> {
        self.get(id)?;
        let now = self.tick();

        let mut cur = Some(id);
        while let Some(node_id) = cur {
            let node = self.node_mut(node_id);
            node.last_used = now;
            node.hit_count += 1;
            cur = node.parent;
        }
        Ok(())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&self, id: NodeId) -> Result<&Node> {
        match self.nodes.get(id.0) {
            Some(Some(node)) => Ok(node),
            _ => Err(KvTreeError::not_found(format!("No live node {}", id))),
        }
    }

    /// Internal lookup for ids taken from the tree's own links
    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0]
            .as_ref()
            .expect("tree links only reference live nodes")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0]
            .as_mut()
            .expect("tree links only reference live nodes")
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn first_page(&self, key: &[TokenId]) -> ChildKey {
        key[..self.config.page_size].iter().copied().collect()
    }

    /// Length of the common whole-page prefix of `key` and `tokens`
    fn shared_len(&self, key: &[TokenId], tokens: &[TokenId]) -> usize {
        let ps = self.config.page_size;
        key.chunks_exact(ps)
            .zip(tokens.chunks_exact(ps))
            .take_while(|(a, b)| a == b)
            .count()
            * ps
    }

    fn add_leaf(&mut self, parent: NodeId, key: Vec<TokenId>, value: PageList, now: u64) -> NodeId {
        let pages = value.len();
        let first = self.first_page(&key);
        let leaf = self.alloc_node(Node::new(key, value, Some(parent), now));
        self.node_mut(parent).children.insert(first, leaf);

        self.total_pages += pages;
        self.evictable_pages += pages;
        leaf
    }

    /// Split `child` after `at` tokens.
    ///
    /// A new node takes the first `at` tokens and their pages and slots in
    /// between `child` and its parent; `child` keeps its id and the remainder.
    /// The new node inherits `child`'s lock count, since every lock on `child`
    /// also pins the prefix.
    fn split(&mut self, child: NodeId, at: usize) -> NodeId {
        let ps = self.config.page_size;
        debug_assert!(at > 0 && at % ps == 0);

        let mid_node = {
            let node = self.node_mut(child);
            debug_assert!(at < node.key.len());

            let suffix_key = node.key.split_off(at);
            let prefix_key = std::mem::replace(&mut node.key, suffix_key);
            let suffix_value: PageList = node.value[at / ps..].iter().copied().collect();
            let prefix_value = std::mem::replace(&mut node.value, suffix_value);

            Node {
                key: prefix_key,
                value: prefix_value,
                children: Default::default(),
                parent: node.parent,
                ref_count: node.ref_count,
                last_used: node.last_used,
                created_at: node.created_at,
                hit_count: node.hit_count,
            }
        };

        let parent = mid_node.parent.expect("split is never applied to the root");
        let mid_first = self.first_page(&mid_node.key);
        let mid = self.alloc_node(mid_node);

        let child_first = self.first_page(&self.node(child).key);
        self.node_mut(parent).children.insert(mid_first, mid);
        self.node_mut(mid).children.insert(child_first, child);
        self.node_mut(child).parent = Some(mid);

        self.splits += 1;
        trace!("Split {} at {} tokens into {}", child, at, mid);
        mid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::PagePool;
    use kvtree_types::tokens;

    fn tree(page_size: usize) -> (PrefixTree, Arc<PagePool>) {
        let pool = Arc::new(PagePool::new(256).unwrap());
        let tree = PrefixTree::new(CacheConfig::new(page_size, 256), pool.clone()).unwrap();
        (tree, pool)
    }

    fn cache(tree: &mut PrefixTree, pool: &PagePool, ids: &[u32]) -> InsertResult {
        let seq = tokens(ids);
        let pages = pool.allocate(seq.len() / tree.page_size()).unwrap();
        tree.insert(&seq, &pages).unwrap()
    }

    #[test]
    fn test_empty_tree_matches_nothing() {
        let (tree, _pool) = tree(1);
        let m = tree.match_prefix(&tokens(&[1, 2, 3]));
        assert_eq!(m.matched_len, 0);
        assert_eq!(m.last_node, PrefixTree::ROOT);
        assert!(!m.has_match());
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_exact_match_round_trip() {
        let (mut tree, pool) = tree(1);
        let inserted = cache(&mut tree, &pool, &[4, 5, 6]);

        let m = tree.match_prefix(&tokens(&[4, 5, 6]));
        assert_eq!(m.matched_len, 3);
        assert_eq!(m.last_node, inserted.node);
        assert_eq!(m.pages.len(), 3);
        assert_eq!(tree.path_tokens(m.last_node).unwrap(), tokens(&[4, 5, 6]));
    }

    #[test]
    fn test_shared_prefix_split() {
        let (mut tree, pool) = tree(1);
        cache(&mut tree, &pool, &[1, 2, 3, 4]);
        let second = cache(&mut tree, &pool, &[1, 2, 5, 6]);
        assert_eq!(second.prefix_len, 2);
        assert_eq!(second.new_tokens, 2);

        let root_children = tree.children(PrefixTree::ROOT).unwrap();
        assert_eq!(root_children.len(), 1);
        let shared = root_children[0];
        assert_eq!(tree.key(shared).unwrap(), tokens(&[1, 2]).as_slice());

        let branches: Vec<_> = tree
            .children(shared)
            .unwrap()
            .into_iter()
            .map(|id| tree.key(id).unwrap().to_vec())
            .collect();
        assert_eq!(branches, vec![tokens(&[3, 4]), tokens(&[5, 6])]);

        let m = tree.match_prefix(&tokens(&[1, 2, 5, 9]));
        assert_eq!(m.matched_len, 3);
        assert_eq!(tree.key(m.last_node).unwrap(), tokens(&[5, 6]).as_slice());
    }

    #[test]
    fn test_split_keeps_pages_with_their_tokens() {
        let (mut tree, pool) = tree(1);
        let seq = tokens(&[1, 2, 3, 4]);
        let pages = pool.allocate(4).unwrap();
        tree.insert(&seq, &pages).unwrap();
        cache(&mut tree, &pool, &[1, 2, 9]);

        let m = tree.match_prefix(&seq);
        assert_eq!(m.pages, pages);
    }

    #[test]
    fn test_insert_prefix_of_existing_edge() {
        let (mut tree, pool) = tree(1);
        cache(&mut tree, &pool, &[1, 2, 3, 4]);
        let pages_before = tree.total_pages();

        let shorter = tokens(&[1, 2]);
        let dup_pages = pool.allocate(2).unwrap();
        let res = tree.insert(&shorter, &dup_pages).unwrap();

        assert_eq!(res.prefix_len, 2);
        assert_eq!(res.new_tokens, 0);
        assert_eq!(tree.key(res.node).unwrap(), shorter.as_slice());
        assert_eq!(tree.total_pages(), pages_before);
        // Both caller pages duplicated cached ones and went back to the pool
        assert!(!pool.is_allocated(dup_pages[0]));
        assert!(!pool.is_allocated(dup_pages[1]));
    }

    #[test]
    fn test_reinsert_is_structurally_idempotent() {
        let (mut tree, pool) = tree(1);
        cache(&mut tree, &pool, &[1, 2, 3]);
        cache(&mut tree, &pool, &[1, 2, 7]);
        let before = tree.snapshot();
        let nodes = tree.node_count();

        let again = cache(&mut tree, &pool, &[1, 2, 3]);
        assert_eq!(again.new_tokens, 0);
        assert_eq!(tree.node_count(), nodes);
        assert_eq!(tree.snapshot().shape(), before.shape());
        assert_eq!(tree.total_pages(), 4);
        assert_eq!(pool.allocated(), 4);
    }

    #[test]
    fn test_page_granular_matching() {
        let (mut tree, pool) = tree(2);
        cache(&mut tree, &pool, &[1, 2, 3, 4, 5, 6]);

        // Third page differs in its second token: only two whole pages match
        let m = tree.match_prefix(&tokens(&[1, 2, 3, 4, 5, 9]));
        assert_eq!(m.matched_len, 4);
        assert_eq!(m.pages.len(), 2);

        // Partial trailing page is never matched
        let m = tree.match_prefix(&tokens(&[1, 2, 3]));
        assert_eq!(m.matched_len, 2);

        // Mismatch inside the first page
        let m = tree.match_prefix(&tokens(&[1, 7, 3, 4]));
        assert_eq!(m.matched_len, 0);
    }

    #[test]
    fn test_page_granular_split_and_unaligned_tail() {
        let (mut tree, pool) = tree(2);
        cache(&mut tree, &pool, &[1, 2, 3, 4]);

        let seq = tokens(&[1, 2, 3, 9, 8]);
        let pages = pool.allocate(3).unwrap();
        let res = tree.insert(&seq, &pages).unwrap();

        // [3, 9] differs from [3, 4] as a page, so the split lands after [1, 2]
        assert_eq!(res.prefix_len, 2);
        assert_eq!(res.new_tokens, 2);
        assert_eq!(tree.path_tokens(res.node).unwrap(), tokens(&[1, 2, 3, 9]));
        // Duplicate first page released, tail page left to the caller
        assert!(!pool.is_allocated(pages[0]));
        assert!(pool.is_allocated(pages[2]));
        assert_eq!(tree.total_pages(), 3);
    }

    #[test]
    fn test_insert_requires_enough_pages() {
        let (mut tree, pool) = tree(2);
        let pages = pool.allocate(1).unwrap();
        let err = tree.insert(&tokens(&[1, 2, 3, 4]), &pages).unwrap_err();
        assert!(matches!(err, KvTreeError::InvalidParameter { .. }));
    }

    #[test]
    fn test_failed_duplicate_release_leaves_tree_unchanged() {
        let (mut tree, pool) = tree(1);
        cache(&mut tree, &pool, &[1, 2]);
        let fresh = pool.allocate(1).unwrap();

        // The first position is already cached and its stand-in was never allocated
        let pages = [PageId::new(200), PageId::new(201), fresh[0]];
        assert!(tree.insert(&tokens(&[1, 2, 3]), &pages).is_err());

        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.total_pages(), 2);
        assert_eq!(tree.match_prefix(&tokens(&[1, 2, 3])).matched_len, 2);
        assert!(pool.is_allocated(fresh[0]));
        tree.validate().unwrap();
    }

    #[test]
    fn test_disabled_tree_is_bypassed() {
        let pool = Arc::new(PagePool::new(16).unwrap());
        let mut tree =
            PrefixTree::new(CacheConfig::new(1, 16).with_enabled(false), pool.clone()).unwrap();

        let seq = tokens(&[1, 2, 3]);
        let pages = pool.allocate(3).unwrap();
        let res = tree.insert(&seq, &pages).unwrap();
        assert_eq!(res.node, PrefixTree::ROOT);
        assert_eq!(res.new_tokens, 0);
        assert_eq!(tree.match_prefix(&seq).matched_len, 0);
        assert_eq!(tree.total_pages(), 0);
        // The tree took nothing
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn test_lock_propagates_to_ancestors() {
        let (mut tree, pool) = tree(1);
        cache(&mut tree, &pool, &[1, 2, 3, 4]);
        let leaf = cache(&mut tree, &pool, &[1, 2, 5, 6]).node;
        let shared = tree.parent(leaf).unwrap().unwrap();

        tree.lock(leaf).unwrap();
        assert_eq!(tree.ref_count(leaf).unwrap(), 1);
        assert_eq!(tree.ref_count(shared).unwrap(), 1);
        assert_eq!(tree.ref_count(PrefixTree::ROOT).unwrap(), 0);
        assert_eq!(tree.protected_pages(), 4);
        assert_eq!(tree.evictable_pages(), 2);

        tree.unlock(leaf).unwrap();
        assert_eq!(tree.ref_count(shared).unwrap(), 0);
        assert_eq!(tree.protected_pages(), 0);
        assert_eq!(tree.evictable_pages(), 6);
    }

    #[test]
    fn test_lock_root_is_noop() {
        let (mut tree, _pool) = tree(1);
        tree.lock(PrefixTree::ROOT).unwrap();
        tree.unlock(PrefixTree::ROOT).unwrap();
        assert_eq!(tree.ref_count(PrefixTree::ROOT).unwrap(), 0);
    }

    #[test]
    fn test_unpaired_unlock_is_lock_imbalance() {
        let (mut tree, pool) = tree(1);
        let leaf = cache(&mut tree, &pool, &[1, 2]).node;

        let err = tree.unlock(leaf).unwrap_err();
        assert!(matches!(err, KvTreeError::LockImbalance { .. }));
        assert_eq!(tree.ref_count(leaf).unwrap(), 0);
    }

    #[test]
    fn test_unlock_checks_whole_path_before_mutating() {
        let (mut tree, pool) = tree(1);
        cache(&mut tree, &pool, &[1, 2, 3]);
        let leaf = cache(&mut tree, &pool, &[1, 2, 4]).node;
        let shared = tree.parent(leaf).unwrap().unwrap();

        tree.lock(shared).unwrap();
        // leaf itself was never locked
        assert!(tree.unlock(leaf).is_err());
        assert_eq!(tree.ref_count(shared).unwrap(), 1);
    }

    #[test]
    fn test_split_inherits_lock_count() {
        let (mut tree, pool) = tree(1);
        let leaf = cache(&mut tree, &pool, &[1, 2, 3, 4]).node;
        tree.lock(leaf).unwrap();

        cache(&mut tree, &pool, &[1, 2, 9]);
        let mid = tree.parent(leaf).unwrap().unwrap();
        assert_eq!(tree.key(mid).unwrap(), tokens(&[1, 2]).as_slice());
        assert_eq!(tree.ref_count(mid).unwrap(), 1);
        assert_eq!(tree.key(leaf).unwrap(), tokens(&[3, 4]).as_slice());

        tree.unlock(leaf).unwrap();
        assert_eq!(tree.ref_count(mid).unwrap(), 0);
        tree.validate().unwrap();
    }

    #[test]
    fn test_touch_refreshes_path() {
        let (mut tree, pool) = tree(1);
        let leaf = cache(&mut tree, &pool, &[1, 2]).node;
        let before = tree.snapshot().children[0].last_used;
        tree.touch(leaf).unwrap();
        let after = tree.snapshot().children[0].last_used;
        assert!(after > before);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let (mut tree, _pool) = tree(1);
        assert!(matches!(
            tree.lock(NodeId(42)).unwrap_err(),
            KvTreeError::NotFound { .. }
        ));
        assert!(tree.key(NodeId(42)).is_err());
    }
}
