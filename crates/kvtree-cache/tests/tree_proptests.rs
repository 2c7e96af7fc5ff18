//! Property-based tests for the prefix tree.
//!
//! Token alphabets are kept tiny so generated sequences share prefixes often
//! and exercise splits.

use kvtree_cache::*;
use kvtree_types::EvictionPolicyKind;
use proptest::prelude::*;
use std::sync::Arc;

const POOL_PAGES: usize = 4096;

fn sequence(page_size: usize) -> impl Strategy<Value = Vec<TokenId>> {
    prop::collection::vec(0u32..4, page_size..=8 * page_size)
        .prop_map(|ids| ids.into_iter().map(TokenId).collect())
}

fn sequences(page_size: usize, max: usize) -> impl Strategy<Value = Vec<Vec<TokenId>>> {
    prop::collection::vec(sequence(page_size), 1..=max)
}

fn policy() -> impl Strategy<Value = EvictionPolicyKind> {
    prop_oneof![
        Just(EvictionPolicyKind::Lru),
        Just(EvictionPolicyKind::Lfu),
        Just(EvictionPolicyKind::Fifo),
        Just(EvictionPolicyKind::Largest),
    ]
}

fn setup(
    page_size: usize,
    policy: EvictionPolicyKind,
    compact: bool,
) -> (PrefixTree, Arc<PagePool>) {
    let pool = Arc::new(PagePool::new(POOL_PAGES).unwrap());
    let config = CacheConfig::new(page_size, POOL_PAGES)
        .with_eviction_policy(policy)
        .with_compaction(compact);
    let tree = PrefixTree::new(config, pool.clone()).unwrap();
    (tree, pool)
}

fn cache(tree: &mut PrefixTree, pool: &PagePool, seq: &[TokenId]) -> InsertResult {
    let pages = pool.allocate(seq.len() / tree.page_size()).unwrap();
    tree.insert(seq, &pages).unwrap()
}

proptest! {
    #[test]
    fn inserted_sequences_match_in_full(
        (page_size, seqs) in (1usize..=4).prop_flat_map(|ps| (Just(ps), sequences(ps, 12))),
    ) {
        let (mut tree, pool) = setup(page_size, EvictionPolicyKind::Lru, false);
        for seq in &seqs {
            cache(&mut tree, &pool, seq);
        }
        for seq in &seqs {
            let aligned = tree.aligned_len(seq.len());
            let m = tree.match_prefix(seq);
            prop_assert_eq!(m.matched_len, aligned);
            prop_assert_eq!(m.pages.len(), aligned / page_size);
        }
        tree.validate().unwrap();
        prop_assert_eq!(pool.allocated(), tree.total_pages());
    }

    #[test]
    fn matched_prefix_is_a_true_prefix(
        seqs in sequences(1, 10),
        query in sequence(1),
    ) {
        let (mut tree, pool) = setup(1, EvictionPolicyKind::Lru, false);
        for seq in &seqs {
            cache(&mut tree, &pool, seq);
        }
        let m = tree.match_prefix(&query);
        let best = seqs
            .iter()
            .map(|seq| seq.iter().zip(&query).take_while(|(a, b)| a == b).count())
            .max()
            .unwrap_or(0);
        prop_assert_eq!(m.matched_len, best);
    }

    #[test]
    fn lock_unlock_is_balanced(
        seqs in sequences(1, 10),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 1..20),
    ) {
        let (mut tree, pool) = setup(1, EvictionPolicyKind::Lru, false);
        let leaves: Vec<_> = seqs.iter().map(|seq| cache(&mut tree, &pool, seq).node).collect();

        let locked: Vec<_> = picks.iter().map(|idx| leaves[idx.index(leaves.len())]).collect();
        for &node in &locked {
            tree.lock(node).unwrap();
        }
        tree.validate().unwrap();
        for &node in locked.iter().rev() {
            tree.unlock(node).unwrap();
        }

        prop_assert_eq!(tree.protected_pages(), 0);
        prop_assert_eq!(tree.evictable_pages(), tree.total_pages());
        for &node in &leaves {
            if tree.contains(node) {
                prop_assert_eq!(tree.ref_count(node).unwrap(), 0);
            }
        }
    }

    #[test]
    fn eviction_spares_locked_nodes(
        seqs in sequences(1, 12),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..4),
        target in 0usize..64,
        policy in policy(),
        compact in any::<bool>(),
    ) {
        let (mut tree, pool) = setup(1, policy, compact);
        let leaves: Vec<_> = seqs.iter().map(|seq| cache(&mut tree, &pool, seq)).collect();

        let mut locked = Vec::new();
        for idx in &picks {
            let res = &leaves[idx.index(leaves.len())];
            let seq = tree.path_tokens(res.node).unwrap();
            tree.lock(res.node).unwrap();
            locked.push((res.node, seq));
        }

        let before = tree.total_pages();
        let protected = tree.protected_pages();
        let freed = tree.evict(target).unwrap();

        prop_assert!(tree.total_pages() <= before);
        prop_assert_eq!(before - tree.total_pages(), freed);
        prop_assert_eq!(tree.protected_pages(), protected);
        if freed < target {
            prop_assert_eq!(tree.evictable_pages(), 0);
        }
        for (node, seq) in &locked {
            prop_assert!(tree.contains(*node));
            prop_assert_eq!(tree.match_prefix(seq).matched_len, seq.len());
        }
        prop_assert_eq!(pool.allocated(), tree.total_pages());
        tree.validate().unwrap();
    }

    #[test]
    fn reinsertion_is_idempotent(
        (page_size, seqs) in (1usize..=3).prop_flat_map(|ps| (Just(ps), sequences(ps, 8))),
    ) {
        let (mut tree, pool) = setup(page_size, EvictionPolicyKind::Lru, false);
        for seq in &seqs {
            cache(&mut tree, &pool, seq);
        }
        let shape = tree.snapshot().shape();
        let pages = tree.total_pages();

        for seq in &seqs {
            let res = cache(&mut tree, &pool, seq);
            prop_assert_eq!(res.new_tokens, 0);
        }
        prop_assert_eq!(tree.snapshot().shape(), shape);
        prop_assert_eq!(tree.total_pages(), pages);
        prop_assert_eq!(pool.allocated(), pages);
    }
}
