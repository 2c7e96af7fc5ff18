//! Eviction and capacity enforcement

use super::{node::Node, NodeId, PrefixTree};
use crate::eviction::{EvictionCandidate, EvictionKey};
use kvtree_types::{KvTreeError, Result};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

impl PrefixTree {
    /// Evict unlocked leaves until at least `target_pages` pages are freed.
    ///
    /// Returns the pages actually freed, which is less than the target when
    /// the tree runs out of unlocked leaves. Never waits for a lock to drop.
    pub fn evict(&mut self, target_pages: usize) -> Result<usize> {
        if target_pages == 0 {
            return Ok(0);
        }

        let mut queue = self.evictable_leaves();
        let mut freed = 0;

        while freed < target_pages {
            let (_, victim) = match queue.pop_first() {
                Some(entry) => entry,
                None => break,
            };
            let parent = self.node(victim).parent;
            freed += self.remove_leaf(victim)?;

            let parent = match parent {
                Some(parent) if parent != Self::ROOT => parent,
                _ => continue,
            };

            let (is_leaf, locked, child_count) = {
                let node = self.node(parent);
                (node.is_leaf(), node.is_locked(), node.children.len())
            };
            if locked {
                continue;
            }
            if is_leaf {
                queue.insert(self.queue_entry(parent));
            } else if child_count == 1 && self.config.compact_on_evict {
                let child = *self
                    .node(parent)
                    .children
                    .values()
                    .next()
                    .expect("single-child parent has a child");
                // The merge changes the child's key, so re-rank it if queued
                let before = self.queue_entry(child);
                self.merge_into_child(parent);
                if queue.remove(&before) {
                    queue.insert(self.queue_entry(child));
                }
            }
        }

        self.evicted_pages += freed as u64;
        debug!(
            "Evicted {} pages (target {}), {} pages cached",
            freed, target_pages, self.total_pages
        );

        #[cfg(debug_assertions)]
        self.validate()?;

        Ok(freed)
    }

    /// Evict down to the configured capacity. Returns pages freed.
    pub fn enforce_capacity(&mut self) -> Result<usize> {
        if self.total_pages <= self.config.capacity {
            return Ok(0);
        }

        let excess = self.total_pages - self.config.capacity;
        let freed = self.evict(excess)?;
        if freed < excess {
            warn!(
                "Prefix tree over capacity by {} pages; remaining pages are locked",
                excess - freed
            );
        }
        Ok(freed)
    }

    /// Drop every node and return all pages. Fails while any node is locked.
    pub fn reset(&mut self) -> Result<()> {
        if self.protected_pages > 0 || self.nodes.iter().flatten().any(Node::is_locked) {
            return Err(KvTreeError::invalid_parameter(
                "Cannot reset prefix tree while nodes are locked",
            ));
        }

        let pages: Vec<_> = self
            .nodes
            .iter()
            .flatten()
            .flat_map(|node| node.value.iter().copied())
            .collect();
        self.allocator.free(&pages)?;

        self.nodes = vec![Some(Node::root())];
        self.free_slots.clear();
        self.total_pages = 0;
        self.evictable_pages = 0;
        self.protected_pages = 0;

        debug!("Reset prefix tree, released {} pages", pages.len());
        Ok(())
    }

    fn candidate(&self, id: NodeId) -> EvictionCandidate {
        let node = self.node(id);
        EvictionCandidate {
            node: id,
            last_used: node.last_used,
            created_at: node.created_at,
            hit_count: node.hit_count,
            pages: node.pages(),
        }
    }

    fn queue_entry(&self, id: NodeId) -> (EvictionKey, NodeId) {
        (self.strategy.eviction_key(&self.candidate(id)), id)
    }

    /// Unlocked leaves keyed by eviction order
    fn evictable_leaves(&self) -> BTreeSet<(EvictionKey, NodeId)> {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(slot, node)| {
                node.as_ref()
                    .filter(|node| node.is_leaf() && !node.is_locked())
                    .map(|_| self.queue_entry(NodeId(slot)))
            })
            .collect()
    }

    /// Detach an unlocked leaf and release its pages
    fn remove_leaf(&mut self, id: NodeId) -> Result<usize> {
        let (pages, parent, first) = {
            let node = self.node(id);
            if !node.is_leaf() || node.is_locked() || id == Self::ROOT {
                return Err(KvTreeError::invariant_violation(format!(
                    "{} is not an unlocked leaf",
                    id
                )));
            }
            (node.value.clone(), node.parent, self.first_page(&node.key))
        };

        self.allocator.free(&pages)?;

        if let Some(parent) = parent {
            self.node_mut(parent).children.remove(&first);
        }
        self.nodes[id.0] = None;
        self.free_slots.push(id.0);

        self.total_pages -= pages.len();
        self.evictable_pages -= pages.len();
        self.evicted_nodes += 1;

        trace!("Evicted {} ({} pages)", id, pages.len());
        Ok(pages.len())
    }

    /// Fold an unlocked single-child `parent` into that child.
    ///
    /// The child keeps its id and gains the parent's key and pages in front of
    /// its own.
    fn merge_into_child(&mut self, parent: NodeId) {
        let absorbed = self.nodes[parent.0]
            .take()
            .expect("merge target is a live node");
        self.free_slots.push(parent.0);

        let child = *absorbed
            .children
            .values()
            .next()
            .expect("merge target has exactly one child");
        let grandparent = absorbed
            .parent
            .expect("merge is never applied to the root");

        {
            let node = self.node_mut(child);
            let mut key = absorbed.key.clone();
            key.extend_from_slice(&node.key);
            node.key = key;

            let mut value = absorbed.value.clone();
            value.extend_from_slice(&node.value);
            node.value = value;

            node.parent = Some(grandparent);
            node.last_used = node.last_used.max(absorbed.last_used);
            node.created_at = node.created_at.min(absorbed.created_at);
            node.hit_count = node.hit_count.max(absorbed.hit_count);
        }

        // Same first page as before, so the grandparent's slot is simply repointed
        let first = self.first_page(&absorbed.key);
        self.node_mut(grandparent).children.insert(first, child);

        trace!("Merged {} into {}", parent, child);
    }
}
