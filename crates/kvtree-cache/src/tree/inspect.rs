//! Read-only views of the tree: snapshots, text dumps, stats and invariant checks

use super::{NodeId, PrefixTree};
use kvtree_types::{KvTreeError, Result, TokenId, Tokenizer};
use serde::Serialize;
use std::fmt::Write;

/// Serializable copy of a subtree
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub tokens: Vec<TokenId>,
    pub key_len: usize,
    pub pages: usize,
    pub ref_count: usize,
    pub last_used: u64,
    /// In lexical order of their first page
    pub children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    /// `(depth, key)` per node in pre-order, ignoring ids and timestamps
    pub fn shape(&self) -> Vec<(usize, Vec<TokenId>)> {
        let mut out = Vec::new();
        self.collect_shape(0, &mut out);
        out
    }

    fn collect_shape(&self, depth: usize, out: &mut Vec<(usize, Vec<TokenId>)>) {
        out.push((depth, self.tokens.clone()));
        for child in &self.children {
            child.collect_shape(depth + 1, out);
        }
    }
}

/// Prefix tree statistics
#[derive(Debug, Clone, Serialize)]
pub struct PrefixTreeStats {
    pub node_count: usize,
    pub total_pages: usize,
    pub cached_tokens: usize,
    pub evictable_pages: usize,
    pub protected_pages: usize,
    pub capacity: usize,
    pub evicted_pages: u64,
    pub evicted_nodes: u64,
    pub splits: u64,
}

impl PrefixTreeStats {
    /// Get utilization percentage of the configured capacity
    pub fn utilization(&self) -> f32 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.total_pages as f32 / self.capacity as f32) * 100.0
        }
    }
}

impl PrefixTree {
    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot_of(Self::ROOT)
    }

    fn snapshot_of(&self, id: NodeId) -> NodeSnapshot {
        let node = self.node(id);
        NodeSnapshot {
            id,
            tokens: node.key.clone(),
            key_len: node.key.len(),
            pages: node.pages(),
            ref_count: node.ref_count,
            last_used: node.last_used,
            children: node
                .children
                .values()
                .map(|&child| self.snapshot_of(child))
                .collect(),
        }
    }

    pub fn snapshot_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Indented dump, one `<key> (refs=N)` line per node.
    ///
    /// Keys are decoded through `tokenizer` when one is given, otherwise
    /// printed as raw token ids.
    pub fn render(&self, tokenizer: Option<&dyn Tokenizer>) -> String {
        let mut out = String::new();
        self.render_node(Self::ROOT, 0, tokenizer, &mut out);
        out
    }

    fn render_node(
        &self,
        id: NodeId,
        depth: usize,
        tokenizer: Option<&dyn Tokenizer>,
        out: &mut String,
    ) {
        let node = self.node(id);
        let indent = "  ".repeat(depth);
        if id == Self::ROOT {
            let _ = writeln!(out, "{}<root>", indent);
        } else {
            let label = match tokenizer {
                Some(tok) => format!("{:?}", tok.decode(&node.key)),
                None => format!(
                    "{:?}",
                    node.key.iter().map(|t| t.get()).collect::<Vec<_>>()
                ),
            };
            let _ = writeln!(out, "{}{} (refs={})", indent, label, node.ref_count);
        }

        for &child in node.children.values() {
            self.render_node(child, depth + 1, tokenizer, out);
        }
    }

    pub fn stats(&self) -> PrefixTreeStats {
        PrefixTreeStats {
            node_count: self.node_count(),
            total_pages: self.total_pages,
            cached_tokens: self.cached_tokens(),
            evictable_pages: self.evictable_pages,
            protected_pages: self.protected_pages,
            capacity: self.config.capacity,
            evicted_pages: self.evicted_pages,
            evicted_nodes: self.evicted_nodes,
            splits: self.splits,
        }
    }

    /// Check structural and accounting invariants
    pub fn validate(&self) -> Result<()> {
        let ps = self.config.page_size;
        let root = self.get(Self::ROOT)?;
        if !root.key.is_empty() || !root.value.is_empty() || root.parent.is_some() {
            return Err(violation("root must have an empty key and no parent"));
        }
        if root.ref_count != 0 {
            return Err(violation("root must never be locked"));
        }

        let mut reachable = 0;
        let mut total = 0;
        let mut protected = 0;
        let mut stack = vec![Self::ROOT];

        while let Some(id) = stack.pop() {
            let node = self.get(id)?;
            reachable += 1;

            if id != Self::ROOT {
                if node.key.is_empty() || node.key.len() % ps != 0 {
                    return Err(violation(format!(
                        "{} has key of {} tokens with page size {}",
                        id,
                        node.key.len(),
                        ps
                    )));
                }
                if node.value.len() * ps != node.key.len() {
                    return Err(violation(format!(
                        "{} holds {} pages for {} tokens",
                        id,
                        node.value.len(),
                        node.key.len()
                    )));
                }
                total += node.pages();
                if node.is_locked() {
                    protected += node.pages();
                }
            }

            let mut child_refs = 0;
            for (first, &child) in &node.children {
                let child_node = self.get(child)?;
                if child_node.parent != Some(id) {
                    return Err(violation(format!(
                        "{} is listed under {} but links to {:?}",
                        child, id, child_node.parent
                    )));
                }
                if child_node.key.len() < ps || child_node.key[..ps] != first[..] {
                    return Err(violation(format!(
                        "{} is filed under the wrong first page in {}",
                        child, id
                    )));
                }
                child_refs += child_node.ref_count;
                stack.push(child);
            }

            if id != Self::ROOT && node.ref_count < child_refs {
                return Err(violation(format!(
                    "{} has {} locks but its children hold {}",
                    id, node.ref_count, child_refs
                )));
            }
        }

        if reachable != self.node_count() {
            return Err(violation(format!(
                "{} nodes reachable from the root, {} live",
                reachable,
                self.node_count()
            )));
        }
        if total != self.total_pages
            || protected != self.protected_pages
            || total - protected != self.evictable_pages
        {
            return Err(violation(format!(
                "page accounting drifted: counted {} total {} protected, \
                 tracked {} total {} protected {} evictable",
                total,
                protected,
                self.total_pages,
                self.protected_pages,
                self.evictable_pages
            )));
        }

        Ok(())
    }
}

fn violation(message: impl Into<String>) -> KvTreeError {
    KvTreeError::invariant_violation(message)
}
