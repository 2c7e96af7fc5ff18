//! Arena node of the prefix tree

use kvtree_types::{PageId, TokenId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;

/// Stable index of a node in the tree arena
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// First page of a child's key, used to pick the child during descent
pub(crate) type ChildKey = SmallVec<[TokenId; 4]>;

/// Pages owned by a node, one per page of its key
pub(crate) type PageList = SmallVec<[PageId; 8]>;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// Edge label from the parent; page aligned, empty only for the root
    pub key: Vec<TokenId>,
    /// Cached state for `key`
    pub value: PageList,
    /// Children by first page. Ordered so dumps come out lexically.
    pub children: BTreeMap<ChildKey, NodeId>,
    /// Non-owning back link, `None` only for the root
    pub parent: Option<NodeId>,
    /// Requests depending on this node or anything below it
    pub ref_count: usize,
    pub last_used: u64,
    pub created_at: u64,
    pub hit_count: u64,
}

impl Node {
    pub fn root() -> Self {
        Self::new(Vec::new(), PageList::new(), None, 0)
    }

    pub fn new(key: Vec<TokenId>, value: PageList, parent: Option<NodeId>, now: u64) -> Self {
        Self {
            key,
            value,
            children: BTreeMap::new(),
            parent,
            ref_count: 0,
            last_used: now,
            created_at: now,
            hit_count: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.ref_count > 0
    }

    pub fn pages(&self) -> usize {
        self.value.len()
    }
}
