//! Range bounds on the index tables.
//!
//! Every query is a single contiguous scan. A scan is bounded below by its
//! (repo, node) or (repo) prefix and above by the smallest key outside that
//! prefix: the fixed-width node element is incremented byte-wise, while the
//! variable-width repo element takes its immediate successor in byte-string
//! order, the prefix with a zero byte appended.

use std::ops::Bound;

use bytes::Bytes;

use crate::keys::NodeId;

use super::tables::{GlobalId, NodeFileId};

/// Owned form of [`NodeFileId`].
pub(super) type NodeFileIdOwned = (Bytes, [u8; 32], Bytes);

/// Owned form of [`GlobalId`].
pub(super) type GlobalIdOwned = (Bytes, Bytes);

/// Bounds on the per-node file table.
pub(super) struct NodeFilesBounds(Bound<NodeFileIdOwned>, Bound<NodeFileIdOwned>);

impl NodeFilesBounds {
    /// All files of `node` within `repo`, in name order.
    pub fn node(repo: &[u8], node: &NodeId) -> Self {
        let repo = Bytes::copy_from_slice(repo);
        let node = *node.as_bytes();
        let start = Bound::Included((repo.clone(), node, Bytes::new()));
        let mut node_end = node;
        let end = if increment_by_one(&mut node_end) {
            Bound::Excluded((repo, node_end, Bytes::new()))
        } else {
            // node is all 0xff (the local node): roll over into the next repo
            Bound::Excluded((successor(&repo), [0u8; 32], Bytes::new()))
        };
        Self(start, end)
    }

    pub fn as_ref(&self) -> (Bound<NodeFileId>, Bound<NodeFileId>) {
        fn map(id: &NodeFileIdOwned) -> NodeFileId {
            (&id.0[..], &id.1, &id.2[..])
        }
        (map_bound(&self.0, map), map_bound(&self.1, map))
    }
}

/// Bounds on the global index table.
pub(super) struct GlobalBounds(Bound<GlobalIdOwned>, Bound<GlobalIdOwned>);

impl GlobalBounds {
    /// All names known within `repo`, in name order.
    pub fn repo(repo: &[u8]) -> Self {
        let repo = Bytes::copy_from_slice(repo);
        let start = Bound::Included((repo.clone(), Bytes::new()));
        let end = Bound::Excluded((successor(&repo), Bytes::new()));
        Self(start, end)
    }

    pub fn as_ref(&self) -> (Bound<GlobalId>, Bound<GlobalId>) {
        fn map(id: &GlobalIdOwned) -> GlobalId {
            (&id.0[..], &id.1[..])
        }
        (map_bound(&self.0, map), map_bound(&self.1, map))
    }
}

/// Increment a fixed-width byte string by one, starting at the last byte
/// that is not 255.
///
/// Returns false if all bytes are 255.
fn increment_by_one(value: &mut [u8]) -> bool {
    for byte in value.iter_mut().rev() {
        if *byte != 255 {
            *byte += 1;
            return true;
        }
        *byte = 0;
    }
    false
}

/// The immediate successor of a byte string in lexicographic order. Unlike
/// incrementing, this also excludes longer strings extending the prefix.
fn successor(value: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value);
    out.push(0);
    out.into()
}

fn map_bound<'a, T, U: 'a>(bound: &'a Bound<T>, f: impl Fn(&'a T) -> U) -> Bound<U> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(t) => Bound::Included(f(t)),
        Bound::Excluded(t) => Bound::Excluded(f(t)),
    }
}
