//! The per-repository façade over the index store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{ensure, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::LamportClock;
use crate::entry::FileEntry;
use crate::keys::NodeId;
use crate::store::Store;

/// The file index of a single repository.
///
/// A `FileSet` binds one repository name to a shared [`Store`] and tracks,
/// per node, the files that node claims to hold, together with the derived
/// global view. Clones share state, so one set can be handed to the scanner,
/// the protocol layer and the puller alike.
///
/// Mutations serialize on an internal lock and commit atomically. Queries
/// never take that lock; each one reads from its own storage snapshot, so a
/// scan sees a consistent point in time but two scans may straddle a writer.
/// Iterator callbacks run with that snapshot pinned and must not call back
/// into the engine.
#[derive(Debug, Clone)]
pub struct FileSet {
    repo: String,
    store: Store,
    clock: Arc<LamportClock>,
    changes: Arc<Mutex<HashMap<NodeId, u64>>>,
}

impl FileSet {
    /// Binds repository `repo` to `store`. Creates no keys.
    ///
    /// Sets sharing one store must be given the same `clock`, otherwise
    /// tombstones synthesized in one repository may not outrank versions
    /// seen in another.
    pub fn new(repo: impl Into<String>, store: Store, clock: Arc<LamportClock>) -> Result<Self> {
        let repo = repo.into();
        ensure!(!repo.is_empty(), "repository name must not be empty");
        Ok(FileSet {
            repo,
            store,
            clock,
            changes: Default::default(),
        })
    }

    /// Replaces `node`'s file list with `files`, the complete new state:
    /// stored names the list omits are dropped. Listed entries overwrite the
    /// stored descriptor only when their version differs, so repeating a
    /// replace is a no-op.
    pub fn replace(&self, node: NodeId, files: Vec<FileEntry>) -> Result<()> {
        debug!(repo = %self.repo, node = %node, files = files.len(), "replace");
        let mut changes = self.changes.lock();
        if self
            .store
            .replace(self.repo.as_bytes(), &node, files, &self.clock)?
        {
            *changes.entry(node).or_default() += 1;
        }
        Ok(())
    }

    /// Like [`replace`](Self::replace), but when `node` is
    /// [`NodeId::LOCAL`] a stored name the list omits is rewritten as a
    /// tombstone with a fresh clock version instead of dropped: a local scan
    /// has proven the file gone, and the tombstone carries the deletion to
    /// every peer. The tombstone keeps the directory flag of the entry it
    /// replaces; entries that already are tombstones stay untouched.
    pub fn replace_with_delete(&self, node: NodeId, files: Vec<FileEntry>) -> Result<()> {
        debug!(repo = %self.repo, node = %node, files = files.len(), "replace_with_delete");
        let mut changes = self.changes.lock();
        if self
            .store
            .replace_with_delete(self.repo.as_bytes(), &node, files, &self.clock)?
        {
            *changes.entry(node).or_default() += 1;
        }
        Ok(())
    }

    /// Applies `files` additively to `node`'s table: stored names absent
    /// from the list survive. A listed entry overwrites on *any* version
    /// difference, lower versions included, mirroring the node's claim
    /// faithfully.
    pub fn update(&self, node: NodeId, files: Vec<FileEntry>) -> Result<()> {
        debug!(repo = %self.repo, node = %node, files = files.len(), "update");
        let mut changes = self.changes.lock();
        if self
            .store
            .update(self.repo.as_bytes(), &node, files, &self.clock)?
        {
            *changes.entry(node).or_default() += 1;
        }
        Ok(())
    }

    /// Visits every file `node` holds, tombstones included, in name order,
    /// until `visit` returns false. Returns the node's change cursor.
    ///
    /// `since` is reserved for filtered scans. The cursor is taken before
    /// the scan's snapshot, so motion between the two is re-observed by the
    /// next poll rather than lost.
    pub fn with_have(
        &self,
        node: NodeId,
        since: u64,
        visit: impl FnMut(FileEntry) -> bool,
    ) -> Result<u64> {
        let _ = since;
        debug!(repo = %self.repo, node = %node, "with_have");
        let cursor = self.changes(node);
        self.store.with_have(self.repo.as_bytes(), &node, visit)?;
        Ok(cursor)
    }

    /// Visits the winning descriptor of every name known in the repository,
    /// in name order, until `visit` returns false.
    pub fn with_global(&self, visit: impl FnMut(FileEntry) -> bool) -> Result<()> {
        debug!(repo = %self.repo, "with_global");
        self.store.with_global(self.repo.as_bytes(), visit)
    }

    /// Visits every winning descriptor `node` needs to become globally
    /// current, in name order, until `visit` returns false: names where the
    /// node's version is strictly below the winner's, excluding deletions of
    /// files the node never had and entries the scanner has not finished
    /// hashing.
    pub fn with_need(&self, node: NodeId, visit: impl FnMut(FileEntry) -> bool) -> Result<()> {
        debug!(repo = %self.repo, node = %node, "with_need");
        self.store.with_need(self.repo.as_bytes(), &node, visit)
    }

    /// The descriptor `node` stores for `name`, or the zero descriptor when
    /// the node does not hold the name.
    pub fn get(&self, node: NodeId, name: &str) -> Result<FileEntry> {
        self.store.get(self.repo.as_bytes(), &node, name.as_bytes())
    }

    /// The winning descriptor for `name`, or the zero descriptor when the
    /// name is unknown in the repository.
    pub fn get_global(&self, name: &str) -> Result<FileEntry> {
        self.store.get_global(self.repo.as_bytes(), name.as_bytes())
    }

    /// The nodes holding `name` at the winning version; empty for unknown
    /// names. Order is unspecified.
    pub fn availability(&self, name: &str) -> Result<Vec<NodeId>> {
        self.store
            .availability(self.repo.as_bytes(), name.as_bytes())
    }

    /// The change cursor for `node`: bumped by every mutation that touched
    /// storage, stable across no-ops. Process-local; resets on restart.
    pub fn changes(&self, node: NodeId) -> u64 {
        self.changes.lock().get(&node).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::entry::{Block, FLAG_DELETED, FLAG_DIRECTORY};

    const REMOTE: NodeId = NodeId::from_bytes([0xaa; 32]);

    fn gen_blocks(n: usize) -> Vec<Block> {
        (0..n)
            .map(|i| Block {
                offset: i as i64,
                size: i as u32,
                hash: (0..32).map(|j| (i + j) as u8).collect(),
            })
            .collect()
    }

    fn file(name: &str, version: u64, blocks: usize) -> FileEntry {
        FileEntry {
            name: name.into(),
            version,
            blocks: gen_blocks(blocks),
            ..Default::default()
        }
    }

    fn tombstone(name: &str, version: u64, extra_flags: u32) -> FileEntry {
        FileEntry {
            name: name.into(),
            version,
            flags: FLAG_DELETED | extra_flags,
            ..Default::default()
        }
    }

    fn new_set() -> FileSet {
        FileSet::new(
            "test",
            Store::memory().unwrap(),
            Arc::new(LamportClock::new()),
        )
        .unwrap()
    }

    fn global_list(set: &FileSet) -> Vec<FileEntry> {
        let mut out = Vec::new();
        set.with_global(|entry| {
            out.push(entry);
            true
        })
        .unwrap();
        out
    }

    fn have_list(set: &FileSet, node: NodeId) -> Vec<FileEntry> {
        let mut out = Vec::new();
        set.with_have(node, 0, |entry| {
            out.push(entry);
            true
        })
        .unwrap();
        out
    }

    fn need_list(set: &FileSet, node: NodeId) -> Vec<FileEntry> {
        let mut out = Vec::new();
        set.with_need(node, |entry| {
            out.push(entry);
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn empty_repo_name_is_rejected() {
        let store = Store::memory().unwrap();
        assert!(FileSet::new("", store, Arc::new(LamportClock::new())).is_err());
    }

    #[test]
    fn global_set() {
        let set = new_set();

        let local0 = vec![
            file("a", 1000, 1),
            file("b", 1000, 2),
            file("c", 1000, 3),
            file("d", 1000, 4),
            file("z", 1000, 8),
        ];
        let local1 = vec![
            file("a", 1000, 1),
            file("b", 1000, 2),
            file("c", 1000, 3),
            file("d", 1000, 4),
        ];
        let local_tot = vec![
            local1[0].clone(),
            local1[1].clone(),
            local1[2].clone(),
            local1[3].clone(),
            tombstone("z", 1001, 0),
        ];

        let remote0 = vec![file("a", 1000, 1), file("b", 1000, 2), file("c", 1002, 5)];
        let remote1 = vec![file("b", 1001, 6), file("e", 1000, 7)];
        let remote_tot = vec![
            remote0[0].clone(),
            remote1[0].clone(),
            remote0[2].clone(),
            remote1[1].clone(),
        ];

        let expected_global = vec![
            remote0[0].clone(),
            remote1[0].clone(),
            remote0[2].clone(),
            local_tot[3].clone(),
            remote1[1].clone(),
            local_tot[4].clone(),
        ];

        let expected_local_need = vec![remote1[0].clone(), remote0[2].clone(), remote1[1].clone()];
        let expected_remote_need = vec![local1[3].clone()];

        set.replace_with_delete(NodeId::LOCAL, local0).unwrap();
        set.replace_with_delete(NodeId::LOCAL, local1).unwrap();
        set.replace(REMOTE, remote0).unwrap();
        set.update(REMOTE, remote1.clone()).unwrap();

        assert_eq!(global_list(&set), expected_global);
        assert_eq!(have_list(&set, NodeId::LOCAL), local_tot);
        assert_eq!(have_list(&set, REMOTE), remote_tot);
        assert_eq!(need_list(&set, NodeId::LOCAL), expected_local_need);
        assert_eq!(need_list(&set, REMOTE), expected_remote_need);

        assert_eq!(set.get(NodeId::LOCAL, "b").unwrap(), local_tot[1]);
        assert_eq!(set.get(REMOTE, "b").unwrap(), remote1[0]);
        assert_eq!(set.get_global("b").unwrap(), remote1[0]);

        // point misses are empty descriptors, not errors
        assert!(set.get(NodeId::LOCAL, "zz").unwrap().is_empty());
        assert!(set.get_global("zz").unwrap().is_empty());

        let mut avail = set.availability("a").unwrap();
        avail.sort();
        assert_eq!(avail, vec![REMOTE, NodeId::LOCAL]);
        assert_eq!(set.availability("b").unwrap(), vec![REMOTE]);
        assert_eq!(set.availability("d").unwrap(), vec![NodeId::LOCAL]);
        assert!(set.availability("absent").unwrap().is_empty());
    }

    #[test]
    fn local_deleted() {
        let set = new_set();

        let mut local1 = vec![
            file("a", 1000, 0),
            file("b", 1000, 0),
            file("c", 1000, 0),
            file("d", 1000, 0),
            file("z", 1000, 0),
        ];
        local1[4].flags = FLAG_DIRECTORY;

        set.replace_with_delete(NodeId::LOCAL, local1.clone()).unwrap();

        set.replace_with_delete(
            NodeId::LOCAL,
            vec![
                local1[0].clone(),
                // b removed
                local1[2].clone(),
                local1[3].clone(),
                local1[4].clone(),
            ],
        )
        .unwrap();
        set.replace_with_delete(
            NodeId::LOCAL,
            vec![
                local1[0].clone(),
                local1[2].clone(),
                // d removed
                local1[4].clone(),
            ],
        )
        .unwrap();
        set.replace_with_delete(
            NodeId::LOCAL,
            vec![
                local1[0].clone(),
                local1[2].clone(),
                // z removed
            ],
        )
        .unwrap();

        let expected_global = vec![
            local1[0].clone(),
            tombstone("b", 1001, 0),
            local1[2].clone(),
            tombstone("d", 1002, 0),
            tombstone("z", 1003, FLAG_DIRECTORY),
        ];
        assert_eq!(global_list(&set), expected_global);

        set.replace_with_delete(
            NodeId::LOCAL,
            vec![
                local1[0].clone(),
                // c removed
            ],
        )
        .unwrap();

        let expected_global = vec![
            local1[0].clone(),
            tombstone("b", 1001, 0),
            tombstone("c", 1004, 0),
            tombstone("d", 1002, 0),
            tombstone("z", 1003, FLAG_DIRECTORY),
        ];
        assert_eq!(global_list(&set), expected_global);
    }

    #[test]
    fn global_reset() {
        let set = new_set();

        let local = vec![
            file("a", 1000, 0),
            file("b", 1000, 0),
            file("c", 1000, 0),
            file("d", 1000, 0),
        ];
        let remote = vec![
            file("a", 1000, 0),
            file("b", 1001, 0),
            file("c", 1002, 0),
            file("e", 1000, 0),
        ];

        set.replace_with_delete(NodeId::LOCAL, local.clone()).unwrap();
        assert_eq!(global_list(&set), local);

        set.replace(REMOTE, remote).unwrap();
        set.replace(REMOTE, Vec::new()).unwrap();

        assert_eq!(global_list(&set), local);
    }

    #[test]
    fn need() {
        let set = new_set();

        let local = vec![
            file("a", 1000, 1),
            file("b", 1000, 1),
            file("c", 1000, 1),
            file("d", 1000, 1),
        ];
        let remote = vec![
            file("a", 1000, 1),
            file("b", 1001, 2),
            file("c", 1002, 3),
            file("e", 1000, 4),
            // deletion of a file the local node never had: not needed
            tombstone("f", 1005, 0),
            // placeholder still being hashed by the remote scanner: not needed
            file("g", 1001, 0),
        ];

        let should_need = vec![remote[1].clone(), remote[2].clone(), remote[3].clone()];

        set.replace_with_delete(NodeId::LOCAL, local).unwrap();
        set.replace(REMOTE, remote).unwrap();

        assert_eq!(need_list(&set, NodeId::LOCAL), should_need);
    }

    #[test]
    fn need_applies_tombstones_for_held_files() {
        let set = new_set();

        set.replace(REMOTE, vec![file("a", 1000, 1)]).unwrap();
        set.replace_with_delete(NodeId::LOCAL, vec![file("a", 1000, 1)])
            .unwrap();
        set.replace_with_delete(NodeId::LOCAL, Vec::new()).unwrap();

        // the remote still holds a copy, so it needs the deletion
        let need = need_list(&set, REMOTE);
        assert_eq!(need.len(), 1);
        assert!(need[0].is_deleted());
        assert_eq!(need[0].name, "a");
        // a third node that never held the file does not
        assert!(need_list(&set, NodeId::from_bytes([0xbb; 32])).is_empty());
    }

    #[test]
    fn changes_counter() {
        let set = new_set();

        let local1 = vec![
            file("a", 1000, 0),
            file("b", 1000, 0),
            file("c", 1000, 0),
            file("d", 1000, 0),
        ];
        let local2 = vec![
            local1[0].clone(),
            // b deleted
            local1[2].clone(),
            file("d", 1002, 0),
            file("e", 1000, 0),
        ];

        set.replace_with_delete(NodeId::LOCAL, local1).unwrap();
        let c0 = set.changes(NodeId::LOCAL);

        set.replace_with_delete(NodeId::LOCAL, local2.clone()).unwrap();
        let c1 = set.changes(NodeId::LOCAL);
        assert!(c1 > c0, "change cursor should have advanced");

        set.replace_with_delete(NodeId::LOCAL, local2).unwrap();
        let c2 = set.changes(NodeId::LOCAL);
        assert_eq!(c2, c1, "identical replace must not advance the cursor");

        // the cursor is also what with_have reports
        let cursor = set.with_have(NodeId::LOCAL, 0, |_| true).unwrap();
        assert_eq!(cursor, c2);
    }

    #[test]
    fn tombstone_outranks_every_known_version() {
        let set = new_set();

        set.replace(REMOTE, vec![file("x", 5000, 1)]).unwrap();
        set.replace_with_delete(NodeId::LOCAL, vec![file("x", 1000, 1)])
            .unwrap();
        set.replace_with_delete(NodeId::LOCAL, Vec::new()).unwrap();

        let tomb = set.get(NodeId::LOCAL, "x").unwrap();
        assert!(tomb.is_deleted());
        assert!(
            tomb.version > 5000,
            "tombstone at {} does not outrank the remote copy",
            tomb.version
        );
        assert_eq!(set.get_global("x").unwrap(), tomb);
    }

    #[test]
    fn update_is_additive() {
        let set = new_set();

        let initial = vec![file("a", 1000, 1), file("b", 1000, 2)];
        set.update(REMOTE, initial.clone()).unwrap();
        set.update(REMOTE, vec![file("c", 1000, 3)]).unwrap();

        let have = have_list(&set, REMOTE);
        assert_eq!(have.len(), 3);
        assert_eq!(have[0], initial[0]);
        assert_eq!(have[1], initial[1]);

        // unchanged versions are no-ops and do not advance the cursor
        let before = set.changes(REMOTE);
        set.update(REMOTE, initial).unwrap();
        assert_eq!(set.changes(REMOTE), before);
    }

    #[test]
    fn clones_share_state() {
        let set = new_set();
        let other = set.clone();

        set.replace(REMOTE, vec![file("a", 1000, 1)]).unwrap();
        assert_eq!(other.changes(REMOTE), set.changes(REMOTE));
        assert_eq!(other.get(REMOTE, "a").unwrap().version, 1000);
    }

    #[test]
    fn concurrent_readers_never_see_partial_batches() {
        let set = new_set();
        let odd = vec![file("a", 1, 1), file("b", 1, 1), file("c", 1, 1)];
        let even = vec![file("a", 2, 1), file("d", 2, 1)];
        set.replace(REMOTE, odd.clone()).unwrap();

        std::thread::scope(|scope| {
            let writer = set.clone();
            let odd = odd.clone();
            let even = even.clone();
            scope.spawn(move || {
                for i in 0..50 {
                    let files = if i % 2 == 0 { even.clone() } else { odd.clone() };
                    writer.replace(REMOTE, files).unwrap();
                }
            });
            for _ in 0..2 {
                let reader = set.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        let names: Vec<_> =
                            have_list(&reader, REMOTE).into_iter().map(|f| f.name).collect();
                        // each snapshot holds exactly one committed state
                        assert!(
                            names == ["a", "b", "c"] || names == ["a", "d"],
                            "torn read: {names:?}"
                        );
                    }
                });
            }
        });
    }

    const PROP_NODES: [NodeId; 3] = [
        NodeId::LOCAL,
        NodeId::from_bytes([0x11; 32]),
        NodeId::from_bytes([0x22; 32]),
    ];
    const PROP_NAMES: [&str; 5] = ["a", "b", "c", "d", "e"];

    #[derive(Debug, Clone)]
    enum Op {
        Replace(usize, Vec<FileEntry>),
        ReplaceWithDelete(usize, Vec<FileEntry>),
        Update(usize, Vec<FileEntry>),
    }

    fn arb_files() -> impl Strategy<Value = Vec<FileEntry>> {
        prop::collection::vec((0..PROP_NAMES.len(), 1..40u64, prop::bool::ANY), 0..6).prop_map(
            |specs| {
                specs
                    .into_iter()
                    .map(|(name, version, deleted)| {
                        if deleted {
                            tombstone(PROP_NAMES[name], version, 0)
                        } else {
                            file(PROP_NAMES[name], version, 1 + name)
                        }
                    })
                    .collect()
            },
        )
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        (0..PROP_NODES.len(), arb_files(), 0..3u8).prop_map(|(node, files, kind)| match kind {
            0 => Op::Replace(node, files),
            1 => Op::ReplaceWithDelete(node, files),
            _ => Op::Update(node, files),
        })
    }

    /// Re-derives the global view from the per-node tables and checks it
    /// against what the set reports: winner-is-max with the node tie-break,
    /// presence, availability, and the need rule.
    fn check_invariants(
        set: &FileSet,
    ) -> std::result::Result<(), proptest::test_runner::TestCaseError> {
        use std::collections::{BTreeMap, BTreeSet};

        let mut per_node: BTreeMap<NodeId, BTreeMap<String, FileEntry>> = BTreeMap::new();
        for node in PROP_NODES {
            let files = have_list(set, node);
            per_node.insert(node, files.into_iter().map(|f| (f.name.clone(), f)).collect());
        }

        let global = global_list(set);

        // presence: a name is global iff some node holds it
        let global_names: BTreeSet<_> = global.iter().map(|f| f.name.clone()).collect();
        let held_names: BTreeSet<_> = per_node
            .values()
            .flat_map(|files| files.keys().cloned())
            .collect();
        prop_assert_eq!(&global_names, &held_names);

        for winner in &global {
            let holders: Vec<(&NodeId, &FileEntry)> = per_node
                .iter()
                .filter_map(|(node, files)| files.get(&winner.name).map(|f| (node, f)))
                .collect();

            // winner-is-max over every per-node record
            let max_version = holders.iter().map(|(_, f)| f.version).max().unwrap_or(0);
            prop_assert_eq!(winner.version, max_version);

            // the stored descriptor is the byte-wise smallest node's copy
            let winner_node = holders
                .iter()
                .filter(|(_, f)| f.version == max_version)
                .map(|(node, _)| **node)
                .min();
            prop_assert_eq!(Some(winner), winner_node.and_then(|n| {
                per_node.get(&n).and_then(|files| files.get(&winner.name))
            }));

            // availability: exactly the nodes at the winning version
            let mut expected: Vec<NodeId> = holders
                .iter()
                .filter(|(_, f)| f.version == max_version)
                .map(|(node, _)| **node)
                .collect();
            expected.sort();
            let mut actual = set.availability(&winner.name).unwrap();
            actual.sort();
            prop_assert_eq!(expected, actual);
        }

        // need: strictly-below-winner, minus never-held deletions and
        // placeholders
        for node in PROP_NODES {
            let files = &per_node[&node];
            let expected: Vec<FileEntry> = global
                .iter()
                .filter(|winner| {
                    let have = files.get(&winner.name).map(|f| f.version).unwrap_or(0);
                    have < winner.version
                        && !(winner.is_deleted() && have == 0)
                        && !winner.is_placeholder()
                })
                .cloned()
                .collect();
            prop_assert_eq!(expected, need_list(set, node));
        }

        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn index_invariants(ops in prop::collection::vec(arb_op(), 1..12)) {
            let set = new_set();
            for op in ops {
                match op {
                    Op::Replace(node, files) => set.replace(PROP_NODES[node], files).unwrap(),
                    Op::ReplaceWithDelete(node, files) => {
                        set.replace_with_delete(PROP_NODES[node], files).unwrap()
                    }
                    Op::Update(node, files) => set.update(PROP_NODES[node], files).unwrap(),
                }
            }
            check_invariants(&set)?;
        }
    }
}
