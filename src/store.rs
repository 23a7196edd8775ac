//! Persistent storage for the file index.
//!
//! One [`Store`] wraps one redb database and is shared by every repository
//! (and every [`FileSet`](crate::FileSet)) in the process. Two tables carry
//! the index, both keyed with a leading repo prefix so repositories never
//! observe each other:
//!
//! * `node-files`: `(repo, node, name)` → encoded [`FileEntry`]. The
//!   authoritative record of what each node claims to hold.
//! * `global-files`: `(repo, name)` → encoded [`GlobalRecord`]: the winning
//!   descriptor for the name plus the list of holding nodes. Derived from the
//!   node-files table and rewritten for every name a mutation touches.
//!
//! Each bulk mutation runs in a single write transaction. Reads open a read
//! transaction, scan it, and drop it; redb's MVCC makes that a consistent
//! point-in-time snapshot that never blocks writers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable};
use tracing::trace;

use crate::clock::LamportClock;
use crate::entry::{FileEntry, FLAG_DELETED, FLAG_DIRECTORY};
use crate::keys::NodeId;

mod bounds;
mod tables;

use self::bounds::{GlobalBounds, NodeFilesBounds};
use self::tables::{GlobalRecord, Holder, NodeFileId, ReadOnlyTables, Tables};

/// Handle to the shared index database.
///
/// Cheap to clone; all clones share the database. A store outlives the
/// repositories indexed in it and never assumes it is the only user of the
/// underlying file.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Creates a store backed by memory. For tests and ephemeral indexes.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::new(db)
    }

    /// Creates or opens a store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Database::create(path)?)
    }

    /// Wraps an already opened database.
    pub fn new(db: Database) -> Result<Self> {
        // Create all tables up front so read transactions never race table
        // creation.
        let tx = db.begin_write()?;
        let _ = Tables::new(&tx)?;
        tx.commit()?;
        Ok(Store { db: Arc::new(db) })
    }

    /// Replaces `node`'s file list with `files`, dropping stored names the
    /// list omits. Returns whether any key was written or deleted.
    pub(crate) fn replace(
        &self,
        repo: &[u8],
        node: &NodeId,
        files: Vec<FileEntry>,
        clock: &LamportClock,
    ) -> Result<bool> {
        self.replace_inner(repo, node, files, Removal::Drop, clock)
    }

    /// Like [`replace`](Self::replace), but for the local node a stored name
    /// the list omits is rewritten as a tombstone instead of deleted: the
    /// local scan has proven the file gone, and the tombstone's fresh version
    /// carries that fact to every peer.
    pub(crate) fn replace_with_delete(
        &self,
        repo: &[u8],
        node: &NodeId,
        files: Vec<FileEntry>,
        clock: &LamportClock,
    ) -> Result<bool> {
        self.replace_inner(repo, node, files, Removal::Tombstone, clock)
    }

    fn replace_inner(
        &self,
        repo: &[u8],
        node: &NodeId,
        mut files: Vec<FileEntry>,
        removal: Removal,
        clock: &LamportClock,
    ) -> Result<bool> {
        // Sorting the input lets the diff below run as a linear merge with
        // the stored range, which redb yields in name order.
        files.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        let tombstones = removal == Removal::Tombstone && *node == NodeId::LOCAL;

        let tx = self.db.begin_write()?;
        let mut changed = false;
        {
            let mut tables = Tables::new(&tx)?;
            let existing = scan_node_files(&tables.node_files, repo, node)?;
            let mut pending = PendingGlobal::default();

            let mut stored = existing.into_iter();
            let mut incoming = files.into_iter();
            let mut old = stored.next();
            let mut new = incoming.next();
            while old.is_some() || new.is_some() {
                let ord = match (&old, &new) {
                    (Some(o), Some(n)) => o.name.as_bytes().cmp(n.name.as_bytes()),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => unreachable!(),
                };
                match ord {
                    // stored name missing from the incoming list
                    Ordering::Less => {
                        if let Some(o) = old.take() {
                            if tombstones {
                                // Entries that are already tombstones stay
                                // untouched; re-stamping them would advance
                                // the version and the change counter on
                                // every rescan.
                                if !o.is_deleted() {
                                    clock.witness(o.version);
                                    let tomb = FileEntry {
                                        version: clock.tick(),
                                        flags: FLAG_DELETED | (o.flags & FLAG_DIRECTORY),
                                        blocks: Vec::new(),
                                        ..o
                                    };
                                    write_entry(&mut tables, &mut pending, repo, node, &tomb, clock)?;
                                    changed = true;
                                }
                            } else {
                                tables
                                    .node_files
                                    .remove((repo, node.as_bytes(), o.name.as_bytes()))?;
                                pending.delete(o.name.as_bytes(), node);
                                changed = true;
                            }
                        }
                        old = stored.next();
                    }
                    // incoming name not yet stored
                    Ordering::Greater => {
                        if let Some(n) = new.take() {
                            write_entry(&mut tables, &mut pending, repo, node, &n, clock)?;
                            changed = true;
                        }
                        new = incoming.next();
                    }
                    Ordering::Equal => {
                        if let (Some(o), Some(n)) = (old.take(), new.take()) {
                            if o.version != n.version {
                                write_entry(&mut tables, &mut pending, repo, node, &n, clock)?;
                                changed = true;
                            }
                        }
                        old = stored.next();
                        new = incoming.next();
                    }
                }
            }

            pending.resolve(repo, &mut tables)?;
        }
        trace!(node = %node, changed, "replace batch");
        if changed {
            tx.commit()?;
        } else {
            tx.abort()?;
        }
        Ok(changed)
    }

    /// Additively applies `files` to `node`'s table: stored names absent from
    /// the list survive, listed entries overwrite on any version difference.
    /// Returns whether any key was written.
    pub(crate) fn update(
        &self,
        repo: &[u8],
        node: &NodeId,
        files: Vec<FileEntry>,
        clock: &LamportClock,
    ) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let mut changed = false;
        {
            let mut tables = Tables::new(&tx)?;
            let mut pending = PendingGlobal::default();
            for file in &files {
                let unchanged = {
                    let stored = tables
                        .node_files
                        .get((repo, node.as_bytes(), file.name.as_bytes()))?;
                    match stored {
                        Some(value) => {
                            postcard::from_bytes::<FileEntry>(value.value())?.version
                                == file.version
                        }
                        None => false,
                    }
                };
                if unchanged {
                    continue;
                }
                write_entry(&mut tables, &mut pending, repo, node, file, clock)?;
                changed = true;
            }
            pending.resolve(repo, &mut tables)?;
        }
        trace!(node = %node, changed, "update batch");
        if changed {
            tx.commit()?;
        } else {
            tx.abort()?;
        }
        Ok(changed)
    }

    /// Visits every file `node` holds, in name order, tombstones included.
    pub(crate) fn with_have(
        &self,
        repo: &[u8],
        node: &NodeId,
        mut visit: impl FnMut(FileEntry) -> bool,
    ) -> Result<()> {
        let tables = self.read_tables()?;
        let bounds = NodeFilesBounds::node(repo, node);
        for item in tables.node_files.range(bounds.as_ref())? {
            let (_id, value) = item?;
            let entry: FileEntry = postcard::from_bytes(value.value())?;
            if !visit(entry) {
                break;
            }
        }
        Ok(())
    }

    /// Visits the winning descriptor of every name known in the repository,
    /// in name order.
    pub(crate) fn with_global(
        &self,
        repo: &[u8],
        mut visit: impl FnMut(FileEntry) -> bool,
    ) -> Result<()> {
        let tables = self.read_tables()?;
        for item in tables.global_files.range(GlobalBounds::repo(repo).as_ref())? {
            let (_id, value) = item?;
            let record: GlobalRecord = postcard::from_bytes(value.value())?;
            if !visit(record.entry) {
                break;
            }
        }
        Ok(())
    }

    /// Visits every winning descriptor `node` lacks: names where the node's
    /// version is strictly below the winner's, except deletions of files the
    /// node never had, and placeholders the scanner has not finished hashing.
    pub(crate) fn with_need(
        &self,
        repo: &[u8],
        node: &NodeId,
        mut visit: impl FnMut(FileEntry) -> bool,
    ) -> Result<()> {
        let tables = self.read_tables()?;
        for item in tables.global_files.range(GlobalBounds::repo(repo).as_ref())? {
            let (_id, value) = item?;
            let record: GlobalRecord = postcard::from_bytes(value.value())?;
            let have = record.holder_version(node);
            let winner = record.entry;
            if have >= winner.version {
                continue;
            }
            // absent files do not need deletion
            if winner.is_deleted() && have == 0 {
                continue;
            }
            if winner.is_placeholder() {
                continue;
            }
            if !visit(winner) {
                break;
            }
        }
        Ok(())
    }

    /// The descriptor `node` stores for `name`, or the zero descriptor.
    pub(crate) fn get(&self, repo: &[u8], node: &NodeId, name: &[u8]) -> Result<FileEntry> {
        let tables = self.read_tables()?;
        match tables.node_files.get((repo, node.as_bytes(), name))? {
            Some(value) => Ok(postcard::from_bytes(value.value())?),
            None => Ok(FileEntry::default()),
        }
    }

    /// The winning descriptor for `name`, or the zero descriptor.
    pub(crate) fn get_global(&self, repo: &[u8], name: &[u8]) -> Result<FileEntry> {
        let tables = self.read_tables()?;
        match tables.global_files.get((repo, name))? {
            Some(value) => Ok(postcard::from_bytes::<GlobalRecord>(value.value())?.entry),
            None => Ok(FileEntry::default()),
        }
    }

    /// The nodes holding `name` at the winning version; empty for unknown
    /// names. Order is unspecified.
    pub(crate) fn availability(&self, repo: &[u8], name: &[u8]) -> Result<Vec<NodeId>> {
        let tables = self.read_tables()?;
        match tables.global_files.get((repo, name))? {
            Some(value) => {
                let record: GlobalRecord = postcard::from_bytes(value.value())?;
                Ok(record
                    .holders
                    .iter()
                    .filter(|h| h.version == record.entry.version)
                    .map(|h| h.node)
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    fn read_tables(&self) -> Result<ReadOnlyTables> {
        Ok(ReadOnlyTables::new(self.db.begin_read()?)?)
    }
}

/// How a replace treats stored names missing from the incoming list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Drop,
    Tombstone,
}

/// Per-name holder changes accumulated over one write transaction.
///
/// A bulk mutation may touch a name several times; the global record for
/// each touched name is resolved exactly once, at the end of the batch.
#[derive(Default)]
struct PendingGlobal {
    by_name: BTreeMap<Vec<u8>, BTreeMap<NodeId, Option<u64>>>,
}

impl PendingGlobal {
    fn write(&mut self, name: &[u8], node: &NodeId, version: u64) {
        self.by_name
            .entry(name.to_vec())
            .or_default()
            .insert(*node, Some(version));
    }

    fn delete(&mut self, name: &[u8], node: &NodeId) {
        self.by_name
            .entry(name.to_vec())
            .or_default()
            .insert(*node, None);
    }

    /// Applies the accumulated deltas: for every touched name, rewrite its
    /// holder list, drop the record once no node holds the name, otherwise
    /// recompute the winner (highest version, ties to the byte-wise smallest
    /// node id) and re-read the winner's descriptor from the node-files
    /// table, which inside the transaction already reflects this batch.
    fn resolve(self, repo: &[u8], tables: &mut Tables) -> Result<()> {
        for (name, deltas) in self.by_name {
            let gid = (repo, name.as_slice());
            let mut holders = {
                match tables.global_files.get(gid)? {
                    Some(value) => postcard::from_bytes::<GlobalRecord>(value.value())?.holders,
                    None => Vec::new(),
                }
            };
            for (node, version) in deltas {
                holders.retain(|h| h.node != node);
                if let Some(version) = version {
                    holders.push(Holder { node, version });
                }
            }
            if holders.is_empty() {
                tables.global_files.remove(gid)?;
                continue;
            }
            holders.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| a.node.cmp(&b.node)));
            let winner = holders[0];
            let entry = {
                let value = tables
                    .node_files
                    .get((repo, winner.node.as_bytes(), name.as_slice()))?
                    .with_context(|| {
                        format!(
                            "winner {} missing from node files for {:?}",
                            winner.node,
                            String::from_utf8_lossy(&name)
                        )
                    })?;
                postcard::from_bytes::<FileEntry>(value.value())?
            };
            let record = GlobalRecord { entry, holders };
            let value = postcard::to_stdvec(&record)?;
            tables.global_files.insert(gid, value.as_slice())?;
        }
        Ok(())
    }
}

/// Writes one descriptor into the node-files table and queues the matching
/// holder delta. Every written version is witnessed by the clock so later
/// tombstones outrank it.
fn write_entry(
    tables: &mut Tables,
    pending: &mut PendingGlobal,
    repo: &[u8],
    node: &NodeId,
    entry: &FileEntry,
    clock: &LamportClock,
) -> Result<()> {
    clock.witness(entry.version);
    let value = postcard::to_stdvec(entry)?;
    tables
        .node_files
        .insert((repo, node.as_bytes(), entry.name.as_bytes()), value.as_slice())?;
    pending.write(entry.name.as_bytes(), node, entry.version);
    Ok(())
}

fn scan_node_files(
    table: &impl ReadableTable<NodeFileId<'static>, &'static [u8]>,
    repo: &[u8],
    node: &NodeId,
) -> Result<Vec<FileEntry>> {
    let bounds = NodeFilesBounds::node(repo, node);
    let mut out = Vec::new();
    for item in table.range(bounds.as_ref())? {
        let (_id, value) = item?;
        out.push(postcard::from_bytes(value.value())?);
    }
    Ok(out)
}
