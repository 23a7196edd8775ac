//! Table definitions and accessors for the redb database.

use redb::{ReadTransaction, TableDefinition, TableError, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::entry::FileEntry;
use crate::keys::NodeId;

/// Key of the per-node file table: `(repo, node, name)`.
///
/// redb orders compound keys element-wise, so one node's files within one
/// repository form a contiguous range, sorted by name.
pub(super) type NodeFileId<'a> = (&'a [u8], &'a [u8; 32], &'a [u8]);

/// Key of the global index table: `(repo, name)`.
pub(super) type GlobalId<'a> = (&'a [u8], &'a [u8]);

pub(super) const NODE_FILES_TABLE: TableDefinition<NodeFileId<'static>, &'static [u8]> =
    TableDefinition::new("node-files-0");

pub(super) const GLOBAL_FILES_TABLE: TableDefinition<GlobalId<'static>, &'static [u8]> =
    TableDefinition::new("global-files-0");

/// One holder of a name: a node and the version it claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Holder {
    /// The node claiming to hold the file.
    pub node: NodeId,
    /// The version of its copy.
    pub version: u64,
}

/// Value of the global index: the winning descriptor for a name plus every
/// node known to hold the name, sorted by (version descending, node
/// ascending). The winner is the head of the holder list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GlobalRecord {
    /// The winning descriptor.
    pub entry: FileEntry,
    /// All holders, including those below the winning version.
    pub holders: Vec<Holder>,
}

impl GlobalRecord {
    /// The version `node` holds, or zero if it does not hold the name.
    pub fn holder_version(&self, node: &NodeId) -> u64 {
        self.holders
            .iter()
            .find(|h| h.node == *node)
            .map(|h| h.version)
            .unwrap_or_default()
    }
}

/// All tables of one write transaction.
pub(super) struct Tables<'tx> {
    pub node_files: redb::Table<'tx, NodeFileId<'static>, &'static [u8]>,
    pub global_files: redb::Table<'tx, GlobalId<'static>, &'static [u8]>,
}

impl<'tx> Tables<'tx> {
    pub fn new(tx: &'tx WriteTransaction) -> Result<Self, TableError> {
        Ok(Self {
            node_files: tx.open_table(NODE_FILES_TABLE)?,
            global_files: tx.open_table(GLOBAL_FILES_TABLE)?,
        })
    }
}

/// All tables of one read transaction (one snapshot).
pub(super) struct ReadOnlyTables {
    pub node_files: redb::ReadOnlyTable<NodeFileId<'static>, &'static [u8]>,
    pub global_files: redb::ReadOnlyTable<GlobalId<'static>, &'static [u8]>,
    _tx: ReadTransaction,
}

impl ReadOnlyTables {
    pub fn new(tx: ReadTransaction) -> Result<Self, TableError> {
        Ok(Self {
            node_files: tx.open_table(NODE_FILES_TABLE)?,
            global_files: tx.open_table(GLOBAL_FILES_TABLE)?,
            _tx: tx,
        })
    }
}
