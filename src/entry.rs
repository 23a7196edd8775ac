//! File descriptors, the unit of exchange with the scanner and the wire
//! protocol.

use serde::{Deserialize, Serialize};

/// The entry is a deletion tombstone.
pub const FLAG_DELETED: u32 = 1 << 12;
/// The entry describes a directory.
pub const FLAG_DIRECTORY: u32 = 1 << 14;

/// One content block of a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Byte offset of the block within the file.
    pub offset: i64,
    /// Size of the block in bytes.
    pub size: u32,
    /// Content hash of the block.
    pub hash: Vec<u8>,
}

/// A file as one node claims to hold it.
///
/// The name is the identity; the version is a logical timestamp where higher
/// wins. An entry with [`FLAG_DELETED`] set is a tombstone: it records that a
/// file existed and was removed, and it ranks against other versions like any
/// regular entry.
///
/// Encoded with postcard, which is deterministic: byte-equal encodings imply
/// field-equal entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Repo-relative path. Empty only in the zero descriptor returned for
    /// point-query misses.
    pub name: String,
    /// Logical timestamp; higher versions win.
    pub version: u64,
    /// Bitfield, see the `FLAG_*` constants.
    pub flags: u32,
    /// Modification time, seconds since the epoch.
    pub modified: i64,
    /// Content blocks, in file order. Empty for tombstones and directories.
    pub blocks: Vec<Block>,
}

impl FileEntry {
    /// Whether this entry is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    /// Whether this entry describes a directory.
    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    /// Whether this is a not-yet-hashed placeholder: no blocks, yet neither
    /// deleted nor a directory. The scanner publishes such entries while
    /// indexing is still in progress.
    pub fn is_placeholder(&self) -> bool {
        self.blocks.is_empty() && !self.is_deleted() && !self.is_directory()
    }

    /// Whether this is the zero descriptor (a point-query miss).
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// File size in bytes, derived from the block list.
    pub fn size(&self) -> i64 {
        self.blocks.iter().map(|b| i64::from(b.size)).sum()
    }
}
