//! Per-repository file index for a peer-to-peer file synchronizer.
//!
//! The crate operates on [`FileSet`]s. A file set binds one repository name
//! to a shared [`Store`] and records, for every participating node, the
//! files that node claims to hold as [`FileEntry`] descriptors. From the
//! per-node tables it derives a global view: for every name, the single
//! winning version across all nodes (highest version, ties broken by node
//! id) together with the set of nodes holding a copy of the winner.
//!
//! The synchronization loop asks the index four questions every cycle, each
//! answered by one range scan:
//!
//! * what does a node have ([`FileSet::with_have`]),
//! * what does the global view contain ([`FileSet::with_global`]),
//! * what does a node need to become current ([`FileSet::with_need`]),
//! * which nodes offer a given file ([`FileSet::availability`]).
//!
//! When a local rescan reveals that a file disappeared,
//! [`FileSet::replace_with_delete`] synthesizes a deletion tombstone stamped
//! by a shared [`LamportClock`], so the deletion outranks every copy known
//! from any peer and propagates. Per-node change cursors
//! ([`FileSet::changes`]) let external pullers detect motion cheaply.
//!
//! Storage is [`redb`], an embedded ordered key-value store, either
//! [in-memory](Store::memory) or [persistent](Store::persistent). Several
//! repositories share one store; each set owns only its repo-prefixed slice
//! of the keyspace. Mutations are atomic write transactions, reads are MVCC
//! snapshots that never block writers.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod clock;
mod entry;
mod keys;
mod set;
mod store;

pub use self::clock::LamportClock;
pub use self::entry::{Block, FileEntry, FLAG_DELETED, FLAG_DIRECTORY};
pub use self::keys::NodeId;
pub use self::set::FileSet;
pub use self::store::Store;
