//! TrieVault Core — versioned copy-on-write radix trie storage
//!
//! A key/value engine keeping many revisions of one ordered keyspace. Each
//! revision is a radix trie; revisions share every node they have in common
//! and a writer copies only the path it changes.
//!
//! # Architecture
//!
//! - **Object arena**: stable object ids over a hot tier of size-bucketed
//!   pages, a cold tier that least recently used hot pages are evicted to,
//!   and a segment for big objects. All tiers are memory mapped.
//! - **Radix trie**: branch, cluster and value nodes stored as arena objects,
//!   shared between revisions by reference counting
//! - **Revisions**: a ring of root slots, each behind its own reader/writer lock
//!
//! ```no_run
//! use trievault_core::{Config, Database, TrieReader};
//!
//! let db = Database::open("/tmp/trievault", Config::phone())?;
//! let mut w = db.start_write_revision(1, 0)?;
//! w.upsert(b"hello", b"world")?;
//! drop(w);
//!
//! let r = db.read_revision(1)?;
//! assert_eq!(r.get(b"hello")?, Some(b"world".to_vec()));
//! # Ok::<(), trievault_core::TrieError>(())
//! ```

pub mod arena;
pub mod config;
pub mod cursor;
pub mod database;
pub mod directory;
pub mod error;
pub mod format;
pub mod node;
pub mod page;
pub mod region;
pub mod revision;
pub mod segment;
pub mod tier;
pub mod trie;
pub mod verify;

// Re-export key types for convenience
pub use arena::{ArenaStats, ObjectArena};
pub use config::Config;
pub use cursor::{Cursor, Entries, TrieReader};
pub use database::{Database, ReadSession, WriteSession};
pub use directory::{Location, ObjectId, Tier};
pub use error::{TrieError, TrieResult};
pub use revision::RevisionId;
pub use verify::CheckReport;
