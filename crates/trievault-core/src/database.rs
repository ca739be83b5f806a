//! Database handle and revision sessions
//!
//! A [`Database`] owns the object arena and a ring of revision slots. Each
//! slot holds one trie root behind its own reader/writer lock:
//!
//! - [`Database::start_write_revision`] takes a slot exclusively, optionally
//!   seeding it with another revision's root (an O(1) refcount bump)
//! - [`Database::read_revision`] takes a slot shared
//! - [`Database::free_revision`] empties a slot and reclaims whatever only it
//!   referenced
//!
//! The arena sits behind one mutex that every session takes for the duration
//! of a single call; readers need it too because a read can promote an object
//! out of the cold tier.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::arena::{ArenaStats, ObjectArena};
use crate::config::Config;
use crate::cursor::TrieReader;
use crate::directory::ObjectId;
use crate::error::{TrieError, TrieResult};
use crate::format::RegionKind;
use crate::region::Region;
use crate::revision::{RevisionId, RevisionTable};
use crate::trie::{release_tree, TrieWriter};

/// Region files making up an on-disk database
const REGION_FILES: [RegionKind; 5] = [
    RegionKind::Directory,
    RegionKind::Hot,
    RegionKind::Cold,
    RegionKind::Big,
    RegionKind::Revisions,
];

/// A versioned key/value store.
///
/// All methods take `&self`; share it between threads by reference or `Arc`.
pub struct Database {
    config: Config,
    /// Database directory, None for in-memory databases
    dir: Option<PathBuf>,
    /// Global allocator lock
    pub(crate) arena: Mutex<ObjectArena>,
    /// Persisted copy of every slot's root
    roots: Mutex<RevisionTable>,
    pub(crate) revisions: Box<[RwLock<Option<ObjectId>>]>,
}

impl Database {
    /// Open the database in `path`, creating it if the directory holds none.
    ///
    /// An existing database keeps the geometry it was created with.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> TrieResult<Self> {
        let dir = path.as_ref().to_path_buf();
        config.validate()?;
        std::fs::create_dir_all(&dir)
            .map_err(|e| TrieError::io_at(&dir, &e, "Failed to create database directory"))?;

        let present = REGION_FILES
            .iter()
            .filter(|kind| dir.join(kind.file_name()).exists())
            .count();
        let create = match present {
            0 => true,
            n if n == REGION_FILES.len() => false,
            n => {
                return Err(TrieError::Corrupted {
                    path: dir,
                    reason: format!("incomplete database: {} of {} region files present", n, REGION_FILES.len()),
                })
            }
        };

        let arena = ObjectArena::open(&dir, &config, create)?;
        let table_path = dir.join(RegionKind::Revisions.file_name());
        let roots = if create {
            let (region, _) = Region::open_file(&table_path, RevisionTable::region_len(config.max_revisions))?;
            RevisionTable::create(region, config.max_revisions)
        } else {
            let (region, _) = Region::open_file(&table_path, 0)?;
            RevisionTable::open(region)?
        };

        let db = Self::from_parts(config, Some(dir), arena, roots);
        info!(
            path = %db.path().map(|p| p.display().to_string()).unwrap_or_default(),
            created = create,
            revisions = db.revisions.len(),
            live_revisions = db.revisions.iter().filter(|slot| slot.read().is_some()).count(),
            "database opened"
        );
        Ok(db)
    }

    /// A database living in anonymous memory, gone when dropped.
    pub fn in_memory(config: Config) -> TrieResult<Self> {
        let arena = ObjectArena::in_memory(&config)?;
        let region = Region::anonymous(RevisionTable::region_len(config.max_revisions))?;
        let roots = RevisionTable::create(region, config.max_revisions);
        Ok(Self::from_parts(config, None, arena, roots))
    }

    fn from_parts(config: Config, dir: Option<PathBuf>, arena: ObjectArena, roots: RevisionTable) -> Self {
        let revisions = (0..roots.capacity())
            .map(|i| RwLock::new(roots.root(RevisionId(i as u16))))
            .collect();
        Self {
            config,
            dir,
            arena: Mutex::new(arena),
            roots: Mutex::new(roots),
            revisions,
        }
    }

    fn slot(&self, rev: RevisionId) -> TrieResult<&RwLock<Option<ObjectId>>> {
        self.revisions.get(rev.0 as usize).ok_or(TrieError::InvalidRevision {
            revision: rev.0 as u32,
            max: self.revisions.len() as u32,
        })
    }

    /// Take revision `new` for writing.
    ///
    /// When `prev` differs from `new`, `new` first becomes a copy of `prev`:
    /// its root is shared, not cloned, and whatever `new` held before is
    /// released. Blocks while another session holds `new`, or a writer holds
    /// `prev`. Calling it for a revision this thread already holds deadlocks.
    pub fn start_write_revision(
        &self,
        new: impl Into<RevisionId>,
        prev: impl Into<RevisionId>,
    ) -> TrieResult<WriteSession<'_>> {
        let (new, prev) = (new.into(), prev.into());
        let slot = self.slot(new)?;
        let inherited = if new != prev {
            // retain under the read lock so a writer of `prev` cannot free the root first
            let prev_root = self.slot(prev)?.read();
            if let Some(root) = *prev_root {
                self.arena.lock().retain(root);
            }
            Some(*prev_root)
        } else {
            None
        };

        let mut guard = slot.write();
        if let Some(root) = inherited {
            let old = std::mem::replace(&mut *guard, root);
            self.roots.lock().set_root(new, root);
            if let Some(old) = old {
                release_tree(&mut self.arena.lock(), old);
            }
            debug!(revision = %new, from = %prev, "revision copied");
        }
        debug!(revision = %new, "write session started");
        Ok(WriteSession { db: self, revision: new, root: guard })
    }

    /// Take revision `rev` for reading.
    pub fn read_revision(&self, rev: impl Into<RevisionId>) -> TrieResult<ReadSession<'_>> {
        let rev = rev.into();
        let root = self.slot(rev)?.read();
        Ok(ReadSession { db: self, revision: rev, root })
    }

    /// Empty revision `rev`, reclaiming every node no other revision shares.
    pub fn free_revision(&self, rev: impl Into<RevisionId>) -> TrieResult<()> {
        let rev = rev.into();
        let mut guard = self.slot(rev)?.write();
        if let Some(root) = guard.take() {
            self.roots.lock().set_root(rev, None);
            let mut arena = self.arena.lock();
            release_tree(&mut arena, root);
            debug!(revision = %rev, live_objects = arena.stats().live_objects, "revision freed");
        }
        Ok(())
    }

    /// Whether revision `rev` holds any key. Blocks while a writer holds it.
    pub fn revision_root_is_set(&self, rev: impl Into<RevisionId>) -> TrieResult<bool> {
        Ok(self.slot(rev.into())?.read().is_some())
    }

    /// Number of revision slots.
    pub fn revision_capacity(&self) -> u32 {
        self.revisions.len() as u32
    }

    pub fn stats(&self) -> ArenaStats {
        self.arena.lock().stats()
    }

    /// Flush every region to disk. A no-op for in-memory databases.
    pub fn sync(&self) -> TrieResult<()> {
        if self.dir.is_none() {
            return Ok(());
        }
        self.arena.lock().sync()?;
        self.roots.lock().sync()?;
        info!(path = %self.path().map(|p| p.display().to_string()).unwrap_or_default(), "database synced");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Database directory, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            warn!(error = %err, "final sync failed");
        }
    }
}

/// Exclusive access to one revision. Released on drop.
pub struct WriteSession<'db> {
    db: &'db Database,
    revision: RevisionId,
    root: RwLockWriteGuard<'db, Option<ObjectId>>,
}

impl<'db> WriteSession<'db> {
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn check_entry(&self, key: &[u8], value: &[u8]) -> TrieResult<()> {
        if key.is_empty() {
            return Err(TrieError::EmptyKey);
        }
        let config = &self.db.config;
        if key.len() > config.max_key_size {
            return Err(TrieError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: config.max_key_size as u64,
                component: "key".into(),
            });
        }
        if value.len() > config.max_value_size {
            return Err(TrieError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: config.max_value_size as u64,
                component: "value".into(),
            });
        }
        Ok(())
    }

    fn writer<'a>(&self, arena: &'a mut ObjectArena) -> TrieWriter<'a> {
        TrieWriter::new(arena, self.revision.0, self.db.config.max_cluster_entries)
    }

    fn set_root(&mut self, root: Option<ObjectId>) {
        if *self.root != root {
            *self.root = root;
            self.db.roots.lock().set_root(self.revision, root);
        }
    }

    /// Insert or overwrite `key`. Returns true when the key is new.
    ///
    /// On error the revision is left exactly as it was.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> TrieResult<bool> {
        self.check_entry(key, value)?;
        let (root, inserted) = {
            let mut arena = self.db.arena.lock();
            self.writer(&mut arena).upsert(*self.root, key, value)?
        };
        self.set_root(root);
        Ok(inserted)
    }

    /// Drop every key from this revision. Nodes shared with other revisions
    /// stay live.
    pub fn clear(&mut self) {
        let Some(root) = *self.root else {
            return;
        };
        self.set_root(None);
        release_tree(&mut self.db.arena.lock(), root);
        debug!(revision = %self.revision, "revision cleared");
    }

    /// Remove `key`. Returns true when it existed.
    pub fn remove(&mut self, key: &[u8]) -> TrieResult<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let (root, existed) = {
            let mut arena = self.db.arena.lock();
            self.writer(&mut arena).remove(*self.root, key)?
        };
        self.set_root(root);
        Ok(existed)
    }
}

impl TrieReader for WriteSession<'_> {
    fn arena(&self) -> &Mutex<ObjectArena> {
        &self.db.arena
    }

    fn root(&self) -> Option<ObjectId> {
        *self.root
    }
}

/// Shared access to one revision. Released on drop.
pub struct ReadSession<'db> {
    db: &'db Database,
    revision: RevisionId,
    root: RwLockReadGuard<'db, Option<ObjectId>>,
}

impl ReadSession<'_> {
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

impl TrieReader for ReadSession<'_> {
    fn arena(&self) -> &Mutex<ObjectArena> {
        &self.db.arena
    }

    fn root(&self) -> Option<ObjectId> {
        *self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_REVISIONS;
    use tempfile::TempDir;

    fn test_db() -> Database {
        Database::in_memory(Config::testing()).unwrap()
    }

    #[test]
    fn test_upsert_get_remove() {
        let db = test_db();
        let mut w = db.start_write_revision(0, 0).unwrap();
        assert!(w.is_empty());
        assert!(w.upsert(b"hello", b"world").unwrap());
        assert!(!w.upsert(b"hello", b"there").unwrap());
        assert_eq!(w.get(b"hello").unwrap(), Some(b"there".to_vec()));
        assert!(w.remove(b"hello").unwrap());
        assert!(!w.remove(b"hello").unwrap());
        assert!(w.is_empty());
    }

    #[test]
    fn test_entry_validation() {
        let db = test_db();
        let mut w = db.start_write_revision(0, 0).unwrap();
        assert!(matches!(w.upsert(b"", b"v"), Err(TrieError::EmptyKey)));
        let long_key = vec![b'k'; db.config().max_key_size + 1];
        assert!(matches!(
            w.upsert(&long_key, b"v"),
            Err(TrieError::OversizedEntry { ref component, .. }) if component == "key"
        ));
        let big_value = vec![0u8; db.config().max_value_size + 1];
        assert!(matches!(
            w.upsert(b"k", &big_value),
            Err(TrieError::OversizedEntry { ref component, .. }) if component == "value"
        ));
        assert!(!w.remove(b"").unwrap());
        assert!(w.is_empty());
    }

    #[test]
    fn test_invalid_revision() {
        let db = test_db();
        let max = db.revision_capacity();
        assert!(matches!(
            db.read_revision(max as u16),
            Err(TrieError::InvalidRevision { .. })
        ));
        assert!(db.start_write_revision(0, max as u16).is_err());
    }

    #[test]
    fn test_copy_revision_shares_root() {
        let db = test_db();
        {
            let mut w = db.start_write_revision(1, 1).unwrap();
            w.upsert(b"a", b"1").unwrap();
            w.upsert(b"ab", b"2").unwrap();
        }
        let live = db.stats().live_objects;
        {
            let w = db.start_write_revision(2, 1).unwrap();
            assert_eq!(w.get(b"ab").unwrap(), Some(b"2".to_vec()));
        }
        assert_eq!(db.stats().live_objects, live, "copying a revision allocates nothing");
        assert!(db.revision_root_is_set(2).unwrap());

        db.free_revision(1).unwrap();
        assert!(!db.revision_root_is_set(1).unwrap());
        assert_eq!(db.stats().live_objects, live, "revision 2 still holds every node");
        db.free_revision(2).unwrap();
        assert_eq!(db.stats().live_objects, 0);
    }

    #[test]
    fn test_clear_keeps_shared_nodes() {
        let db = test_db();
        {
            let mut w = db.start_write_revision(0, 0).unwrap();
            for key in [&b"a"[..], b"ab", b"abc"] {
                w.upsert(key, key).unwrap();
            }
        }
        let live = db.stats().live_objects;
        {
            let mut w = db.start_write_revision(1, 0).unwrap();
            w.clear();
            assert!(w.is_empty());
            assert_eq!(w.get(b"ab").unwrap(), None);
            assert_eq!(db.stats().live_objects, live, "revision 0 still holds every node");
            w.clear();
            assert!(w.upsert(b"ab", b"new").unwrap());
        }
        assert_eq!(db.read_revision(0).unwrap().get(b"ab").unwrap(), Some(b"ab".to_vec()));
        assert_eq!(db.read_revision(1).unwrap().get(b"ab").unwrap(), Some(b"new".to_vec()));

        db.start_write_revision(0, 0).unwrap().clear();
        assert!(!db.revision_root_is_set(0).unwrap());
        db.free_revision(1).unwrap();
        assert_eq!(db.stats().live_objects, 0);
        assert!(db.check().is_ok());
    }

    #[test]
    fn test_full_ring_shares_one_root() {
        let mut config = Config::testing();
        config.max_revisions = MAX_REVISIONS;
        let db = Database::in_memory(config).unwrap();
        let root = {
            let mut w = db.start_write_revision(0, 0).unwrap();
            w.upsert(b"shared", b"v").unwrap();
            w.upsert(b"shore", b"w").unwrap();
            w.root().unwrap()
        };
        for rev in 1..MAX_REVISIONS as u16 {
            db.start_write_revision(rev, 0).unwrap();
        }
        assert_eq!(db.arena.lock().ref_count(root), MAX_REVISIONS as u16);

        // reseeding an occupied slot briefly holds one more reference
        db.start_write_revision(1, 0).unwrap();
        assert_eq!(db.arena.lock().ref_count(root), MAX_REVISIONS as u16);
        {
            let mut w = db.start_write_revision(2, 2).unwrap();
            w.upsert(b"shared", b"changed").unwrap();
        }
        assert_eq!(db.read_revision(0).unwrap().get(b"shared").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.read_revision(2).unwrap().get(b"shared").unwrap(), Some(b"changed".to_vec()));
        assert_eq!(db.arena.lock().ref_count(root), MAX_REVISIONS as u16 - 1);
        assert!(db.check().is_ok());
    }

    #[test]
    fn test_overwriting_revision_releases_old_root() {
        let db = test_db();
        {
            let mut w = db.start_write_revision(0, 0).unwrap();
            w.upsert(b"x", b"1").unwrap();
        }
        {
            let mut w = db.start_write_revision(1, 1).unwrap();
            for i in 0..50u32 {
                w.upsert(format!("key{}", i).as_bytes(), b"v").unwrap();
            }
        }
        // revision 1 becomes a copy of revision 0
        let w = db.start_write_revision(1, 0).unwrap();
        assert_eq!(w.get(b"key7").unwrap(), None);
        assert_eq!(w.get(b"x").unwrap(), Some(b"1".to_vec()));
        drop(w);
        db.free_revision(0).unwrap();
        db.free_revision(1).unwrap();
        assert_eq!(db.stats().live_objects, 0);
    }

    #[test]
    fn test_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(dir.path(), Config::testing()).unwrap();
            let mut w = db.start_write_revision(3, 3).unwrap();
            w.upsert(b"persist", b"me").unwrap();
            drop(w);
            db.sync().unwrap();
        }
        let db = Database::open(dir.path(), Config::testing()).unwrap();
        assert!(db.revision_root_is_set(3).unwrap());
        let r = db.read_revision(3).unwrap();
        assert_eq!(r.revision(), RevisionId(3));
        assert_eq!(r.get(b"persist").unwrap(), Some(b"me".to_vec()));
    }

    #[test]
    fn test_incomplete_directory_rejected() {
        let dir = TempDir::new().unwrap();
        {
            Database::open(dir.path(), Config::testing()).unwrap();
        }
        std::fs::remove_file(dir.path().join(RegionKind::Hot.file_name())).unwrap();
        let err = Database::open(dir.path(), Config::testing()).err().unwrap();
        assert!(matches!(err, TrieError::Corrupted { .. }), "{}", err);
    }

    #[test]
    fn test_readers_on_other_revisions_proceed() {
        let db = test_db();
        {
            let mut w = db.start_write_revision(0, 0).unwrap();
            w.upsert(b"shared", b"v0").unwrap();
        }
        let mut writer = db.start_write_revision(1, 0).unwrap();
        writer.upsert(b"shared", b"v1").unwrap();
        // revision 0 stays readable while revision 1 is held for writing
        std::thread::scope(|s| {
            s.spawn(|| {
                let r = db.read_revision(0).unwrap();
                assert_eq!(r.get(b"shared").unwrap(), Some(b"v0".to_vec()));
            });
        });
        assert_eq!(writer.get(b"shared").unwrap(), Some(b"v1".to_vec()));
    }
}
