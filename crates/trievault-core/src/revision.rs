//! Revision ring: one persisted root id per revision slot

use std::fmt;

use crate::config::MAX_REVISIONS;
use crate::directory::ObjectId;
use crate::error::{TrieError, TrieResult};
use crate::format::{RegionHeader, RegionKind, REGION_HEADER_SIZE};
use crate::page::PAGE_SIZE;
use crate::region::Region;

/// Index into the revision ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionId(pub u16);

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl From<u16> for RevisionId {
    fn from(raw: u16) -> Self {
        RevisionId(raw)
    }
}

/// Root ids of every revision slot, stored as `u32` after the region header
/// (0 = empty revision).
pub struct RevisionTable {
    region: Region,
    capacity: u32,
}

impl RevisionTable {
    pub fn region_len(capacity: u32) -> u64 {
        let raw = REGION_HEADER_SIZE + capacity as u64 * 4;
        raw.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64
    }

    pub fn create(mut region: Region, capacity: u32) -> Self {
        assert!(region.len() >= Self::region_len(capacity), "revision region too small");
        RegionHeader::new(RegionKind::Revisions, [capacity as u64, 0, 0, 0]).write(&mut region);
        Self { region, capacity }
    }

    pub fn open(region: Region) -> TrieResult<Self> {
        let header = RegionHeader::read(&region, RegionKind::Revisions)?;
        let capacity = header.geometry[0];
        if capacity == 0 || capacity > MAX_REVISIONS as u64 || region.len() < Self::region_len(capacity as u32) {
            return Err(TrieError::Corrupted {
                path: region.display_path(),
                reason: format!("revision table of {} slots in a {} byte region", capacity, region.len()),
            });
        }
        Ok(Self { region, capacity: capacity as u32 })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    fn slot_offset(rev: RevisionId) -> u64 {
        REGION_HEADER_SIZE + rev.0 as u64 * 4
    }

    pub fn root(&self, rev: RevisionId) -> Option<ObjectId> {
        ObjectId::new(self.region.read_u32(Self::slot_offset(rev)))
    }

    pub fn set_root(&mut self, rev: RevisionId, root: Option<ObjectId>) {
        self.region.write_u32(Self::slot_offset(rev), ObjectId::to_raw(root));
    }

    pub fn sync(&self) -> TrieResult<()> {
        self.region.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roots_persist() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(RegionKind::Revisions.file_name());
        let root = ObjectId::new(42);
        {
            let (region, created) = Region::open_file(&path, RevisionTable::region_len(16)).unwrap();
            assert!(created);
            let mut table = RevisionTable::create(region, 16);
            table.set_root(RevisionId(3), root);
            table.set_root(RevisionId(15), ObjectId::new(7));
            table.set_root(RevisionId(15), None);
            table.sync().unwrap();
        }
        let (region, created) = Region::open_file(&path, 0).unwrap();
        assert!(!created);
        let table = RevisionTable::open(region).unwrap();
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.root(RevisionId(3)), root);
        assert_eq!(table.root(RevisionId(15)), None);
        assert_eq!(table.root(RevisionId(0)), None);
    }

    #[test]
    fn test_open_rejects_wrong_magic() {
        let mut region = Region::anonymous(RevisionTable::region_len(4)).unwrap();
        RegionHeader::new(RegionKind::Hot, [4, 0, 0, 0]).write(&mut region);
        assert!(matches!(RevisionTable::open(region), Err(TrieError::Corrupted { .. })));
    }

    #[test]
    fn test_full_ring_fits() {
        let len = RevisionTable::region_len(MAX_REVISIONS);
        assert_eq!(len % PAGE_SIZE as u64, 0);
        let mut table = RevisionTable::create(Region::anonymous(len).unwrap(), MAX_REVISIONS);
        let last = RevisionId((MAX_REVISIONS - 1) as u16);
        table.set_root(last, ObjectId::new(1));
        assert_eq!(table.root(last), ObjectId::new(1));
    }
}
