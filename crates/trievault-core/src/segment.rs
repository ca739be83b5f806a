//! Big-object segment
//!
//! Objects at or above the big-object threshold skip the page allocator and
//! get a block of their own here. Blocks are laid end to end after the header
//! page, each prefixed by a 16-byte tag:
//!
//! ```text
//!   [0..8]   block_len << 1 | used   (block_len includes the tag)
//!   [8..16]  payload_len
//! ```
//!
//! Walking the tags from the first block visits every block, so the free
//! extents are not persisted: `open` rebuilds them with one scan.

use std::collections::BTreeMap;

use crate::error::{TrieError, TrieResult};
use crate::format::{RegionHeader, RegionKind};
use crate::page::PAGE_SIZE;
use crate::region::Region;

const DATA_START: u64 = PAGE_SIZE as u64;
const TAG_SIZE: u64 = 16;
/// Smallest remainder worth splitting off as its own free block
const MIN_SPLIT: u64 = TAG_SIZE + 16;

#[inline]
fn block_len_for(payload: usize) -> u64 {
    TAG_SIZE + ((payload as u64 + 7) & !7)
}

/// Boundary-tag allocator over one region.
pub struct BigSegment {
    region: Region,
    /// Free blocks: offset -> block length
    free: BTreeMap<u64, u64>,
    used_bytes: u64,
}

impl BigSegment {
    /// Format a zeroed region as one free block.
    pub fn create(mut region: Region) -> Self {
        let len = region.len();
        assert!(len > DATA_START + MIN_SPLIT, "big segment region too small");
        RegionHeader::new(RegionKind::Big, [len, 0, 0, 0]).write(&mut region);
        let mut segment = Self { region, free: BTreeMap::new(), used_bytes: 0 };
        segment.write_tag(DATA_START, len - DATA_START, false, 0);
        segment.free.insert(DATA_START, len - DATA_START);
        segment
    }

    /// Reopen a segment, rebuilding the free map from the block tags.
    pub fn open(region: Region) -> TrieResult<Self> {
        let header = RegionHeader::read(&region, RegionKind::Big)?;
        let len = header.geometry[0];
        if len != region.len() {
            return Err(TrieError::Corrupted {
                path: region.display_path(),
                reason: format!("segment header says {} bytes, file has {}", len, region.len()),
            });
        }

        let mut segment = Self { region, free: BTreeMap::new(), used_bytes: 0 };
        let mut offset = DATA_START;
        let mut pending_free: Option<(u64, u64)> = None;
        while offset < len {
            let (block_len, used, _) = segment.tag(offset);
            if block_len < TAG_SIZE || block_len % 8 != 0 || offset + block_len > len {
                return Err(TrieError::Corrupted {
                    path: segment.region.display_path(),
                    reason: format!("bad block tag at offset {}: length {}", offset, block_len),
                });
            }
            if used {
                if let Some((at, run)) = pending_free.take() {
                    segment.insert_free(at, run);
                }
                segment.used_bytes += block_len;
            } else {
                pending_free = match pending_free {
                    Some((at, run)) => Some((at, run + block_len)),
                    None => Some((offset, block_len)),
                };
            }
            offset += block_len;
        }
        if let Some((at, run)) = pending_free {
            segment.insert_free(at, run);
        }
        Ok(segment)
    }

    fn tag(&self, offset: u64) -> (u64, bool, u64) {
        let word = self.region.read_u64(offset);
        (word >> 1, word & 1 == 1, self.region.read_u64(offset + 8))
    }

    fn write_tag(&mut self, offset: u64, block_len: u64, used: bool, payload_len: u64) {
        self.region.write_u64(offset, block_len << 1 | used as u64);
        self.region.write_u64(offset + 8, payload_len);
    }

    fn insert_free(&mut self, offset: u64, block_len: u64) {
        self.write_tag(offset, block_len, false, 0);
        self.free.insert(offset, block_len);
    }

    /// Allocate a block for `payload_len` bytes; returns the payload offset.
    ///
    /// First fit in address order. `None` when no free block is large enough.
    pub fn alloc(&mut self, payload_len: usize) -> Option<u64> {
        let need = block_len_for(payload_len);
        let (offset, have) = self.free.iter().find(|(_, len)| **len >= need).map(|(o, l)| (*o, *l))?;
        self.free.remove(&offset);

        let taken = if have - need >= MIN_SPLIT {
            self.insert_free(offset + need, have - need);
            need
        } else {
            have
        };
        self.write_tag(offset, taken, true, payload_len as u64);
        self.used_bytes += taken;
        Some(offset + TAG_SIZE)
    }

    /// Free the block whose payload starts at `payload_offset`, merging with free neighbours.
    pub fn free(&mut self, payload_offset: u64) {
        let mut offset = payload_offset - TAG_SIZE;
        let (mut block_len, used, _) = self.tag(offset);
        assert!(used, "double free of big block at offset {}", offset);
        self.used_bytes -= block_len;

        let next = offset + block_len;
        if let Some(next_len) = self.free.remove(&next) {
            block_len += next_len;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                offset = prev;
                block_len += prev_len;
            }
        }
        self.insert_free(offset, block_len);
    }

    /// Payload length of a live block.
    pub fn payload_len(&self, payload_offset: u64) -> usize {
        let (_, used, payload) = self.tag(payload_offset - TAG_SIZE);
        assert!(used, "read of free big block at offset {}", payload_offset);
        payload as usize
    }

    pub fn bytes(&self, payload_offset: u64) -> &[u8] {
        let len = self.payload_len(payload_offset);
        self.region.bytes(payload_offset, len)
    }

    pub fn bytes_mut(&mut self, payload_offset: u64) -> &mut [u8] {
        let len = self.payload_len(payload_offset);
        self.region.bytes_mut(payload_offset, len)
    }

    /// Bytes held by live blocks, tags included.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Payload offsets of every live block, in address order.
    pub fn live_blocks(&self) -> Vec<u64> {
        let mut blocks = Vec::new();
        let mut offset = DATA_START;
        while offset < self.region.len() {
            let (block_len, used, _) = self.tag(offset);
            if used {
                blocks.push(offset + TAG_SIZE);
            }
            offset += block_len;
        }
        blocks
    }

    pub fn sync(&self) -> TrieResult<()> {
        self.region.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(pages: u64) -> BigSegment {
        BigSegment::create(Region::anonymous(pages * PAGE_SIZE as u64).unwrap())
    }

    #[test]
    fn test_alloc_write_read() {
        let mut seg = segment(4);
        let off = seg.alloc(5000).unwrap();
        seg.bytes_mut(off).fill(0xAB);
        assert_eq!(seg.payload_len(off), 5000);
        assert!(seg.bytes(off).iter().all(|b| *b == 0xAB));
        assert_eq!(seg.used_bytes(), block_len_for(5000));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut seg = segment(3);
        assert!(seg.alloc(3 * PAGE_SIZE).is_none());
        assert!(seg.alloc(PAGE_SIZE).is_some());
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let mut seg = segment(8);
        let total = seg.free_bytes();
        let a = seg.alloc(4096).unwrap();
        let b = seg.alloc(4096).unwrap();
        let c = seg.alloc(4096).unwrap();
        seg.free(a);
        seg.free(c);
        seg.free(b);
        assert_eq!(seg.used_bytes(), 0);
        assert_eq!(seg.free_bytes(), total);
        assert_eq!(seg.free.len(), 1, "all blocks merged back into one");
        // the whole space is allocatable again
        assert!(seg.alloc((total - TAG_SIZE) as usize).is_some());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut seg = segment(4);
        let a = seg.alloc(4500).unwrap();
        let _b = seg.alloc(4500).unwrap();
        seg.free(a);
        seg.free(a);
    }

    #[test]
    fn test_reopen_rebuilds_free_map() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("big.dat");
        let (keep, hole) = {
            let (region, _) = Region::open_file(&path, 16 * PAGE_SIZE as u64).unwrap();
            let mut seg = BigSegment::create(region);
            let a = seg.alloc(6000).unwrap();
            let b = seg.alloc(4100).unwrap();
            let c = seg.alloc(4100).unwrap();
            seg.bytes_mut(c).fill(7);
            seg.free(b);
            seg.free(a);
            seg.sync().unwrap();
            (c, a)
        };
        let (region, _) = Region::open_file(&path, 0).unwrap();
        let mut seg = BigSegment::open(region).unwrap();
        assert_eq!(seg.live_blocks(), vec![keep]);
        assert!(seg.bytes(keep).iter().all(|b| *b == 7));
        assert_eq!(seg.alloc(6000), Some(hole), "freed space before the live block is reused");
    }
}
