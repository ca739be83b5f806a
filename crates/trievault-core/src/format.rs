//! Binary header shared by every region file
//!
//! Each region starts with a 64-byte header describing its immutable
//! geometry. Mutable bookkeeping (free lists, counters) lives after it and is
//! owned by the module that manages the region.
//!
//! Layout:
//!   [0..4]   magic:    [u8;4] - identifies the region kind
//!   [4..8]   version:  u32 LE
//!   [8..40]  geometry: [u64;4] LE - meaning depends on the region kind
//!   [40..44] checksum: u32 LE - CRC32C of bytes [0..40]
//!   [44..64] reserved, zero

use crate::error::{TrieError, TrieResult};
use crate::region::Region;

/// On-disk format version understood by this build
pub const FORMAT_VERSION: u32 = 1;

/// Header size in bytes
pub const REGION_HEADER_SIZE: u64 = 64;

const CHECKSUM_OFFSET: usize = 40;

/// The five kinds of region a database directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Object directory (`objects.dat`)
    Directory,
    /// Hot tier (`hot.dat`)
    Hot,
    /// Cold tier (`cold.dat`)
    Cold,
    /// Big-object segment (`big.dat`)
    Big,
    /// Revision roots (`revisions.dat`)
    Revisions,
}

impl RegionKind {
    pub fn magic(self) -> [u8; 4] {
        match self {
            RegionKind::Directory => *b"TVDR",
            RegionKind::Hot => *b"TVHT",
            RegionKind::Cold => *b"TVCD",
            RegionKind::Big => *b"TVBG",
            RegionKind::Revisions => *b"TVRV",
        }
    }

    /// File name inside the database directory.
    pub fn file_name(self) -> &'static str {
        match self {
            RegionKind::Directory => "objects.dat",
            RegionKind::Hot => "hot.dat",
            RegionKind::Cold => "cold.dat",
            RegionKind::Big => "big.dat",
            RegionKind::Revisions => "revisions.dat",
        }
    }
}

/// Fixed-size header at offset 0 of every region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub kind: RegionKind,
    pub version: u32,
    /// Kind-specific immutable parameters (page counts, capacities)
    pub geometry: [u64; 4],
}

impl RegionHeader {
    pub fn new(kind: RegionKind, geometry: [u64; 4]) -> Self {
        Self { kind, version: FORMAT_VERSION, geometry }
    }

    /// Serialize header to bytes, checksum included
    pub fn to_bytes(&self) -> [u8; REGION_HEADER_SIZE as usize] {
        let mut buf = [0u8; REGION_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.kind.magic());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        for (i, g) in self.geometry.iter().enumerate() {
            let at = 8 + i * 8;
            buf[at..at + 8].copy_from_slice(&g.to_le_bytes());
        }
        let checksum = crc32c::crc32c(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Write the header at the start of `region`.
    pub fn write(&self, region: &mut Region) {
        region
            .bytes_mut(0, REGION_HEADER_SIZE as usize)
            .copy_from_slice(&self.to_bytes());
    }

    /// Parse and verify the header at the start of `region`.
    ///
    /// Checks magic, version and checksum in that order.
    pub fn read(region: &Region, kind: RegionKind) -> TrieResult<Self> {
        let path = region.display_path();
        if region.len() < REGION_HEADER_SIZE {
            return Err(TrieError::Corrupted {
                path,
                reason: format!("region is {} bytes, shorter than its header", region.len()),
            });
        }
        let buf = region.bytes(0, REGION_HEADER_SIZE as usize);

        if buf[0..4] != kind.magic() {
            return Err(TrieError::Corrupted {
                path,
                reason: format!(
                    "magic bytes not found: expected {:?}, found {:02x}{:02x}{:02x}{:02x}",
                    kind, buf[0], buf[1], buf[2], buf[3]
                ),
            });
        }

        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != FORMAT_VERSION {
            return Err(TrieError::VersionMismatch { path, expected: FORMAT_VERSION, found: version });
        }

        let expected = u32::from_le_bytes([
            buf[CHECKSUM_OFFSET],
            buf[CHECKSUM_OFFSET + 1],
            buf[CHECKSUM_OFFSET + 2],
            buf[CHECKSUM_OFFSET + 3],
        ]);
        let actual = crc32c::crc32c(&buf[..CHECKSUM_OFFSET]);
        if expected != actual {
            return Err(TrieError::ChecksumMismatch { path, expected, actual });
        }

        let mut geometry = [0u64; 4];
        for (i, g) in geometry.iter_mut().enumerate() {
            let at = 8 + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            *g = u64::from_le_bytes(raw);
        }
        Ok(Self { kind, version, geometry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_write_read() {
        let mut region = Region::anonymous(4096).unwrap();
        let header = RegionHeader::new(RegionKind::Hot, [16, 1, 3, 0]);
        header.write(&mut region);
        let parsed = RegionHeader::read(&region, RegionKind::Hot).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_detects_wrong_kind() {
        let mut region = Region::anonymous(4096).unwrap();
        RegionHeader::new(RegionKind::Cold, [1, 2, 3, 4]).write(&mut region);
        let err = RegionHeader::read(&region, RegionKind::Hot).unwrap_err();
        assert!(matches!(err, TrieError::Corrupted { .. }));
    }

    #[test]
    fn test_detects_flipped_geometry_bit() {
        let mut region = Region::anonymous(4096).unwrap();
        RegionHeader::new(RegionKind::Directory, [1024, 0, 0, 0]).write(&mut region);
        let byte = region.bytes(9, 1)[0];
        region.bytes_mut(9, 1)[0] = byte ^ 0x01;
        let err = RegionHeader::read(&region, RegionKind::Directory).unwrap_err();
        assert!(matches!(err, TrieError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_detects_version_mismatch() {
        let mut region = Region::anonymous(4096).unwrap();
        RegionHeader::new(RegionKind::Big, [0; 4]).write(&mut region);
        region.write_u32(4, FORMAT_VERSION + 1);
        let err = RegionHeader::read(&region, RegionKind::Big).unwrap_err();
        assert!(matches!(err, TrieError::VersionMismatch { found, .. } if found == FORMAT_VERSION + 1));
    }

    #[test]
    fn test_zeroed_region_has_no_magic() {
        let region = Region::anonymous(4096).unwrap();
        assert!(RegionHeader::read(&region, RegionKind::Revisions).is_err());
    }
}
