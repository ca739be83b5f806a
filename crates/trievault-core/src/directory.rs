//! Object directory: stable identifiers, locations and reference counts
//!
//! Every arena object is named by an [`ObjectId`]. The directory maps each id
//! to one 64-bit word holding where the object's bytes live and how many
//! parents reference it:
//!
//! ```text
//!   bits 63..18  offset   (46 bits, byte offset inside the tier region)
//!   bits 17..16  tier     (cold = 0, hot = 1, big-cold = 2, big-hot = 3)
//!   bits 15..0   refcount
//! ```
//!
//! Free ids form a singly linked list threaded through their own words
//! (refcount 0, next free id in the offset bits). An id is never reused while
//! its refcount is non-zero; its location may change at any time.
//!
//! Region layout: 64-byte [`RegionHeader`], then `first_free: u32`,
//! `high_water: u32`, `live: u64` at offset 64, then one word per id starting
//! at offset 128 (id 0 is the null id and is never issued).

use std::fmt;
use std::num::NonZeroU32;

use crate::error::{TrieError, TrieResult};
use crate::format::{RegionHeader, RegionKind};
use crate::page::PAGE_SIZE;
use crate::region::Region;

const FIRST_FREE_OFFSET: u64 = 64;
const HIGH_WATER_OFFSET: u64 = 68;
const LIVE_OFFSET: u64 = 72;
const ENTRIES_OFFSET: u64 = 128;

const REF_BITS: u64 = 16;
const TIER_BITS: u64 = 2;
const REF_MASK: u64 = (1 << REF_BITS) - 1;
const OFFSET_SHIFT: u64 = REF_BITS + TIER_BITS;

/// Largest offset a directory word can hold.
pub const MAX_OFFSET: u64 = (1 << 46) - 1;

/// Opaque handle naming one arena object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(NonZeroU32);

impl ObjectId {
    /// `None` for the null id 0.
    #[inline]
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ObjectId)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Raw encoding of an optional id, 0 meaning none.
    #[inline]
    pub fn to_raw(id: Option<ObjectId>) -> u32 {
        id.map_or(0, ObjectId::get)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Storage tier of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tier {
    /// Evicted, paged
    Cold = 0,
    /// Cached, paged, MRU-tracked
    Hot = 1,
    /// Evicted big object (reserved, big objects are never evicted)
    BigCold = 2,
    /// Big object in the segment allocator
    BigHot = 3,
}

impl Tier {
    fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => Tier::Cold,
            1 => Tier::Hot,
            2 => Tier::BigCold,
            _ => Tier::BigHot,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Cold => "cold",
            Tier::Hot => "hot",
            Tier::BigCold => "big-cold",
            Tier::BigHot => "big-hot",
        })
    }
}

/// Where an object's bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// Byte offset inside the tier's region
    pub offset: u64,
    pub tier: Tier,
}

impl Location {
    /// Placeholder for ids that have not been placed yet.
    pub const UNPLACED: Location = Location { offset: 0, tier: Tier::Hot };
}

#[inline]
fn pack(loc: Location, refs: u16) -> u64 {
    debug_assert!(loc.offset <= MAX_OFFSET);
    (loc.offset << OFFSET_SHIFT) | ((loc.tier as u64) << REF_BITS) | refs as u64
}

#[inline]
fn unpack(word: u64) -> (Location, u16) {
    let loc = Location {
        offset: word >> OFFSET_SHIFT,
        tier: Tier::from_bits(word >> REF_BITS),
    };
    (loc, (word & REF_MASK) as u16)
}

/// Maps object ids to `{location, refcount}`.
pub struct ObjectDirectory {
    region: Region,
    max_objects: u32,
}

impl ObjectDirectory {
    /// Bytes a directory for `max_objects` ids needs, rounded to whole pages.
    pub fn region_len(max_objects: u32) -> u64 {
        let raw = ENTRIES_OFFSET + (max_objects as u64 + 1) * 8;
        raw.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64
    }

    /// Initialize a fresh directory in a zeroed region.
    pub fn create(mut region: Region, max_objects: u32) -> Self {
        assert!(region.len() >= Self::region_len(max_objects), "directory region too small");
        RegionHeader::new(RegionKind::Directory, [max_objects as u64, 0, 0, 0]).write(&mut region);
        region.write_u32(FIRST_FREE_OFFSET, 0);
        region.write_u32(HIGH_WATER_OFFSET, 0);
        region.write_u64(LIVE_OFFSET, 0);
        Self { region, max_objects }
    }

    /// Reopen a directory written by `create`.
    pub fn open(region: Region) -> TrieResult<Self> {
        let header = RegionHeader::read(&region, RegionKind::Directory)?;
        let max_objects = header.geometry[0] as u32;
        if region.len() < Self::region_len(max_objects) {
            return Err(TrieError::Corrupted {
                path: region.display_path(),
                reason: format!("directory for {} ids truncated to {} bytes", max_objects, region.len()),
            });
        }
        Ok(Self { region, max_objects })
    }

    #[inline]
    fn word_offset(id: u32) -> u64 {
        ENTRIES_OFFSET + id as u64 * 8
    }

    #[inline]
    fn word(&self, id: ObjectId) -> u64 {
        assert!(
            id.get() <= self.high_water(),
            "object id {} was never allocated (high water {})",
            id,
            self.high_water()
        );
        self.region.read_u64(Self::word_offset(id.get()))
    }

    #[inline]
    fn set_word(&mut self, id: u32, word: u64) {
        self.region.write_u64(Self::word_offset(id), word);
    }

    fn first_free(&self) -> u32 {
        self.region.read_u32(FIRST_FREE_OFFSET)
    }

    fn high_water(&self) -> u32 {
        self.region.read_u32(HIGH_WATER_OFFSET)
    }

    /// Number of ids with a non-zero refcount.
    pub fn live(&self) -> u64 {
        self.region.read_u64(LIVE_OFFSET)
    }

    pub fn capacity(&self) -> u32 {
        self.max_objects
    }

    /// Reserve a fresh id with refcount 1 and no location.
    pub fn alloc(&mut self) -> TrieResult<ObjectId> {
        let free = self.first_free();
        let raw = if free != 0 {
            let word = self.region.read_u64(Self::word_offset(free));
            assert_eq!(word & REF_MASK, 0, "free-list id {} has a live refcount", free);
            self.region.write_u32(FIRST_FREE_OFFSET, (word >> OFFSET_SHIFT) as u32);
            free
        } else {
            let next = self.high_water() + 1;
            if next > self.max_objects {
                return Err(TrieError::ObjectIdsExhausted { max_objects: self.max_objects });
            }
            self.region.write_u32(HIGH_WATER_OFFSET, next);
            next
        };
        self.set_word(raw, pack(Location::UNPLACED, 1));
        self.region.write_u64(LIVE_OFFSET, self.live() + 1);
        Ok(ObjectId::new(raw).expect("issued ids are never 0"))
    }

    /// Record where `id`'s bytes now live; the refcount is preserved.
    pub fn set(&mut self, id: ObjectId, loc: Location) {
        let (_, refs) = unpack(self.word(id));
        assert!(refs > 0, "set() on released object {}", id);
        self.set_word(id.get(), pack(loc, refs));
    }

    /// Current location of a live object.
    pub fn get(&self, id: ObjectId) -> Location {
        let (loc, refs) = unpack(self.word(id));
        assert!(refs > 0, "get() on released object {}", id);
        loc
    }

    pub fn ref_count(&self, id: ObjectId) -> u16 {
        unpack(self.word(id)).1
    }

    /// Add one reference.
    pub fn retain(&mut self, id: ObjectId) {
        let word = self.word(id);
        let (loc, refs) = unpack(word);
        assert!(refs > 0, "retain() on released object {}", id);
        let refs = refs
            .checked_add(1)
            .unwrap_or_else(|| panic!("refcount overflow on object {}", id));
        self.set_word(id.get(), pack(loc, refs));
    }

    /// Drop one reference.
    ///
    /// Returns the orphaned location when the count reaches zero, so the
    /// caller can free the backing storage; `None` while the object is live.
    pub fn release(&mut self, id: ObjectId) -> Option<Location> {
        let (loc, refs) = unpack(self.word(id));
        assert!(refs > 0, "release() on already released object {}", id);
        if refs > 1 {
            self.set_word(id.get(), pack(loc, refs - 1));
            return None;
        }
        let next_free = self.first_free() as u64;
        self.set_word(id.get(), next_free << OFFSET_SHIFT);
        self.region.write_u32(FIRST_FREE_OFFSET, id.get());
        self.region.write_u64(LIVE_OFFSET, self.live() - 1);
        Some(loc)
    }

    /// Every id with a non-zero refcount, in id order.
    pub fn live_ids(&self) -> impl Iterator<Item = (ObjectId, Location, u16)> + '_ {
        (1..=self.high_water()).filter_map(move |raw| {
            let (loc, refs) = unpack(self.region.read_u64(Self::word_offset(raw)));
            if refs == 0 {
                return None;
            }
            ObjectId::new(raw).map(|id| (id, loc, refs))
        })
    }

    pub fn sync(&self) -> TrieResult<()> {
        self.region.sync()
    }
}
