//! Object pages, fixed-size blocks of equal-size slots
//!
//! Layout of one 4096-byte page:
//!
//! ```text
//!   [0..2]   obj_size:   u16 - slot size, a multiple of 8
//!   [2..4]   free_slot:  u16 - head of the free-slot list, 0xFFFF when full
//!   [4..6]   num_items:  u16 - slots in this page
//!   [6..8]   start_data: u16 - offset of slot 0
//!   [8..]    ids:        [u32; num_items] - owner of each slot, 0 when free
//!   padding to 8
//!   slots:   [[u8; obj_size]; num_items]
//! ```
//!
//! A free slot stores `next_free: u16` and `free_count: u16` (the number of
//! free slots from itself to the end of the list) in its first four bytes, so
//! `num_free` is a single read of the head slot.

use crate::directory::ObjectId;
use crate::region::Region;

/// Size of every page in every paged tier
pub const PAGE_SIZE: usize = 4096;

/// Objects of this size or larger go to the big-object segment
pub const MAX_SMALL_OBJECT: usize = 4000;

/// Smallest slot: must hold the free-list link
pub const MIN_SLOT_SIZE: u16 = 8;

/// Number of 8-byte size buckets
pub const NUM_BUCKETS: usize = MAX_SMALL_OBJECT / 8 + 1;

const PAGE_HEADER_SIZE: u16 = 8;
const ID_SIZE: u16 = 4;
const NULL_SLOT: u16 = u16::MAX;

/// Round an object size up to its slot size.
#[inline]
pub fn round_up_size(size: usize) -> u16 {
    let rounded = ((size + 7) & !7).max(MIN_SLOT_SIZE as usize);
    debug_assert!(rounded <= MAX_SMALL_OBJECT);
    rounded as u16
}

/// Bucket index for a rounded slot size.
#[inline]
pub fn bucket_for_size(obj_size: u16) -> usize {
    obj_size as usize / 8
}

/// Slots of `obj_size` bytes that fit one page, leaving room for id padding.
#[inline]
pub fn slots_per_page(obj_size: u16) -> u16 {
    (PAGE_SIZE as u16 - PAGE_HEADER_SIZE - ID_SIZE) / (ID_SIZE + obj_size)
}

/// Handle to one page of a paged region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectPage {
    base: u64,
}

impl ObjectPage {
    pub fn at(page_no: u32) -> Self {
        Self { base: page_no as u64 * PAGE_SIZE as u64 }
    }

    /// Page containing the byte at `offset`.
    pub fn containing(offset: u64) -> Self {
        Self::at((offset / PAGE_SIZE as u64) as u32)
    }

    pub fn number(&self) -> u32 {
        (self.base / PAGE_SIZE as u64) as u32
    }

    /// Format the page for `obj_size` slots, every slot free.
    pub fn init(&self, region: &mut Region, obj_size: u16) {
        assert!(obj_size % 8 == 0 && obj_size >= MIN_SLOT_SIZE, "bad slot size {}", obj_size);
        let n = slots_per_page(obj_size);
        assert!(n > 0, "slot size {} does not fit a page", obj_size);
        let start = PAGE_HEADER_SIZE + ((n * ID_SIZE + 7) & !7);

        region.write_u16(self.base, obj_size);
        region.write_u16(self.base + 2, 0);
        region.write_u16(self.base + 4, n);
        region.write_u16(self.base + 6, start);
        region
            .bytes_mut(self.base + PAGE_HEADER_SIZE as u64, (n * ID_SIZE) as usize)
            .fill(0);

        for i in 0..n {
            let slot = self.slot_offset_raw(start, obj_size, i);
            let next = if i + 1 == n { NULL_SLOT } else { i + 1 };
            region.write_u16(slot, next);
            region.write_u16(slot + 2, n - i);
        }
        debug_assert_eq!(self.validate(region), Ok(()));
    }

    #[inline]
    fn slot_offset_raw(&self, start: u16, obj_size: u16, index: u16) -> u64 {
        self.base + start as u64 + obj_size as u64 * index as u64
    }

    #[inline]
    pub fn obj_size(&self, region: &Region) -> u16 {
        region.read_u16(self.base)
    }

    #[inline]
    fn free_slot(&self, region: &Region) -> u16 {
        region.read_u16(self.base + 2)
    }

    #[inline]
    pub fn num_items(&self, region: &Region) -> u16 {
        region.read_u16(self.base + 4)
    }

    #[inline]
    fn start_data(&self, region: &Region) -> u16 {
        region.read_u16(self.base + 6)
    }

    /// Absolute region offset of slot `index`.
    #[inline]
    pub fn slot_offset(&self, region: &Region, index: u16) -> u64 {
        self.slot_offset_raw(self.start_data(region), self.obj_size(region), index)
    }

    /// Slot index of the slot starting at absolute `offset`.
    pub fn slot_index(&self, region: &Region, offset: u64) -> u16 {
        let start = self.base + self.start_data(region) as u64;
        assert!(offset >= start, "offset {} precedes page data", offset);
        let size = self.obj_size(region) as u64;
        assert_eq!((offset - start) % size, 0, "offset {} is not a slot boundary", offset);
        let index = ((offset - start) / size) as u16;
        assert!(index < self.num_items(region), "offset {} is past the last slot", offset);
        index
    }

    #[inline]
    fn id_offset(&self, index: u16) -> u64 {
        self.base + PAGE_HEADER_SIZE as u64 + index as u64 * ID_SIZE as u64
    }

    /// Owner of slot `index`, None if the slot is free.
    #[inline]
    pub fn id_at(&self, region: &Region, index: u16) -> Option<ObjectId> {
        ObjectId::new(region.read_u32(self.id_offset(index)))
    }

    pub fn num_free(&self, region: &Region) -> u16 {
        let head = self.free_slot(region);
        if head == NULL_SLOT {
            return 0;
        }
        region.read_u16(self.slot_offset(region, head) + 2)
    }

    #[inline]
    pub fn is_full(&self, region: &Region) -> bool {
        self.free_slot(region) == NULL_SLOT
    }

    #[inline]
    pub fn is_empty(&self, region: &Region) -> bool {
        self.num_free(region) == self.num_items(region)
    }

    /// Take the head free slot for `id`; returns its absolute offset.
    pub fn alloc(&self, region: &mut Region, id: ObjectId) -> u64 {
        let head = self.free_slot(region);
        assert!(head != NULL_SLOT, "alloc from full page {}", self.number());
        let before = self.num_free(region);
        if let Some(owner) = self.id_at(region, head) {
            panic!("free slot {} of page {} is owned by {}", head, self.number(), owner);
        }

        let slot = self.slot_offset(region, head);
        let next = region.read_u16(slot);
        region.write_u32(self.id_offset(head), id.get());
        region.write_u16(self.base + 2, next);

        debug_assert_eq!(self.num_free(region) + 1, before);
        slot
    }

    /// Return the slot at absolute `offset` to the free list.
    pub fn free(&self, region: &mut Region, offset: u64) {
        let index = self.slot_index(region, offset);
        assert!(
            self.id_at(region, index).is_some(),
            "double free of slot {} in page {}",
            index,
            self.number()
        );
        let count = self.num_free(region) + 1;
        let head = self.free_slot(region);
        region.write_u16(offset, head);
        region.write_u16(offset + 2, count);
        region.write_u16(self.base + 2, index);
        region.write_u32(self.id_offset(index), 0);
    }

    /// Occupied slots as `(index, owner)`.
    pub fn occupied(&self, region: &Region) -> Vec<(u16, ObjectId)> {
        (0..self.num_items(region))
            .filter_map(|i| self.id_at(region, i).map(|id| (i, id)))
            .collect()
    }

    /// Check header sanity and that the free list agrees with the id array.
    pub fn validate(&self, region: &Region) -> Result<(), String> {
        let size = self.obj_size(region);
        let n = self.num_items(region);
        if size % 8 != 0 || size < MIN_SLOT_SIZE || size as usize > MAX_SMALL_OBJECT {
            return Err(format!("page {}: bad slot size {}", self.number(), size));
        }
        if n != slots_per_page(size) {
            return Err(format!("page {}: {} slots, expected {}", self.number(), n, slots_per_page(size)));
        }

        let free_ids = (0..n).filter(|i| self.id_at(region, *i).is_none()).count() as u16;
        let mut expected = free_ids;
        let mut cursor = self.free_slot(region);
        let mut seen = 0u16;
        while cursor != NULL_SLOT {
            if cursor >= n {
                return Err(format!("page {}: free link {} out of range", self.number(), cursor));
            }
            if self.id_at(region, cursor).is_some() {
                return Err(format!("page {}: free list reaches occupied slot {}", self.number(), cursor));
            }
            let slot = self.slot_offset(region, cursor);
            let count = region.read_u16(slot + 2);
            if count != expected {
                return Err(format!(
                    "page {}: slot {} records {} free, expected {}",
                    self.number(),
                    cursor,
                    count,
                    expected
                ));
            }
            expected -= 1;
            seen += 1;
            if seen > n {
                return Err(format!("page {}: free list cycles", self.number()));
            }
            cursor = region.read_u16(slot);
        }
        if expected != 0 {
            return Err(format!("page {}: {} free slots unreachable from the free list", self.number(), expected));
        }
        Ok(())
    }
}
