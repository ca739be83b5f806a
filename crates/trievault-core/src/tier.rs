//! Paged tier: header page, list pages and object pages
//!
//! ```text
//!   page 0                     header
//!   pages 1 ..= L              MRU links     {prev: u32, next: u32} per page
//!   pages L+1 ..= 2L           bucket links  {prev: u32, next: u32} per page
//!   pages 2L+1 .. max_pages    object pages
//! ```
//!
//! Header fields after the 64-byte region header:
//!
//! ```text
//!   [64..68]   first_unallocated: u32 - next never-used object page
//!   [68..72]   free_head:         u32 - list of empty pages (bucket links)
//!   [72..76]   mru_head:          u32 - most recently used page
//!   [76..80]   mru_tail:          u32 - least recently used page
//!   [80..84]   pages_in_use:      u32
//!   [128..]    bucket_heads:      [u32; NUM_BUCKETS]
//! ```
//!
//! Page 0 doubles as the null link. An object page is in exactly one of three
//! states: on its bucket's list (has a free slot), on no bucket list (full),
//! or on the free-page list (empty). Hot tiers also keep every page in use on
//! the MRU list; cold tiers do not track recency.

use hashbrown::HashSet;

use crate::directory::{ObjectId, Tier};
use crate::error::{TrieError, TrieResult};
use crate::format::{RegionHeader, RegionKind};
use crate::page::{bucket_for_size, ObjectPage, NUM_BUCKETS, PAGE_SIZE};
use crate::region::Region;

const FIRST_UNALLOCATED: u64 = 64;
const FREE_HEAD: u64 = 68;
const MRU_HEAD: u64 = 72;
const MRU_TAIL: u64 = 76;
const PAGES_IN_USE: u64 = 80;
const BUCKET_HEADS: u64 = 128;

const NULL_PAGE: u32 = 0;
const LINK_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Mru,
    Bucket,
}

/// One paged tier of the object arena.
pub struct PagedTier {
    tier: Tier,
    region: Region,
    max_pages: u32,
    list_pages: u32,
    track_mru: bool,
}

fn region_kind(tier: Tier) -> RegionKind {
    match tier {
        Tier::Hot => RegionKind::Hot,
        Tier::Cold => RegionKind::Cold,
        other => panic!("{} is not a paged tier", other),
    }
}

fn list_pages_for(max_pages: u32) -> u32 {
    (max_pages as u64 * LINK_SIZE).div_ceil(PAGE_SIZE as u64) as u32
}

impl PagedTier {
    /// Format a zeroed region as an empty tier.
    pub fn create(mut region: Region, tier: Tier) -> Self {
        let max_pages = (region.len() / PAGE_SIZE as u64) as u32;
        let list_pages = list_pages_for(max_pages);
        assert!(1 + 2 * list_pages < max_pages, "{} tier of {} pages has no room for objects", tier, max_pages);

        RegionHeader::new(region_kind(tier), [max_pages as u64, list_pages as u64, 0, 0]).write(&mut region);
        let mut paged = Self { tier, region, max_pages, list_pages, track_mru: tier == Tier::Hot };
        paged.set_field(FIRST_UNALLOCATED, paged.first_object_page());
        paged.set_field(FREE_HEAD, NULL_PAGE);
        paged.set_field(MRU_HEAD, NULL_PAGE);
        paged.set_field(MRU_TAIL, NULL_PAGE);
        paged.set_field(PAGES_IN_USE, 0);
        for bucket in 0..NUM_BUCKETS {
            paged.set_bucket_head(bucket, NULL_PAGE);
        }
        paged
    }

    /// Reopen a tier written by `create`.
    pub fn open(region: Region, tier: Tier) -> TrieResult<Self> {
        let header = RegionHeader::read(&region, region_kind(tier))?;
        let max_pages = header.geometry[0] as u32;
        let list_pages = header.geometry[1] as u32;
        if max_pages as u64 * PAGE_SIZE as u64 != region.len() || list_pages != list_pages_for(max_pages) {
            return Err(TrieError::Corrupted {
                path: region.display_path(),
                reason: format!(
                    "{} tier geometry ({} pages, {} list pages) does not match a {} byte file",
                    tier,
                    max_pages,
                    list_pages,
                    region.len()
                ),
            });
        }
        Ok(Self { tier, region, max_pages, list_pages, track_mru: tier == Tier::Hot })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    #[inline]
    fn first_object_page(&self) -> u32 {
        1 + 2 * self.list_pages
    }

    /// Object pages this tier can hold.
    pub fn capacity_pages(&self) -> u32 {
        self.max_pages - self.first_object_page()
    }

    pub fn pages_in_use(&self) -> u32 {
        self.field(PAGES_IN_USE)
    }

    #[inline]
    fn field(&self, offset: u64) -> u32 {
        self.region.read_u32(offset)
    }

    #[inline]
    fn set_field(&mut self, offset: u64, value: u32) {
        self.region.write_u32(offset, value);
    }

    #[inline]
    fn bucket_head_offset(bucket: usize) -> u64 {
        BUCKET_HEADS + bucket as u64 * 4
    }

    fn bucket_head(&self, bucket: usize) -> u32 {
        self.field(Self::bucket_head_offset(bucket))
    }

    fn set_bucket_head(&mut self, bucket: usize, page: u32) {
        self.set_field(Self::bucket_head_offset(bucket), page);
    }

    // -- intrusive page lists ------------------------------------------------

    #[inline]
    fn link_offset(&self, list: List, page: u32) -> u64 {
        let first = match list {
            List::Mru => 1,
            List::Bucket => 1 + self.list_pages,
        };
        first as u64 * PAGE_SIZE as u64 + page as u64 * LINK_SIZE
    }

    fn prev(&self, list: List, page: u32) -> u32 {
        self.region.read_u32(self.link_offset(list, page))
    }

    fn next(&self, list: List, page: u32) -> u32 {
        self.region.read_u32(self.link_offset(list, page) + 4)
    }

    fn set_links(&mut self, list: List, page: u32, prev: u32, next: u32) {
        let at = self.link_offset(list, page);
        self.region.write_u32(at, prev);
        self.region.write_u32(at + 4, next);
    }

    fn set_prev(&mut self, list: List, page: u32, prev: u32) {
        let at = self.link_offset(list, page);
        self.region.write_u32(at, prev);
    }

    fn set_next(&mut self, list: List, page: u32, next: u32) {
        let at = self.link_offset(list, page);
        self.region.write_u32(at + 4, next);
    }

    /// Push `page` at the head of a list whose head lives at `head_at`.
    fn push_front(&mut self, list: List, head_at: u64, tail_at: Option<u64>, page: u32) {
        let head = self.field(head_at);
        self.set_links(list, page, NULL_PAGE, head);
        if head != NULL_PAGE {
            self.set_prev(list, head, page);
        } else if let Some(tail_at) = tail_at {
            self.set_field(tail_at, page);
        }
        self.set_field(head_at, page);
    }

    fn unlink(&mut self, list: List, head_at: u64, tail_at: Option<u64>, page: u32) {
        let prev = self.prev(list, page);
        let next = self.next(list, page);
        if prev != NULL_PAGE {
            self.set_next(list, prev, next);
        } else {
            debug_assert_eq!(self.field(head_at), page);
            self.set_field(head_at, next);
        }
        if next != NULL_PAGE {
            self.set_prev(list, next, prev);
        } else if let Some(tail_at) = tail_at {
            self.set_field(tail_at, prev);
        }
        self.set_links(list, page, NULL_PAGE, NULL_PAGE);
    }

    // -- page lifecycle ------------------------------------------------------

    /// Take an empty page: recycled first, then never-used.
    fn fresh_page(&mut self) -> Option<u32> {
        let free = self.field(FREE_HEAD);
        if free != NULL_PAGE {
            self.unlink(List::Bucket, FREE_HEAD, None, free);
            return Some(free);
        }
        let next = self.field(FIRST_UNALLOCATED);
        if next < self.max_pages {
            self.set_field(FIRST_UNALLOCATED, next + 1);
            return Some(next);
        }
        None
    }

    /// Move `page` to the front of the MRU list.
    pub fn touch(&mut self, page: u32) {
        if self.track_mru && self.field(MRU_HEAD) != page {
            self.unlink(List::Mru, MRU_HEAD, Some(MRU_TAIL), page);
            self.push_front(List::Mru, MRU_HEAD, Some(MRU_TAIL), page);
        }
    }

    /// Least recently used page, the eviction victim.
    pub fn lru_page(&self) -> Option<u32> {
        match self.field(MRU_TAIL) {
            NULL_PAGE => None,
            page => Some(page),
        }
    }

    /// Allocate an `obj_size` slot owned by `id`; returns its offset.
    ///
    /// `None` when the bucket has no partially free page and no empty page is
    /// left in the tier.
    pub fn alloc_slot(&mut self, obj_size: u16, id: ObjectId) -> Option<u64> {
        let bucket = bucket_for_size(obj_size);
        let head = self.bucket_head(bucket);
        let bucket_at = Self::bucket_head_offset(bucket);

        let page_no = if head != NULL_PAGE {
            head
        } else {
            let page_no = self.fresh_page()?;
            ObjectPage::at(page_no).init(&mut self.region, obj_size);
            self.push_front(List::Bucket, bucket_at, None, page_no);
            if self.track_mru {
                self.push_front(List::Mru, MRU_HEAD, Some(MRU_TAIL), page_no);
            }
            self.set_field(PAGES_IN_USE, self.pages_in_use() + 1);
            page_no
        };

        let page = ObjectPage::at(page_no);
        debug_assert_eq!(page.obj_size(&self.region), obj_size);
        let offset = page.alloc(&mut self.region, id);
        if page.is_full(&self.region) {
            self.unlink(List::Bucket, bucket_at, None, page_no);
        }
        self.touch(page_no);
        Some(offset)
    }

    /// Free the slot at `offset`, recycling its page once it is empty.
    pub fn free_slot(&mut self, offset: u64) {
        let page = ObjectPage::containing(offset);
        let page_no = page.number();
        assert!(
            page_no >= self.first_object_page() && page_no < self.field(FIRST_UNALLOCATED),
            "free of offset {} outside the {} tier's object pages",
            offset,
            self.tier
        );
        let bucket_at = Self::bucket_head_offset(bucket_for_size(page.obj_size(&self.region)));
        let was_full = page.is_full(&self.region);
        page.free(&mut self.region, offset);

        if page.is_empty(&self.region) {
            if !was_full {
                self.unlink(List::Bucket, bucket_at, None, page_no);
            }
            if self.track_mru {
                self.unlink(List::Mru, MRU_HEAD, Some(MRU_TAIL), page_no);
            }
            self.push_front(List::Bucket, FREE_HEAD, None, page_no);
            self.set_field(PAGES_IN_USE, self.pages_in_use() - 1);
        } else if was_full {
            self.push_front(List::Bucket, bucket_at, None, page_no);
        }
    }

    /// Slot size of the page holding `offset`.
    pub fn obj_size_at(&self, offset: u64) -> u16 {
        ObjectPage::containing(offset).obj_size(&self.region)
    }

    /// Slot bytes at `offset`.
    pub fn slot(&self, offset: u64) -> &[u8] {
        let size = self.obj_size_at(offset);
        self.region.bytes(offset, size as usize)
    }

    pub fn slot_mut(&mut self, offset: u64) -> &mut [u8] {
        let size = self.obj_size_at(offset);
        self.region.bytes_mut(offset, size as usize)
    }

    /// Live objects of `page_no` as `(offset, owner)`.
    pub fn occupants(&self, page_no: u32) -> Vec<(u64, ObjectId)> {
        let page = ObjectPage::at(page_no);
        page.occupied(&self.region)
            .into_iter()
            .map(|(index, id)| (page.slot_offset(&self.region, index), id))
            .collect()
    }

    /// Object pages currently holding at least one object.
    pub fn pages(&self) -> Vec<u32> {
        let mut free = HashSet::new();
        let mut cursor = self.field(FREE_HEAD);
        while cursor != NULL_PAGE {
            free.insert(cursor);
            cursor = self.next(List::Bucket, cursor);
        }
        (self.first_object_page()..self.field(FIRST_UNALLOCATED))
            .filter(|p| !free.contains(p))
            .collect()
    }

    /// Check every page's free list and the list bookkeeping; one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let pages = self.pages();
        if pages.len() as u32 != self.pages_in_use() {
            problems.push(format!(
                "{} tier: {} pages hold objects but {} are recorded in use",
                self.tier,
                pages.len(),
                self.pages_in_use()
            ));
        }
        for page_no in &pages {
            let page = ObjectPage::at(*page_no);
            if let Err(problem) = page.validate(&self.region) {
                problems.push(format!("{} tier: {}", self.tier, problem));
                continue;
            }
            if page.is_empty(&self.region) {
                problems.push(format!("{} tier: empty page {} is not on the free list", self.tier, page_no));
            }
        }
        if self.track_mru {
            let mut seen = 0usize;
            let mut cursor = self.field(MRU_HEAD);
            while cursor != NULL_PAGE && seen <= pages.len() {
                seen += 1;
                cursor = self.next(List::Mru, cursor);
            }
            if seen != pages.len() {
                problems.push(format!(
                    "{} tier: MRU list has {} pages, {} pages hold objects",
                    self.tier,
                    seen,
                    pages.len()
                ));
            }
        }
        problems
    }

    pub fn sync(&self) -> TrieResult<()> {
        self.region.sync()
    }
}
