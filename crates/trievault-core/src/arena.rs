//! Object arena: hot/cold paged allocator behind stable object ids
//!
//! Small objects live in size-bucketed pages of the hot tier. When the hot
//! tier runs out of pages, the least recently used hot page is evicted whole:
//! each of its objects is copied into a cold slot of the same size and its
//! directory entry repointed. Reading a cold object promotes it back to the
//! hot tier. Objects at or above the big-object threshold live in the big
//! segment and never move.
//!
//! Any `get`, `alloc` or `rewrite` may relocate objects, so callers hold ids,
//! never slices, across arena calls.

use std::path::Path;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{Location, ObjectDirectory, ObjectId, Tier};
use crate::error::{TrieError, TrieResult};
use crate::format::RegionKind;
use crate::page::{round_up_size, ObjectPage};
use crate::region::Region;
use crate::segment::BigSegment;
use crate::tier::PagedTier;

/// Arena counters, a snapshot taken by [`ObjectArena::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Hot pages evicted to the cold tier since open
    pub swaps: u64,
    /// Cold objects promoted back to the hot tier since open
    pub promotions: u64,
    /// Objects with a non-zero refcount
    pub live_objects: u64,
    pub hot_pages_in_use: u32,
    pub hot_pages_capacity: u32,
    pub cold_pages_in_use: u32,
    pub cold_pages_capacity: u32,
    /// Bytes held by live big objects, block tags included
    pub big_bytes_in_use: u64,
}

/// The object arena: directory, hot tier, cold tier and big segment.
pub struct ObjectArena {
    objects: ObjectDirectory,
    hot: PagedTier,
    cold: PagedTier,
    big: BigSegment,
    big_threshold: usize,
    swaps: u64,
    promotions: u64,
}

impl ObjectArena {
    /// Arena over anonymous memory.
    pub fn in_memory(config: &Config) -> TrieResult<Self> {
        config.validate()?;
        let objects = ObjectDirectory::create(
            Region::anonymous(ObjectDirectory::region_len(config.max_objects))?,
            config.max_objects,
        );
        let hot = PagedTier::create(Region::anonymous(config.hot_bytes)?, Tier::Hot);
        let cold = PagedTier::create(Region::anonymous(config.cold_bytes)?, Tier::Cold);
        let big = BigSegment::create(Region::anonymous(config.big_bytes)?);
        Ok(Self::from_parts(objects, hot, cold, big, config))
    }

    /// Arena over the region files in `dir`, formatting them when `create` is set.
    ///
    /// Existing files keep the geometry they were created with; only
    /// `big_object_threshold` is taken from `config` on reopen.
    pub fn open(dir: &Path, config: &Config, create: bool) -> TrieResult<Self> {
        config.validate()?;
        let region = |kind: RegionKind, len: u64| -> TrieResult<Region> {
            Region::open_file(&dir.join(kind.file_name()), len).map(|(region, _)| region)
        };

        let arena = if create {
            let objects = ObjectDirectory::create(
                region(RegionKind::Directory, ObjectDirectory::region_len(config.max_objects))?,
                config.max_objects,
            );
            let hot = PagedTier::create(region(RegionKind::Hot, config.hot_bytes)?, Tier::Hot);
            let cold = PagedTier::create(region(RegionKind::Cold, config.cold_bytes)?, Tier::Cold);
            let big = BigSegment::create(region(RegionKind::Big, config.big_bytes)?);
            Self::from_parts(objects, hot, cold, big, config)
        } else {
            let objects = ObjectDirectory::open(region(RegionKind::Directory, 0)?)?;
            let hot = PagedTier::open(region(RegionKind::Hot, 0)?, Tier::Hot)?;
            let cold = PagedTier::open(region(RegionKind::Cold, 0)?, Tier::Cold)?;
            let big = BigSegment::open(region(RegionKind::Big, 0)?)?;
            Self::from_parts(objects, hot, cold, big, config)
        };

        info!(
            dir = %dir.display(),
            created = create,
            live_objects = arena.objects.live(),
            hot_pages = arena.hot.pages_in_use(),
            cold_pages = arena.cold.pages_in_use(),
            "object arena opened"
        );
        Ok(arena)
    }

    fn from_parts(
        objects: ObjectDirectory,
        hot: PagedTier,
        cold: PagedTier,
        big: BigSegment,
        config: &Config,
    ) -> Self {
        Self {
            objects,
            hot,
            cold,
            big,
            big_threshold: config.big_object_threshold,
            swaps: 0,
            promotions: 0,
        }
    }

    fn paged(&self, tier: Tier) -> &PagedTier {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Cold => &self.cold,
            other => panic!("{} objects are not paged", other),
        }
    }

    fn paged_mut(&mut self, tier: Tier) -> &mut PagedTier {
        match tier {
            Tier::Hot => &mut self.hot,
            Tier::Cold => &mut self.cold,
            other => panic!("{} objects are not paged", other),
        }
    }

    fn bytes_at(&self, loc: Location) -> &[u8] {
        match loc.tier {
            Tier::Hot | Tier::Cold => self.paged(loc.tier).slot(loc.offset),
            Tier::BigHot | Tier::BigCold => self.big.bytes(loc.offset),
        }
    }

    fn free_location(&mut self, loc: Location) {
        match loc.tier {
            Tier::Hot | Tier::Cold => self.paged_mut(loc.tier).free_slot(loc.offset),
            Tier::BigHot | Tier::BigCold => self.big.free(loc.offset),
        }
    }

    /// Allocate an object holding a copy of `data`; its refcount starts at 1.
    pub fn alloc(&mut self, data: &[u8]) -> TrieResult<ObjectId> {
        let id = self.objects.alloc()?;
        match self.place(id, data) {
            Ok(loc) => {
                self.objects.set(id, loc);
                Ok(id)
            }
            Err(err) => {
                self.objects.release(id);
                Err(err)
            }
        }
    }

    /// Find storage for `data` owned by `id` and copy it there.
    ///
    /// Does not touch `id`'s directory entry.
    fn place(&mut self, id: ObjectId, data: &[u8]) -> TrieResult<Location> {
        if data.len() >= self.big_threshold {
            let offset = self.big.alloc(data.len()).ok_or_else(|| {
                warn!(requested_bytes = data.len(), "big object segment exhausted");
                TrieError::NoFreePages { tier: Tier::BigHot, requested_bytes: data.len() }
            })?;
            self.big.bytes_mut(offset).copy_from_slice(data);
            return Ok(Location { offset, tier: Tier::BigHot });
        }

        let offset = self.hot_slot(round_up_size(data.len()), id, data.len())?;
        let slot = self.hot.slot_mut(offset);
        slot[..data.len()].copy_from_slice(data);
        slot[data.len()..].fill(0);
        Ok(Location { offset, tier: Tier::Hot })
    }

    /// Allocate a hot slot, evicting the least recently used page and retrying once.
    fn hot_slot(&mut self, obj_size: u16, id: ObjectId, requested_bytes: usize) -> TrieResult<u64> {
        if let Some(offset) = self.hot.alloc_slot(obj_size, id) {
            return Ok(offset);
        }
        self.evict_lru(requested_bytes)?;
        self.hot.alloc_slot(obj_size, id).ok_or_else(|| {
            warn!(requested_bytes, "hot tier exhausted after eviction");
            TrieError::NoFreePages { tier: Tier::Hot, requested_bytes }
        })
    }

    /// Move every object of the least recently used hot page to the cold tier.
    ///
    /// The page is emptied completely before anything else is allocated in
    /// the hot tier, and ends up on the hot free-page list.
    fn evict_lru(&mut self, requested_bytes: usize) -> TrieResult<()> {
        let page = self.hot.lru_page().ok_or_else(|| {
            warn!(requested_bytes, "hot tier has no page to evict");
            TrieError::NoFreePages { tier: Tier::Hot, requested_bytes }
        })?;

        let occupants = self.hot.occupants(page);
        for (offset, id) in &occupants {
            let size = self.hot.obj_size_at(*offset);
            let cold_offset = self.cold.alloc_slot(size, *id).ok_or_else(|| {
                warn!(page, object = %id, "cold tier exhausted during eviction");
                TrieError::NoFreePages { tier: Tier::Cold, requested_bytes: size as usize }
            })?;
            self.cold.slot_mut(cold_offset).copy_from_slice(self.hot.slot(*offset));
            self.objects.set(*id, Location { offset: cold_offset, tier: Tier::Cold });
            self.hot.free_slot(*offset);
        }

        self.swaps += 1;
        debug!(page, objects = occupants.len(), swaps = self.swaps, "evicted hot page");
        Ok(())
    }

    /// Copy a cold object into a fresh hot slot and free the cold one.
    fn promote(&mut self, id: ObjectId, cold: Location) -> TrieResult<Location> {
        let size = self.cold.obj_size_at(cold.offset);
        let offset = self.hot_slot(size, id, size as usize)?;
        // eviction only moves hot objects, so the cold slot is still ours
        self.hot.slot_mut(offset).copy_from_slice(self.cold.slot(cold.offset));
        let hot = Location { offset, tier: Tier::Hot };
        self.objects.set(id, hot);
        self.cold.free_slot(cold.offset);
        self.promotions += 1;
        Ok(hot)
    }

    /// Bytes of a live object, promoting it to the hot tier if it was evicted.
    ///
    /// Paged objects come back as their whole slot: the tail past the
    /// written length is zero.
    pub fn get(&mut self, id: ObjectId) -> TrieResult<&[u8]> {
        let loc = self.objects.get(id);
        let loc = match loc.tier {
            Tier::Hot => {
                self.hot.touch(ObjectPage::containing(loc.offset).number());
                loc
            }
            Tier::Cold => self.promote(id, loc)?,
            Tier::BigHot | Tier::BigCold => loc,
        };
        Ok(self.bytes_at(loc))
    }

    /// Bytes of a live object without promotion or MRU update.
    pub fn peek(&self, id: ObjectId) -> &[u8] {
        self.bytes_at(self.objects.get(id))
    }

    /// Replace an object's contents, keeping its id and refcount.
    ///
    /// Same-size contents are written in place. Otherwise new storage is
    /// allocated first and the old location, which that allocation may have
    /// moved, is freed afterwards.
    pub fn rewrite(&mut self, id: ObjectId, data: &[u8]) -> TrieResult<()> {
        let loc = self.objects.get(id);
        let small = data.len() < self.big_threshold;
        let in_place = match loc.tier {
            Tier::Hot | Tier::Cold => small && round_up_size(data.len()) == self.paged(loc.tier).obj_size_at(loc.offset),
            Tier::BigHot | Tier::BigCold => !small && self.big.payload_len(loc.offset) == data.len(),
        };

        if in_place {
            match loc.tier {
                Tier::Hot | Tier::Cold => {
                    let tier = self.paged_mut(loc.tier);
                    let slot = tier.slot_mut(loc.offset);
                    slot[..data.len()].copy_from_slice(data);
                    slot[data.len()..].fill(0);
                    if loc.tier == Tier::Hot {
                        self.hot.touch(ObjectPage::containing(loc.offset).number());
                    }
                }
                Tier::BigHot | Tier::BigCold => self.big.bytes_mut(loc.offset).copy_from_slice(data),
            }
            return Ok(());
        }

        let new = self.place(id, data)?;
        let old = self.objects.get(id);
        self.objects.set(id, new);
        self.free_location(old);
        Ok(())
    }

    /// Add a reference to a live object.
    pub fn retain(&mut self, id: ObjectId) {
        self.objects.retain(id);
    }

    /// Drop a reference; frees the storage and returns true when it was the last one.
    pub fn release(&mut self, id: ObjectId) -> bool {
        self.release_with(id, |_| ()).is_some()
    }

    /// Drop a reference. When it was the last one, `f` sees the object's
    /// bytes just before they are freed and its result is returned.
    pub fn release_with<R>(&mut self, id: ObjectId, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if self.objects.ref_count(id) != 1 {
            // panics on an already released id
            self.objects.release(id);
            return None;
        }
        let loc = self.objects.get(id);
        let out = f(self.bytes_at(loc));
        let freed = self.objects.release(id);
        debug_assert_eq!(freed, Some(loc));
        self.free_location(loc);
        Some(out)
    }

    pub fn ref_count(&self, id: ObjectId) -> u16 {
        self.objects.ref_count(id)
    }

    /// Current location of a live object.
    pub fn location(&self, id: ObjectId) -> Location {
        self.objects.get(id)
    }

    /// Every live object as `(id, location, refcount)`.
    pub fn live_objects(&self) -> impl Iterator<Item = (ObjectId, Location, u16)> + '_ {
        self.objects.live_ids()
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            swaps: self.swaps,
            promotions: self.promotions,
            live_objects: self.objects.live(),
            hot_pages_in_use: self.hot.pages_in_use(),
            hot_pages_capacity: self.hot.capacity_pages(),
            cold_pages_in_use: self.cold.pages_in_use(),
            cold_pages_capacity: self.cold.capacity_pages(),
            big_bytes_in_use: self.big.used_bytes(),
        }
    }

    /// Validate page free lists and that directory and slot owners agree.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.hot.validate();
        problems.extend(self.cold.validate());
        if !problems.is_empty() {
            // owner ids of a corrupt page cannot be trusted
            return problems;
        }

        // big blocks carry no owner id and match by location only
        let mut owners: HashMap<(Tier, u64), Option<ObjectId>> = HashMap::new();
        for tier in [&self.hot, &self.cold] {
            for page in tier.pages() {
                for (offset, id) in tier.occupants(page) {
                    owners.insert((tier.tier(), offset), Some(id));
                }
            }
        }
        for offset in self.big.live_blocks() {
            owners.insert((Tier::BigHot, offset), None);
        }

        for (id, loc, _) in self.objects.live_ids() {
            match owners.remove(&(loc.tier, loc.offset)) {
                Some(None) => {}
                Some(Some(owner)) if owner == id => {}
                Some(Some(owner)) => {
                    problems.push(format!("{} at {} offset {} is owned by {}", id, loc.tier, loc.offset, owner))
                }
                None => problems.push(format!("{} points at unallocated {} offset {}", id, loc.tier, loc.offset)),
            }
        }
        for ((tier, offset), owner) in owners {
            let owner = owner.map_or_else(|| "none".to_string(), |id| id.to_string());
            problems.push(format!("{} slot at offset {} (owner {}) has no directory entry", tier, offset, owner));
        }
        problems
    }

    /// Flush every region to its backing file.
    pub fn sync(&self) -> TrieResult<()> {
        self.objects.sync()?;
        self.hot.sync()?;
        self.cold.sync()?;
        self.big.sync()
    }
}
