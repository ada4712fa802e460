//! An object cache that allocates fixed size objects.

use core::mem;

use log::{info, trace};

use crate::chunk::{pop_free, push_free, relink, ChunkList, ListLink, Membership};
use crate::debug;
use crate::pages::{descriptor_of_mut, slab_of, slab_of_mut, PageSource, SlabChunk, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use crate::pool::{PoolKey, PoolMeta, Registered};
use crate::{AllocationError, Config};

pub(crate) const CACHE_MAGIC: u32 = 0x6f62_6a63;

/// Identifies the cache owning a slab chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheKey {
    /// Bootstrap cache holding `CacheMeta` slots.
    CacheMeta,
    /// Bootstrap cache holding `PoolMeta` slots.
    PoolMeta,
    /// A cache whose metadata lives in a `CacheMeta` slot.
    Slot(VirtAddr),
}

/// What a cache needs from its zone besides its own metadata.
pub(crate) struct Backing<'z, P> {
    pub(crate) pages: &'z mut P,
    pub(crate) global: &'z mut PoolMeta,
    pub(crate) config: &'z Config,
}

impl<'z, P: PageSource> Backing<'z, P> {
    fn take_chunk(&mut self, pool: PoolKey) -> Option<VirtAddr> {
        match pool {
            PoolKey::Global => self.global.take_chunk(self.pages),
            // Pool metadata outlives every cache registered with it.
            PoolKey::Slot(addr) => unsafe { (*addr.as_mut_ptr::<PoolMeta>()).take_chunk(self.pages) },
        }
    }

    fn put_chunk(&mut self, pool: PoolKey, chunk: VirtAddr) {
        match pool {
            PoolKey::Global => self.global.put_chunk(self.pages, chunk),
            PoolKey::Slot(addr) => unsafe { (*addr.as_mut_ptr::<PoolMeta>()).put_chunk(self.pages, chunk) },
        }
    }
}

/// Bump range over the current chunk's slots that were never handed out.
#[derive(Debug, Clone, Copy, Default)]
struct Bump {
    next: VirtAddr,
    end: VirtAddr,
}

/// Occupancy snapshot of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub label: &'static str,
    pub object_size: usize,
    pub objects_per_chunk: usize,
    pub partial_chunks: usize,
    pub full_chunks: usize,
    /// The current chunk exists and is on neither list.
    pub detached_current: bool,
    pub has_current: bool,
    pub objects_in_use: usize,
}

impl CacheStats {
    /// Chunks owned by the cache.
    pub fn chunks(&self) -> usize {
        self.partial_chunks + self.full_chunks + self.detached_current as usize
    }
}

/// Summary of a finalized cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheReport {
    pub label: &'static str,
    pub object_size: usize,
    /// Chunks handed back to the pool or page source.
    pub chunks_released: usize,
    /// Objects that were still allocated.
    pub objects_in_use: usize,
}

impl CacheReport {
    pub fn bytes_total(&self) -> usize {
        self.chunks_released << PAGE_SHIFT
    }

    pub fn bytes_in_use(&self) -> usize {
        self.objects_in_use * self.object_size
    }
}

/// A cache allocates objects of one size.
///
/// Every chunk it owns is in exactly one of these states:
///
///  * current: the chunk slots are carved from with the bump range. It may
///    also sit on `partial` once objects of it were freed.
///  * `partial`: the chunk has free slots on its free list.
///  * `full`: no free slots left.
///
/// On allocation the head of `partial` is tried first, then the bump range
/// and only then a fresh chunk is taken from the pool. A chunk whose last
/// object is freed goes straight back to the pool.
#[derive(Debug)]
pub(crate) struct CacheMeta {
    pub(crate) magic: u32,
    pub(crate) label: &'static str,
    /// Object size, at least one pointer wide.
    pub(crate) size: usize,
    pub(crate) obj_per_chunk: usize,
    pub(crate) pool: PoolKey,
    bump: Bump,
    current: Option<VirtAddr>,
    partial: ChunkList,
    full: ChunkList,
    link: ListLink,
}

impl Registered for CacheMeta {
    fn registry_link(&mut self) -> &mut ListLink {
        &mut self.link
    }
}

impl CacheMeta {
    /// `size` must be in `1..=PAGE_SIZE`.
    pub(crate) fn new(label: &'static str, size: usize, pool: PoolKey) -> CacheMeta {
        debug_assert!(size > 0 && size <= PAGE_SIZE);
        let size = size.max(mem::size_of::<usize>());
        CacheMeta {
            magic: CACHE_MAGIC,
            label,
            size,
            obj_per_chunk: PAGE_SIZE / size,
            pool,
            bump: Bump::default(),
            current: None,
            partial: ChunkList::new(Membership::Partial),
            full: ChunkList::new(Membership::Full),
            link: ListLink::default(),
        }
    }

    fn bump_has_room(&self) -> bool {
        self.bump.next.value() + self.size <= self.bump.end.value()
    }

    fn retire_current(&mut self) {
        self.current = None;
        self.bump = Bump::default();
    }

    /// Allocates one object.
    ///
    /// Fails only when no chunk can be had from the pool.
    pub(crate) fn allocate<P: PageSource>(
        &mut self,
        me: CacheKey,
        b: &mut Backing<'_, P>,
    ) -> Result<VirtAddr, AllocationError> {
        let slot = match self.alloc_from_partial(b.pages) {
            Some(slot) => slot,
            None => {
                if !self.bump_has_room() {
                    self.refill(me, b)?;
                }
                self.alloc_fast(b.pages)
            }
        };
        if let Some(pattern) = b.config.poison {
            unsafe { debug::poison(slot, self.size, pattern) };
        }
        Ok(slot)
    }

    fn alloc_from_partial<P: PageSource>(&mut self, pages: &mut P) -> Option<VirtAddr> {
        let chunk = self.partial.head()?;
        let hdr = slab_of_mut(pages, chunk);
        // Free list entries are free slots of this chunk.
        let slot = unsafe { pop_free(&mut hdr.free_list) }?;
        hdr.inuse += 1;
        let drained = hdr.free_list.is_none();

        if drained {
            if self.current != Some(chunk) {
                relink(pages, &mut self.partial, &mut self.full, chunk, Membership::Full);
            } else if !self.bump_has_room() {
                relink(pages, &mut self.partial, &mut self.full, chunk, Membership::Full);
                self.retire_current();
            }
        }
        Some(slot)
    }

    fn alloc_fast<P: PageSource>(&mut self, pages: &mut P) -> VirtAddr {
        let chunk = match self.current {
            Some(chunk) => chunk,
            None => fatal!("objcache: {}: bump allocation without a current chunk", self.label),
        };
        let slot = self.bump.next;
        self.bump.next = slot.add(self.size);

        let hdr = slab_of_mut(pages, chunk);
        hdr.inuse += 1;
        if hdr.inuse > self.obj_per_chunk {
            fatal!(
                "objcache: {}: chunk {:#x} has {} objects in use, capacity {}",
                self.label,
                chunk,
                hdr.inuse,
                self.obj_per_chunk
            );
        }
        if hdr.inuse == self.obj_per_chunk && hdr.free_list.is_none() {
            relink(pages, &mut self.partial, &mut self.full, chunk, Membership::Full);
            self.retire_current();
        }
        slot
    }

    fn refill<P: PageSource>(&mut self, me: CacheKey, b: &mut Backing<'_, P>) -> Result<(), AllocationError> {
        if let Some(current) = self.current {
            fatal!(
                "objcache: {}: refill while chunk {:#x} is still current",
                self.label,
                current
            );
        }
        let chunk = b.take_chunk(self.pool).ok_or(AllocationError::OutOfMemory)?;
        descriptor_of_mut(b.pages, chunk).install_slab(SlabChunk {
            cache: me,
            base: chunk,
            free_list: None,
            inuse: 0,
            link: ListLink::default(),
            membership: Membership::Detached,
        });
        self.current = Some(chunk);
        self.bump = Bump {
            next: chunk,
            end: chunk.add(self.size * self.obj_per_chunk),
        };
        trace!("objcache: {}: new current chunk {:#x}", self.label, chunk);
        Ok(())
    }

    /// Returns `slot` of `chunk` to the cache.
    ///
    /// # Safety
    /// `slot` must be an object of `chunk` that was handed out by `allocate`
    /// and not freed since.
    pub(crate) unsafe fn free<P: PageSource>(&mut self, b: &mut Backing<'_, P>, chunk: VirtAddr, slot: VirtAddr) {
        let hdr = *slab_of(b.pages, chunk);
        if b.config.check_frees {
            debug::check_free(self.label, &hdr, slot, self.size, self.carved_end(&hdr));
        }
        if hdr.inuse == 0 || hdr.inuse > self.obj_per_chunk {
            fatal!(
                "objcache: {}: free into chunk {:#x} with {} objects in use",
                self.label,
                chunk,
                hdr.inuse
            );
        }

        // First free from a chunk puts it on the partial list.
        if hdr.free_list.is_none() {
            let is_current = self.current == Some(chunk);
            if !is_current && (hdr.inuse != self.obj_per_chunk || hdr.membership != Membership::Full) {
                fatal!(
                    "objcache: {}: chunk {:#x} without free slots is {:?} with {} in use",
                    self.label,
                    chunk,
                    hdr.membership,
                    hdr.inuse
                );
            }
            relink(b.pages, &mut self.partial, &mut self.full, chunk, Membership::Partial);
        }

        if let Some(pattern) = b.config.poison {
            debug::poison(slot, self.size, pattern);
        }

        let hdr = slab_of_mut(b.pages, chunk);
        push_free(&mut hdr.free_list, slot);
        hdr.inuse -= 1;

        if hdr.inuse == 0 {
            relink(b.pages, &mut self.partial, &mut self.full, chunk, Membership::Detached);
            if self.current == Some(chunk) {
                self.retire_current();
            }
            trace!("objcache: {}: chunk {:#x} empty", self.label, chunk);
            b.put_chunk(self.pool, chunk);
        }
    }

    /// End of the slots of `hdr`'s chunk that were ever handed out.
    fn carved_end(&self, hdr: &SlabChunk) -> VirtAddr {
        if self.current == Some(hdr.base) {
            self.bump.next
        } else {
            hdr.base.add(self.size * self.obj_per_chunk)
        }
    }

    /// Gives every chunk back to the pool, live objects or not.
    pub(crate) fn finalize<P: PageSource>(&mut self, b: &mut Backing<'_, P>) -> CacheReport {
        let mut chunks = 0;
        let mut objects = 0;

        while let Some(chunk) = self.full.pop_front(b.pages) {
            let inuse = slab_of(b.pages, chunk).inuse;
            if inuse != self.obj_per_chunk {
                fatal!("objcache: {}: full chunk {:#x} has {} in use", self.label, chunk, inuse);
            }
            chunks += 1;
            objects += inuse;
            b.put_chunk(self.pool, chunk);
        }

        while let Some(chunk) = self.partial.pop_front(b.pages) {
            if self.current == Some(chunk) {
                continue;
            }
            let inuse = slab_of(b.pages, chunk).inuse;
            if inuse >= self.obj_per_chunk {
                fatal!("objcache: {}: partial chunk {:#x} has {} in use", self.label, chunk, inuse);
            }
            chunks += 1;
            objects += inuse;
            b.put_chunk(self.pool, chunk);
        }

        if let Some(chunk) = self.current {
            chunks += 1;
            objects += slab_of(b.pages, chunk).inuse;
            b.put_chunk(self.pool, chunk);
        }
        self.retire_current();
        self.magic = 0;

        let report = CacheReport {
            label: self.label,
            object_size: self.size,
            chunks_released: chunks,
            objects_in_use: objects,
        };
        info!(
            "objcache: free: {}: {}K total, {}K inuse",
            self.label,
            report.bytes_total() >> 10,
            report.bytes_in_use() >> 10
        );
        report
    }

    /// Walks every chunk of the cache. With `checked` set, the occupancy
    /// accounting of each chunk is validated and any mismatch halts.
    pub(crate) fn stats<P: PageSource>(&self, me: CacheKey, pages: &P, checked: bool) -> CacheStats {
        let mut objects = 0;
        let mut inspect = |chunk: VirtAddr, full: bool| {
            let hdr = slab_of(pages, chunk);
            objects += hdr.inuse;
            if !checked {
                return;
            }
            if hdr.cache != me || hdr.base != chunk {
                fatal!(
                    "objcache: {}: chunk {:#x} belongs to {:?} at {:#x}",
                    self.label,
                    chunk,
                    hdr.cache,
                    hdr.base
                );
            }
            let free = unsafe { debug::free_list_len(self.label, hdr, self.size, self.obj_per_chunk) };
            let carved = (self.carved_end(hdr).value() - chunk.value()) / self.size;
            let is_current = self.current == Some(chunk);
            let misfiled = if full {
                free != 0 || hdr.inuse != self.obj_per_chunk
            } else {
                free == 0 && !is_current
            };
            if hdr.inuse + free != carved || hdr.inuse > self.obj_per_chunk || misfiled {
                fatal!(
                    "objcache: {}: chunk {:#x} has {} in use and {} free of {} carved",
                    self.label,
                    chunk,
                    hdr.inuse,
                    free,
                    carved
                );
            }
        };

        let full_chunks = self.full.for_each(pages, |chunk| inspect(chunk, true));
        let partial_chunks = self.partial.for_each(pages, |chunk| inspect(chunk, false));
        let detached_current = match self.current {
            Some(chunk) if slab_of(pages, chunk).membership == Membership::Detached => {
                inspect(chunk, false);
                true
            }
            _ => false,
        };

        CacheStats {
            label: self.label,
            object_size: self.size,
            objects_per_chunk: self.obj_per_chunk,
            partial_chunks,
            full_chunks,
            detached_current,
            has_current: self.current.is_some(),
            objects_in_use: objects,
        }
    }
}
