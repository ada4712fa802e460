//! The zone ties a page source to its pools and caches.
//!
//! It holds the implicit global pool and the two bootstrap caches the
//! metadata of every other pool and cache is allocated from.

use core::mem;
use core::ptr::{self, NonNull};

use log::{debug, info};

use crate::pages::{descriptor_of, PageSource, VirtAddr, PAGE_SIZE};
use crate::pool::{PoolKey, PoolMeta, PoolReport, Registry, ReservePolicy, POOL_MAGIC};
use crate::sc::{Backing, CacheKey, CacheMeta, CacheReport, CacheStats, CACHE_MAGIC};
use crate::{AllocationError, Config};

/// Handle of an object cache created by `Zone::create_cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(VirtAddr);

/// Handle of a pool created by `Zone::create_pool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(VirtAddr);

/// Allocator state for one page source.
///
/// Nothing is taken from the page source until the first pool or cache is
/// created.
pub struct Zone<P> {
    pages: P,
    config: Config,
    /// Implicit pool without reservation, backed by `pages`.
    global: PoolMeta,
    /// Holds `CacheMeta` of every cache created through the zone.
    self_cache: CacheMeta,
    /// Holds `PoolMeta` of every pool created through the zone.
    pool_cache: CacheMeta,
    pools: Registry<PoolMeta>,
}

impl<P: PageSource> Zone<P> {
    pub fn new(pages: P) -> Zone<P> {
        Zone::with_config(pages, Config::default())
    }

    pub fn with_config(pages: P, config: Config) -> Zone<P> {
        Zone {
            pages,
            config,
            global: PoolMeta::global(),
            self_cache: CacheMeta::new("_objcache", mem::size_of::<CacheMeta>(), PoolKey::Global),
            pool_cache: CacheMeta::new("_mempool", mem::size_of::<PoolMeta>(), PoolKey::Global),
            pools: Registry::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn page_source(&self) -> &P {
        &self.pages
    }

    /// Number of pools currently registered.
    pub fn pool_count(&self) -> usize {
        self.pools.len
    }

    /// Creates a pool that pre-acquires `reserve` pages and never lets its
    /// caches use more than that.
    pub fn create_pool(&mut self, label: &'static str, reserve: usize) -> Result<PoolId, AllocationError> {
        self.create_pool_with(label, reserve, ReservePolicy::Strict)
    }

    pub fn create_pool_with(
        &mut self,
        label: &'static str,
        reserve: usize,
        policy: ReservePolicy,
    ) -> Result<PoolId, AllocationError> {
        if reserve == 0 {
            return Err(AllocationError::ZeroReservation);
        }

        let slot = self.alloc_meta(CacheKey::PoolMeta)?;
        // Fresh slot of the pool metadata cache, sized and aligned for it.
        let pool = unsafe {
            ptr::write(slot.as_mut_ptr::<PoolMeta>(), PoolMeta::new(label, reserve, policy));
            &mut *slot.as_mut_ptr::<PoolMeta>()
        };
        if let Err(e) = pool.fill(&mut self.pages) {
            pool.magic = 0;
            self.free_slot(Some(CacheKey::PoolMeta), slot);
            return Err(e);
        }

        unsafe { self.pools.insert(slot) };
        debug!("mempool: new: {} ({} chunks, {:?})", label, reserve, policy);
        Ok(PoolId(slot))
    }

    /// Finalizes every cache still backed by the pool, then releases its
    /// reserved pages.
    pub fn destroy_pool(&mut self, pool: PoolId) -> PoolReport {
        let addr = self.pool_addr(pool);
        let label = unsafe { (*addr.as_mut_ptr::<PoolMeta>()).label };
        info!("mempool: free: {}", label);

        let mut caches_finalized = 0;
        while let Some(cache) = unsafe { (*addr.as_mut_ptr::<PoolMeta>()).caches.head() } {
            self.finalize_cache(CacheId(cache));
            caches_finalized += 1;
        }

        let pages_released = {
            let pool = unsafe { &mut *addr.as_mut_ptr::<PoolMeta>() };
            let released = pool.drain(&mut self.pages);
            pool.magic = 0;
            released
        };
        unsafe { self.pools.remove(addr) };
        self.free_slot(Some(CacheKey::PoolMeta), addr);

        PoolReport {
            label,
            caches_finalized,
            pages_released,
        }
    }

    /// Creates a cache of `size` byte objects backed by `pool`, or by the
    /// global pool if none is given.
    ///
    /// Sizes below a pointer are rounded up to a pointer.
    pub fn create_cache(
        &mut self,
        pool: Option<PoolId>,
        label: &'static str,
        size: usize,
    ) -> Result<CacheId, AllocationError> {
        if size == 0 || size > PAGE_SIZE {
            return Err(AllocationError::InvalidSize(size));
        }
        let pool = match pool {
            Some(id) => PoolKey::Slot(self.pool_addr(id)),
            None => PoolKey::Global,
        };

        let slot = self.alloc_meta(CacheKey::CacheMeta)?;
        // Fresh slot of the cache metadata cache, sized and aligned for it.
        unsafe {
            ptr::write(slot.as_mut_ptr::<CacheMeta>(), CacheMeta::new(label, size, pool));
            self.pool_mut(pool).caches.insert(slot);
        }
        debug!("objcache: new: {}/{} ({} bytes)", self.pool_mut(pool).label, label, size);
        Ok(CacheId(slot))
    }

    /// Allocates one object from `cache`.
    ///
    /// The only failure is running out of chunks, in which case nothing
    /// changed.
    pub fn allocate(&mut self, cache: CacheId) -> Result<NonNull<u8>, AllocationError> {
        let key = self.cache_key(cache);
        let (meta, mut backing) = self.split(key);
        let slot = meta.allocate(key, &mut backing)?;
        NonNull::new(slot.as_mut_ptr::<u8>()).ok_or(AllocationError::OutOfMemory)
    }

    /// Like `allocate`, with the object zero filled.
    pub fn allocate_zeroed(&mut self, cache: CacheId) -> Result<NonNull<u8>, AllocationError> {
        let ptr = self.allocate(cache)?;
        let size = self.cache_meta(cache).size;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Frees an object, trusting the owner recorded in its page descriptor.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this zone and not be freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        self.free_slot(None, VirtAddr::from_ptr(ptr.as_ptr()));
    }

    /// Frees an object of `cache`. Halts if the object belongs to another
    /// cache.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this zone and not be freed since.
    pub unsafe fn free_checked(&mut self, cache: CacheId, ptr: NonNull<u8>) {
        let key = self.cache_key(cache);
        self.free_slot(Some(key), VirtAddr::from_ptr(ptr.as_ptr()));
    }

    /// Destroys `cache`, handing all its chunks back to its pool. Objects
    /// still allocated from it become invalid.
    pub fn finalize_cache(&mut self, cache: CacheId) -> CacheReport {
        let key = self.cache_key(cache);
        let report = {
            let (meta, mut backing) = self.split(key);
            meta.finalize(&mut backing)
        };
        let pool = self.cache_meta(cache).pool;
        unsafe { self.pool_mut(pool).caches.remove(cache.0) };
        self.free_slot(Some(CacheKey::CacheMeta), cache.0);
        report
    }

    pub fn cache_stats(&self, cache: CacheId) -> CacheStats {
        let key = self.cache_key(cache);
        self.cache_meta(cache).stats(key, &self.pages, false)
    }

    /// Walks all chunks of `cache` and halts on any accounting mismatch.
    pub fn verify_cache(&self, cache: CacheId) -> CacheStats {
        let key = self.cache_key(cache);
        self.cache_meta(cache).stats(key, &self.pages, true)
    }

    fn split(&mut self, key: CacheKey) -> (&mut CacheMeta, Backing<'_, P>) {
        let Zone {
            pages,
            config,
            global,
            self_cache,
            pool_cache,
            ..
        } = self;
        let meta = match key {
            CacheKey::CacheMeta => self_cache,
            CacheKey::PoolMeta => pool_cache,
            // Validated by `cache_key` or read from a slab chunk header.
            CacheKey::Slot(addr) => unsafe { &mut *addr.as_mut_ptr::<CacheMeta>() },
        };
        (meta, Backing { pages, global, config })
    }

    fn alloc_meta(&mut self, key: CacheKey) -> Result<VirtAddr, AllocationError> {
        let (meta, mut backing) = self.split(key);
        meta.allocate(key, &mut backing)
    }

    /// Frees the object at `addr`, optionally insisting it belongs to
    /// `expected`.
    fn free_slot(&mut self, expected: Option<CacheKey>, addr: VirtAddr) {
        let chunk = addr.page_base();
        let owner = descriptor_of(&self.pages, chunk).slab().cache;
        if let Some(expected) = expected {
            if owner != expected {
                fatal!(
                    "objcache: free of {:#x} through {:?}, owned by {:?}",
                    addr,
                    expected,
                    owner
                );
            }
        }
        let (meta, mut backing) = self.split(owner);
        if meta.magic != CACHE_MAGIC {
            fatal!("objcache: free of {:#x} into a finalized cache", addr);
        }
        // The chunk header says this is a slot of `meta`; the caller vouches
        // that it is live.
        unsafe { meta.free(&mut backing, chunk, addr) };
    }

    fn pool_mut(&mut self, pool: PoolKey) -> &mut PoolMeta {
        match pool {
            PoolKey::Global => &mut self.global,
            PoolKey::Slot(addr) => unsafe { &mut *addr.as_mut_ptr::<PoolMeta>() },
        }
    }

    /// Checks that `addr` is a live slot of the bootstrap cache `owner`.
    fn check_meta_slot(&self, addr: VirtAddr, owner: CacheKey, size: usize) {
        let hdr = descriptor_of(&self.pages, addr.page_base()).slab();
        if hdr.cache != owner || (addr.value() - hdr.base.value()) % size != 0 {
            fatal!("objcache: {:#x} is not a {:?} slot", addr, owner);
        }
    }

    fn cache_key(&self, cache: CacheId) -> CacheKey {
        self.check_meta_slot(cache.0, CacheKey::CacheMeta, self.self_cache.size);
        if self.cache_meta(cache).magic != CACHE_MAGIC {
            fatal!("objcache: cache {:#x} used after finalize", cache.0);
        }
        CacheKey::Slot(cache.0)
    }

    fn cache_meta(&self, cache: CacheId) -> &CacheMeta {
        unsafe { &*cache.0.as_mut_ptr::<CacheMeta>() }
    }

    fn pool_addr(&self, pool: PoolId) -> VirtAddr {
        self.check_meta_slot(pool.0, CacheKey::PoolMeta, self.pool_cache.size);
        if unsafe { (*pool.0.as_mut_ptr::<PoolMeta>()).magic } != POOL_MAGIC {
            fatal!("mempool: pool {:#x} used after destroy", pool.0);
        }
        pool.0
    }
}
