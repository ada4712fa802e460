//! Pools: chunks reserved up front for the caches they back.

use core::marker::PhantomData;

use log::{debug, trace};

use crate::chunk::ListLink;
use crate::pages::{descriptor_of, descriptor_of_mut, PageSource, ReservedChunk, VirtAddr};
use crate::AllocationError;

pub(crate) const POOL_MAGIC: u32 = 0x706f_6f6c;

/// What a pool does once its reserve runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservePolicy {
    /// Chunk requests fail. Caches of the pool only ever use reserved pages.
    Strict,
    /// Chunk requests go straight to the page source.
    Borrow,
}

/// Where a cache gets its chunks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolKey {
    /// The implicit pool of the zone, backed directly by the page source.
    Global,
    Slot(VirtAddr),
}

/// Structures that sit on an intrusive registry.
pub(crate) trait Registered {
    fn registry_link(&mut self) -> &mut ListLink;
}

/// Intrusive doubly linked list of metadata structures living in
/// bootstrap cache slots.
#[derive(Debug)]
pub(crate) struct Registry<T> {
    head: Option<VirtAddr>,
    pub(crate) len: usize,
    _entries: PhantomData<T>,
}

impl<T: Registered> Registry<T> {
    pub(crate) const fn new() -> Registry<T> {
        Registry {
            head: None,
            len: 0,
            _entries: PhantomData,
        }
    }

    pub(crate) fn head(&self) -> Option<VirtAddr> {
        self.head
    }

    /// # Safety
    /// `addr` must hold an initialized `T` that is not on any registry.
    pub(crate) unsafe fn insert(&mut self, addr: VirtAddr) {
        if let Some(head) = self.head {
            (*head.as_mut_ptr::<T>()).registry_link().prev = Some(addr);
        }
        *(*addr.as_mut_ptr::<T>()).registry_link() = ListLink {
            prev: None,
            next: self.head,
        };
        self.head = Some(addr);
        self.len += 1;
    }

    /// # Safety
    /// `addr` must hold an initialized `T` that is on this registry.
    pub(crate) unsafe fn remove(&mut self, addr: VirtAddr) {
        let link = core::mem::take((*addr.as_mut_ptr::<T>()).registry_link());
        match link.prev {
            Some(prev) => (*prev.as_mut_ptr::<T>()).registry_link().next = link.next,
            None => self.head = link.next,
        }
        if let Some(next) = link.next {
            (*next.as_mut_ptr::<T>()).registry_link().prev = link.prev;
        }
        self.len -= 1;
    }
}

/// Summary of a destroyed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub label: &'static str,
    /// Caches that were still registered and got finalized.
    pub caches_finalized: usize,
    /// Reserved pages handed back to the page source.
    pub pages_released: usize,
}

/// Pool metadata. Lives in a slot of the zone's pool-metadata cache, except
/// for the implicit global pool.
#[derive(Debug)]
pub(crate) struct PoolMeta {
    pub(crate) magic: u32,
    pub(crate) label: &'static str,
    /// Reservation target.
    pub(crate) target: usize,
    pub(crate) policy: ReservePolicy,
    reserved: Option<VirtAddr>,
    pub(crate) num_reserved: usize,
    /// Caches backed by this pool.
    pub(crate) caches: Registry<crate::sc::CacheMeta>,
    link: ListLink,
}

impl Registered for PoolMeta {
    fn registry_link(&mut self) -> &mut ListLink {
        &mut self.link
    }
}

impl PoolMeta {
    pub(crate) const fn new(label: &'static str, target: usize, policy: ReservePolicy) -> PoolMeta {
        PoolMeta {
            magic: POOL_MAGIC,
            label,
            target,
            policy,
            reserved: None,
            num_reserved: 0,
            caches: Registry::new(),
            link: ListLink {
                prev: None,
                next: None,
            },
        }
    }

    pub(crate) const fn global() -> PoolMeta {
        PoolMeta::new("_global", 0, ReservePolicy::Borrow)
    }

    /// Acquires pages until the reservation target is met. On failure every
    /// page taken so far goes back to the page source.
    pub(crate) fn fill<P: PageSource>(&mut self, pages: &mut P) -> Result<(), AllocationError> {
        while self.num_reserved < self.target {
            match acquire(pages) {
                Some(chunk) => self.push_reserved(pages, chunk),
                None => {
                    debug!(
                        "mempool: {}: reserve stopped at {}/{} pages",
                        self.label, self.num_reserved, self.target
                    );
                    self.drain(pages);
                    return Err(AllocationError::OutOfMemory);
                }
            }
        }
        Ok(())
    }

    fn push_reserved<P: PageSource>(&mut self, pages: &mut P, chunk: VirtAddr) {
        descriptor_of_mut(pages, chunk).install_reserved(ReservedChunk {
            next: self.reserved,
            base: chunk,
        });
        self.reserved = Some(chunk);
        self.num_reserved += 1;
        if self.num_reserved > self.target {
            fatal!(
                "mempool: {}: {} pages reserved, target is {}",
                self.label,
                self.num_reserved,
                self.target
            );
        }
    }

    fn pop_reserved<P: PageSource>(&mut self, pages: &mut P) -> Option<VirtAddr> {
        let chunk = self.reserved?;
        let hdr = *descriptor_of(pages, chunk).reserved();
        if hdr.base != chunk {
            fatal!("mempool: {}: reserved chunk {:#x} claims base {:#x}", self.label, chunk, hdr.base);
        }
        descriptor_of_mut(pages, chunk).clear_chunk();
        self.reserved = hdr.next;
        self.num_reserved -= 1;
        Some(chunk)
    }

    /// Hands out a page with no chunk header, or `None` if neither the
    /// reserve nor (policy permitting) the page source has one.
    pub(crate) fn take_chunk<P: PageSource>(&mut self, pages: &mut P) -> Option<VirtAddr> {
        if let Some(chunk) = self.pop_reserved(pages) {
            trace!("mempool: {}: chunk {:#x} from reserve", self.label, chunk);
            return Some(chunk);
        }
        match self.policy {
            ReservePolicy::Strict => {
                debug!("mempool: {}: reserve exhausted", self.label);
                None
            }
            ReservePolicy::Borrow => acquire(pages),
        }
    }

    /// Takes back a chunk. It refills the reserve if that is below target,
    /// otherwise the page returns to the page source.
    pub(crate) fn put_chunk<P: PageSource>(&mut self, pages: &mut P, chunk: VirtAddr) {
        descriptor_of_mut(pages, chunk).clear_chunk();
        if self.num_reserved < self.target {
            trace!("mempool: {}: chunk {:#x} back to reserve", self.label, chunk);
            self.push_reserved(pages, chunk);
        } else {
            trace!("mempool: {}: chunk {:#x} back to page source", self.label, chunk);
            pages.release_page(chunk);
        }
    }

    /// Releases every reserved page to the page source.
    pub(crate) fn drain<P: PageSource>(&mut self, pages: &mut P) -> usize {
        if self.num_reserved > self.target {
            fatal!(
                "mempool: {}: {} pages reserved, target is {}",
                self.label,
                self.num_reserved,
                self.target
            );
        }
        let mut released = 0;
        while let Some(chunk) = self.pop_reserved(pages) {
            pages.release_page(chunk);
            released += 1;
        }
        if self.num_reserved != 0 {
            fatal!("mempool: {}: {} reserved pages unaccounted for", self.label, self.num_reserved);
        }
        debug!("mempool: {}: {} reserved pages released", self.label, released);
        released
    }
}

/// Takes a page straight from the page source.
fn acquire<P: PageSource>(pages: &mut P) -> Option<VirtAddr> {
    let page = pages.acquire_page()?;
    let desc = descriptor_of(pages, page);
    if desc.count() != 1 || !desc.flags().is_empty() || !page.is_page_aligned() {
        fatal!(
            "page source handed out {:#x} with count {} and flags {:?}",
            page,
            desc.count(),
            desc.flags()
        );
    }
    trace!("page {:#x} acquired", page);
    Some(page)
}
