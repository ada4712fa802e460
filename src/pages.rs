//! Page addresses, page descriptors and the `PageSource` contract.

use core::fmt;

use bitflags::bitflags;

use crate::chunk::{ListLink, Membership};
use crate::sc::CacheKey;

pub const PAGE_SHIFT: usize = 12;

/// Size of a chunk. Every chunk is exactly one page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// A virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> VirtAddr {
        VirtAddr(addr)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *mut T) -> VirtAddr {
        VirtAddr(ptr as usize)
    }

    #[inline]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Start of the page containing this address.
    #[inline]
    pub const fn page_base(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> VirtAddr {
        VirtAddr(self.0 + bytes)
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

bitflags! {
    /// Accounting bits of a page descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Held intact in a pool's reservation.
        const RESERVED = 1 << 0;
        /// Sliced into slots by an object cache.
        const SLAB = 1 << 1;
    }
}

/// Chunk header of a page held in a pool's reservation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReservedChunk {
    pub(crate) next: Option<VirtAddr>,
    pub(crate) base: VirtAddr,
}

/// Chunk header of a page owned by an object cache.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlabChunk {
    /// Owning cache. A back reference, never ownership.
    pub(crate) cache: CacheKey,
    pub(crate) base: VirtAddr,
    /// First free slot; each free slot stores the address of the next one.
    pub(crate) free_list: Option<VirtAddr>,
    pub(crate) inuse: usize,
    pub(crate) link: ListLink,
    pub(crate) membership: Membership,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PagePayload {
    /// On the page source's free list.
    Free { next: Option<VirtAddr> },
    /// Acquired, no chunk header installed.
    Anonymous,
    Reserved(ReservedChunk),
    Slab(SlabChunk),
}

/// There is one of these for every page frame a `PageSource` manages.
///
/// Which payload is valid is decided by the flag bits together with the
/// reference count. Asking for the wrong one halts.
#[derive(Debug, Clone, Copy)]
pub struct PageDescriptor {
    count: u32,
    flags: PageFlags,
    payload: PagePayload,
}

impl Default for PageDescriptor {
    fn default() -> PageDescriptor {
        PageDescriptor::new()
    }
}

impl PageDescriptor {
    /// A descriptor for a page that is not yet on any free list.
    pub const fn new() -> PageDescriptor {
        PageDescriptor {
            count: 0,
            flags: PageFlags::empty(),
            payload: PagePayload::Free { next: None },
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn is_free(&self) -> bool {
        self.count == 0 && matches!(self.payload, PagePayload::Free { .. })
    }

    /// Called by a page source when it hands the page out.
    pub fn mark_acquired(&mut self) {
        self.count = 1;
        self.flags = PageFlags::empty();
        self.payload = PagePayload::Anonymous;
    }

    /// Called by a page source when the page goes (back) on its free list.
    pub fn mark_free(&mut self, next: Option<VirtAddr>) {
        self.count = 0;
        self.flags = PageFlags::empty();
        self.payload = PagePayload::Free { next };
    }

    /// The page source's free-list link.
    pub fn free_link(&self) -> Option<VirtAddr> {
        match self.payload {
            PagePayload::Free { next } if self.count == 0 => next,
            _ => fatal!("page: free link read from a referenced page ({:?})", self),
        }
    }

    fn expect(&self, flags: PageFlags) {
        if self.count != 1 || self.flags != flags {
            fatal!(
                "page: expected count 1 and flags {:?}, found count {} and flags {:?}",
                flags,
                self.count,
                self.flags
            );
        }
    }

    /// Drops whatever chunk header is installed.
    pub(crate) fn clear_chunk(&mut self) {
        if self.count != 1 {
            fatal!("page: clearing chunk header of page with count {}", self.count);
        }
        self.flags = PageFlags::empty();
        self.payload = PagePayload::Anonymous;
    }

    pub(crate) fn install_reserved(&mut self, chunk: ReservedChunk) {
        self.expect(PageFlags::empty());
        self.flags = PageFlags::RESERVED;
        self.payload = PagePayload::Reserved(chunk);
    }

    pub(crate) fn install_slab(&mut self, chunk: SlabChunk) {
        self.expect(PageFlags::empty());
        self.flags = PageFlags::SLAB;
        self.payload = PagePayload::Slab(chunk);
    }

    pub(crate) fn reserved(&self) -> &ReservedChunk {
        self.expect(PageFlags::RESERVED);
        match &self.payload {
            PagePayload::Reserved(chunk) => chunk,
            other => fatal!("page: RESERVED flag over {:?}", other),
        }
    }

    pub(crate) fn slab(&self) -> &SlabChunk {
        self.expect(PageFlags::SLAB);
        match &self.payload {
            PagePayload::Slab(chunk) => chunk,
            other => fatal!("page: SLAB flag over {:?}", other),
        }
    }

    pub(crate) fn slab_mut(&mut self) -> &mut SlabChunk {
        self.expect(PageFlags::SLAB);
        match &mut self.payload {
            PagePayload::Slab(chunk) => chunk,
            other => fatal!("page: SLAB flag over {:?}", other),
        }
    }
}

/// Page granular memory supplier, typically the kernel's page-frame
/// allocator.
pub trait PageSource {
    /// Returns the start of a freshly referenced page (count 1, no flags),
    /// or `None` when no page is left.
    fn acquire_page(&mut self) -> Option<VirtAddr>;

    /// Gives back a page previously returned by `acquire_page`.
    fn release_page(&mut self, addr: VirtAddr);

    /// Descriptor of the page containing `addr`.
    fn descriptor(&self, addr: VirtAddr) -> Option<&PageDescriptor>;

    fn descriptor_mut(&mut self, addr: VirtAddr) -> Option<&mut PageDescriptor>;
}

/// Descriptor lookup for pages the allocator itself acquired. A miss means
/// the address never came from this zone.
pub(crate) fn descriptor_of<P: PageSource>(pages: &P, addr: VirtAddr) -> &PageDescriptor {
    match pages.descriptor(addr) {
        Some(desc) => desc,
        None => fatal!("page: no descriptor for {:#x}", addr),
    }
}

pub(crate) fn descriptor_of_mut<P: PageSource>(pages: &mut P, addr: VirtAddr) -> &mut PageDescriptor {
    match pages.descriptor_mut(addr) {
        Some(desc) => desc,
        None => fatal!("page: no descriptor for {:#x}", addr),
    }
}

pub(crate) fn slab_of<P: PageSource>(pages: &P, chunk: VirtAddr) -> &SlabChunk {
    descriptor_of(pages, chunk).slab()
}

pub(crate) fn slab_of_mut<P: PageSource>(pages: &mut P, chunk: VirtAddr) -> &mut SlabChunk {
    descriptor_of_mut(pages, chunk).slab_mut()
}
