//! A page source over one contiguous region of page frames.

use log::trace;

use crate::pages::{PageDescriptor, PageSource, VirtAddr, PAGE_SHIFT, PAGE_SIZE};

/// Page traffic counters of a `FrameArena`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub acquired: usize,
    pub released: usize,
    /// Acquisitions that found no free page.
    pub failed: usize,
}

/// Hands out the pages of `[base, base + descriptors.len() * PAGE_SIZE)`.
///
/// Free pages are kept on a LIFO list threaded through the free-link
/// payload of their descriptors.
pub struct FrameArena<'a> {
    base: VirtAddr,
    descriptors: &'a mut [PageDescriptor],
    free_head: Option<VirtAddr>,
    free_pages: usize,
    stats: FrameStats,
}

impl<'a> FrameArena<'a> {
    /// Creates an arena with every page free.
    ///
    /// # Safety
    /// `base` must be page aligned and the region it starts must be valid,
    /// writable and not used by anything else for `'a`. There must be one
    /// descriptor per page of the region.
    pub unsafe fn new(base: VirtAddr, descriptors: &'a mut [PageDescriptor]) -> FrameArena<'a> {
        assert!(base.is_page_aligned(), "frame arena base {:#x} is not page aligned", base);
        let mut free_head = None;
        for (idx, desc) in descriptors.iter_mut().enumerate().rev() {
            desc.mark_free(free_head);
            free_head = Some(base.add(idx << PAGE_SHIFT));
        }
        let free_pages = descriptors.len();
        FrameArena {
            base,
            descriptors,
            free_head,
            free_pages,
            stats: FrameStats::default(),
        }
    }

    pub fn total_pages(&self) -> usize {
        self.descriptors.len()
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.index_of(addr).is_some()
    }

    fn index_of(&self, addr: VirtAddr) -> Option<usize> {
        let offset = addr.value().checked_sub(self.base.value())?;
        let idx = offset / PAGE_SIZE;
        if idx < self.descriptors.len() {
            Some(idx)
        } else {
            None
        }
    }
}

impl<'a> PageSource for FrameArena<'a> {
    fn acquire_page(&mut self) -> Option<VirtAddr> {
        let page = match self.free_head {
            Some(page) => page,
            None => {
                self.stats.failed += 1;
                trace!("frames: out of pages");
                return None;
            }
        };
        let idx = self.index_of(page)?;
        let desc = &mut self.descriptors[idx];
        self.free_head = desc.free_link();
        desc.mark_acquired();
        self.free_pages -= 1;
        self.stats.acquired += 1;
        Some(page)
    }

    fn release_page(&mut self, addr: VirtAddr) {
        let idx = match self.index_of(addr) {
            Some(idx) if addr.is_page_aligned() => idx,
            _ => fatal!("frames: release of foreign address {:#x}", addr),
        };
        let desc = &mut self.descriptors[idx];
        if desc.count() != 1 || !desc.flags().is_empty() {
            fatal!(
                "frames: release of {:#x} with count {} and flags {:?}",
                addr,
                desc.count(),
                desc.flags()
            );
        }
        desc.mark_free(self.free_head);
        self.free_head = Some(addr);
        self.free_pages += 1;
        self.stats.released += 1;
    }

    fn descriptor(&self, addr: VirtAddr) -> Option<&PageDescriptor> {
        let idx = self.index_of(addr)?;
        Some(&self.descriptors[idx])
    }

    fn descriptor_mut(&mut self, addr: VirtAddr) -> Option<&mut PageDescriptor> {
        let idx = self.index_of(addr)?;
        Some(&mut self.descriptors[idx])
    }
}
