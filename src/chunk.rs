//! Chunk lists and slot free lists.
//!
//! A cache's partial and full lists are doubly linked through the chunk
//! headers stored in the page descriptors, so moving a chunk between lists
//! is O(1) and needs nothing but the chunk's address.

use core::ptr;

use log::trace;

use crate::pages::{slab_of, slab_of_mut, PageSource, VirtAddr};

/// Which of its cache's lists a slab chunk is linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    /// On no list. Only the current chunk may be in this state.
    Detached,
    Partial,
    Full,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ListLink {
    pub(crate) prev: Option<VirtAddr>,
    pub(crate) next: Option<VirtAddr>,
}

/// Head of an intrusive list of slab chunks.
#[derive(Debug)]
pub(crate) struct ChunkList {
    kind: Membership,
    head: Option<VirtAddr>,
    tail: Option<VirtAddr>,
    len: usize,
}

impl ChunkList {
    pub(crate) const fn new(kind: Membership) -> ChunkList {
        ChunkList {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn head(&self) -> Option<VirtAddr> {
        self.head
    }

    pub(crate) fn push_front<P: PageSource>(&mut self, pages: &mut P, chunk: VirtAddr) {
        let old_head = self.head;
        {
            let hdr = slab_of_mut(pages, chunk);
            if hdr.membership != Membership::Detached {
                fatal!(
                    "chunk {:#x}: pushed on {:?} list while still on {:?}",
                    chunk,
                    self.kind,
                    hdr.membership
                );
            }
            hdr.membership = self.kind;
            hdr.link = ListLink {
                prev: None,
                next: old_head,
            };
        }
        match old_head {
            Some(next) => slab_of_mut(pages, next).link.prev = Some(chunk),
            None => self.tail = Some(chunk),
        }
        self.head = Some(chunk);
        self.len += 1;
    }

    pub(crate) fn remove<P: PageSource>(&mut self, pages: &mut P, chunk: VirtAddr) {
        let link = {
            let hdr = slab_of_mut(pages, chunk);
            if hdr.membership != self.kind {
                fatal!(
                    "chunk {:#x}: removed from {:?} list but tagged {:?}",
                    chunk,
                    self.kind,
                    hdr.membership
                );
            }
            hdr.membership = Membership::Detached;
            core::mem::take(&mut hdr.link)
        };
        match link.prev {
            Some(prev) => slab_of_mut(pages, prev).link.next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => slab_of_mut(pages, next).link.prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len -= 1;
    }

    pub(crate) fn pop_front<P: PageSource>(&mut self, pages: &mut P) -> Option<VirtAddr> {
        let chunk = self.head?;
        self.remove(pages, chunk);
        Some(chunk)
    }

    /// Walks the list front to back, returning how many chunks were visited.
    pub(crate) fn for_each<P, F>(&self, pages: &P, mut f: F) -> usize
    where
        P: PageSource,
        F: FnMut(VirtAddr),
    {
        let mut visited = 0;
        let mut cursor = self.head;
        let mut prev = None;
        while let Some(chunk) = cursor {
            let hdr = slab_of(pages, chunk);
            if hdr.membership != self.kind || hdr.link.prev != prev {
                fatal!("chunk {:#x}: {:?} list is corrupt", chunk, self.kind);
            }
            f(chunk);
            visited += 1;
            prev = cursor;
            cursor = hdr.link.next;
        }
        if prev != self.tail || visited != self.len {
            fatal!(
                "{:?} list: tail or length mismatch ({} visited, {} recorded)",
                self.kind,
                visited,
                self.len
            );
        }
        visited
    }
}

/// Moves `chunk` from whatever list it is on to the front of `to`.
pub(crate) fn relink<P: PageSource>(
    pages: &mut P,
    partial: &mut ChunkList,
    full: &mut ChunkList,
    chunk: VirtAddr,
    to: Membership,
) {
    let from = slab_of(pages, chunk).membership;
    trace!("chunk {:#x}: {:?} -> {:?}", chunk, from, to);
    match from {
        Membership::Partial => partial.remove(pages, chunk),
        Membership::Full => full.remove(pages, chunk),
        Membership::Detached => {}
    }
    match to {
        Membership::Partial => partial.push_front(pages, chunk),
        Membership::Full => full.push_front(pages, chunk),
        Membership::Detached => {}
    }
}

/// Reads the free-list link stored in the first word of a free slot.
///
/// # Safety
/// `slot` must be a free slot of a live slab chunk.
pub(crate) unsafe fn next_free(slot: VirtAddr) -> Option<VirtAddr> {
    match ptr::read_unaligned(slot.as_mut_ptr::<usize>()) {
        0 => None,
        next => Some(VirtAddr::new(next)),
    }
}

/// Makes `slot` the new head of a free list.
///
/// # Safety
/// `slot` must be an unused slot of a live slab chunk, at least one pointer
/// wide.
pub(crate) unsafe fn push_free(head: &mut Option<VirtAddr>, slot: VirtAddr) {
    let next = head.map_or(0, VirtAddr::value);
    ptr::write_unaligned(slot.as_mut_ptr::<usize>(), next);
    *head = Some(slot);
}

/// Takes the head off a free list.
///
/// # Safety
/// Every entry of the list must be a free slot of a live slab chunk.
pub(crate) unsafe fn pop_free(head: &mut Option<VirtAddr>) -> Option<VirtAddr> {
    let slot = (*head)?;
    *head = next_free(slot);
    Some(slot)
}
