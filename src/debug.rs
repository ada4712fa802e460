//! Poisoning and free-time sanity checks.

use core::ptr;

use crate::chunk::next_free;
use crate::pages::{SlabChunk, VirtAddr};

/// Overwrites a whole slot with `pattern`.
///
/// # Safety
/// `slot` must point to `size` writable bytes owned by the allocator.
pub(crate) unsafe fn poison(slot: VirtAddr, size: usize, pattern: u8) {
    ptr::write_bytes(slot.as_mut_ptr::<u8>(), pattern, size);
}

/// Halts unless `slot` is a slot boundary of `hdr`'s chunk that was carved
/// out before `carved_end` and is not on the chunk's free list.
///
/// # Safety
/// The free list of `hdr` must be intact.
pub(crate) unsafe fn check_free(label: &str, hdr: &SlabChunk, slot: VirtAddr, size: usize, carved_end: VirtAddr) {
    let offset = slot.value() - hdr.base.value();
    if offset % size != 0 {
        fatal!("objcache: {}: free of {:#x}, not a slot boundary", label, slot);
    }
    if slot >= carved_end {
        fatal!("objcache: {}: free of {:#x}, never allocated", label, slot);
    }
    let mut cursor = hdr.free_list;
    while let Some(free) = cursor {
        if free == slot {
            fatal!("objcache: {}: double free of {:#x}", label, slot);
        }
        cursor = next_free(free);
    }
}

/// Length of `hdr`'s free list. Halts on entries outside the chunk, and on
/// a list longer than the chunk can hold.
///
/// # Safety
/// `hdr` must describe a live slab chunk.
pub(crate) unsafe fn free_list_len(label: &str, hdr: &SlabChunk, size: usize, obj_per_chunk: usize) -> usize {
    let end = hdr.base.add(size * obj_per_chunk);
    let mut len = 0;
    let mut cursor = hdr.free_list;
    while let Some(free) = cursor {
        if free < hdr.base || free >= end || (free.value() - hdr.base.value()) % size != 0 {
            fatal!("objcache: {}: free list of {:#x} points at {:#x}", label, hdr.base, free);
        }
        len += 1;
        if len > obj_per_chunk {
            fatal!("objcache: {}: free list of {:#x} loops", label, hdr.base);
        }
        cursor = next_free(free);
    }
    len
}
