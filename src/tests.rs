use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::vec::Vec;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::*;

/// Page aligned test memory plus one descriptor per page.
pub(crate) struct Region {
    base: VirtAddr,
    layout: Layout,
    descriptors: Vec<PageDescriptor>,
}

impl Region {
    pub(crate) fn new(pages: usize) -> Region {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null(), "test region allocation failed");
        Region {
            base: VirtAddr::from_ptr(ptr),
            layout,
            descriptors: vec![PageDescriptor::new(); pages],
        }
    }

    pub(crate) fn base(&self) -> VirtAddr {
        self.base
    }

    pub(crate) fn arena(&mut self) -> FrameArena<'_> {
        unsafe { FrameArena::new(self.base, &mut self.descriptors) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_mut_ptr(), self.layout) };
    }
}

fn setup_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn checked() -> Config {
    Config {
        poison: Some(POISON_PATTERN),
        check_frees: true,
    }
}

fn acquired(zone: &Zone<FrameArena<'_>>) -> usize {
    zone.page_source().stats().acquired
}

fn released(zone: &Zone<FrameArena<'_>>) -> usize {
    zone.page_source().stats().released
}

fn page_of(ptr: NonNull<u8>) -> VirtAddr {
    VirtAddr::from_ptr(ptr.as_ptr()).page_base()
}

#[test]
fn sixty_four_byte_objects_fill_a_page() {
    setup_logger();
    let mut region = Region::new(8);
    let mut zone = Zone::with_config(region.arena(), checked());

    let cache = zone.create_cache(None, "obj64", 64).unwrap();
    assert_eq!(zone.cache_stats(cache).objects_per_chunk, 64);
    // The cache metadata took the first page.
    assert_eq!(acquired(&zone), 1);

    let first: Vec<_> = (0..64).map(|_| zone.allocate(cache).unwrap()).collect();
    assert_eq!(acquired(&zone), 2);
    let chunk = page_of(first[0]);
    assert!(first.iter().all(|ptr| page_of(*ptr) == chunk));

    let stats = zone.verify_cache(cache);
    assert_eq!(stats.full_chunks, 1);
    assert!(!stats.has_current);

    let extra = zone.allocate(cache).unwrap();
    assert_eq!(acquired(&zone), 3);
    assert_ne!(page_of(extra), chunk);

    let mut order = first.clone();
    order.shuffle(&mut StdRng::seed_from_u64(64));
    let (last, rest) = order.split_last().unwrap();
    for ptr in rest {
        unsafe { zone.free(*ptr) };
        zone.verify_cache(cache);
        assert_eq!(released(&zone), 0);
    }
    unsafe { zone.free(*last) };
    assert_eq!(released(&zone), 1);

    let stats = zone.verify_cache(cache);
    assert_eq!(stats.chunks(), 1);
    assert_eq!(stats.objects_in_use, 1);
}

#[test]
fn small_objects_are_rounded_up_to_a_pointer() {
    let mut region = Region::new(2);
    let mut zone = Zone::new(region.arena());
    let cache = zone.create_cache(None, "tiny", 1).unwrap();
    let stats = zone.cache_stats(cache);
    assert_eq!(stats.object_size, core::mem::size_of::<usize>());
    assert_eq!(stats.objects_per_chunk, PAGE_SIZE / core::mem::size_of::<usize>());

    let a = zone.allocate(cache).unwrap();
    let b = zone.allocate(cache).unwrap();
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, core::mem::size_of::<usize>());
}

#[test]
fn bad_sizes_are_rejected_without_page_traffic() {
    let mut region = Region::new(2);
    let mut zone = Zone::new(region.arena());

    assert_eq!(zone.create_cache(None, "zero", 0), Err(AllocationError::InvalidSize(0)));
    assert_eq!(
        zone.create_cache(None, "huge", PAGE_SIZE + 1),
        Err(AllocationError::InvalidSize(PAGE_SIZE + 1))
    );
    assert_eq!(zone.page_source().stats(), FrameStats::default());

    let cache = zone.create_cache(None, "page", PAGE_SIZE).unwrap();
    assert_eq!(zone.cache_stats(cache).objects_per_chunk, 1);
}

#[test]
fn freed_slot_is_reused_first() {
    let mut region = Region::new(4);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "reuse", 48).unwrap();

    let objs: Vec<_> = (0..10).map(|_| zone.allocate(cache).unwrap()).collect();
    unsafe { zone.free(objs[5]) };
    assert_eq!(zone.allocate(cache).unwrap(), objs[5]);
    zone.verify_cache(cache);
}

#[test]
fn live_objects_never_overlap() {
    let mut region = Region::new(8);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "odd", 24).unwrap();

    let objs: Vec<_> = (0..400).map(|_| zone.allocate(cache).unwrap()).collect();
    for (i, ptr) in objs.iter().enumerate() {
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), i as u8, 24) };
    }
    for (i, ptr) in objs.iter().enumerate() {
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 24) };
        assert!(bytes.iter().all(|b| *b == i as u8));
    }

    let mut addrs: Vec<usize> = objs.iter().map(|ptr| ptr.as_ptr() as usize).collect();
    addrs.sort_unstable();
    assert!(addrs.windows(2).all(|w| w[1] - w[0] >= 24));
}

#[test]
fn empty_chunk_goes_back_to_page_source() {
    let mut region = Region::new(4);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "half", PAGE_SIZE / 2).unwrap();

    let a = zone.allocate(cache).unwrap();
    assert_eq!(acquired(&zone), 2);
    unsafe { zone.free(a) };
    assert_eq!(released(&zone), 1);
    assert_eq!(zone.cache_stats(cache).chunks(), 0);

    zone.allocate(cache).unwrap();
    assert_eq!(acquired(&zone), 3);
}

#[test]
fn current_chunk_keeps_its_free_list() {
    let mut region = Region::new(4);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "quarter", PAGE_SIZE / 4).unwrap();

    let a = zone.allocate(cache).unwrap();
    let b = zone.allocate(cache).unwrap();
    let _c = zone.allocate(cache).unwrap();
    unsafe { zone.free(b) };
    let stats = zone.verify_cache(cache);
    assert!(stats.has_current);
    assert_eq!(stats.partial_chunks, 1);

    assert_eq!(zone.allocate(cache).unwrap(), b);
    // The last bump slot fills the chunk.
    zone.allocate(cache).unwrap();
    let stats = zone.verify_cache(cache);
    assert!(!stats.has_current);
    assert_eq!(stats.full_chunks, 1);
    assert_eq!(stats.objects_in_use, 4);

    unsafe { zone.free(a) };
    let stats = zone.verify_cache(cache);
    assert_eq!((stats.partial_chunks, stats.full_chunks), (1, 0));
}

#[test]
fn exhausted_page_source_fails_allocation() {
    let mut region = Region::new(2);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "page", PAGE_SIZE).unwrap();

    let a = zone.allocate(cache).unwrap();
    assert_eq!(zone.allocate(cache), Err(AllocationError::OutOfMemory));
    zone.verify_cache(cache);

    unsafe { zone.free(a) };
    assert!(zone.allocate(cache).is_ok());
}

#[test]
fn pool_returns_every_reserved_page() {
    setup_logger();
    let mut region = Region::new(16);
    let mut zone = Zone::new(region.arena());

    let pool = zone.create_pool("p", 5).unwrap();
    // One page for the pool metadata, five reserved.
    assert_eq!(acquired(&zone), 6);
    assert_eq!(zone.pool_count(), 1);

    let report = zone.destroy_pool(pool);
    assert_eq!(report.pages_released, 5);
    assert_eq!(report.caches_finalized, 0);
    assert_eq!(released(&zone), 6);
    assert_eq!(zone.page_source().free_pages(), 16);
    assert_eq!(zone.pool_count(), 0);
}

#[test]
fn zero_reservation_is_rejected() {
    let mut region = Region::new(2);
    let mut zone = Zone::new(region.arena());
    assert_eq!(zone.create_pool("empty", 0), Err(AllocationError::ZeroReservation));
    assert_eq!(acquired(&zone), 0);
}

#[test]
fn short_page_source_leaves_no_pool_behind() {
    let mut region = Region::new(4);
    let mut zone = Zone::new(region.arena());
    assert_eq!(zone.create_pool("big", 10), Err(AllocationError::OutOfMemory));
    assert_eq!(zone.pool_count(), 0);
    assert_eq!(zone.page_source().free_pages(), 4);
}

#[test]
fn strict_pool_only_uses_its_reserve() {
    let mut region = Region::new(16);
    let mut zone = Zone::with_config(region.arena(), checked());

    let pool = zone.create_pool("p", 4).unwrap();
    let cache = zone.create_cache(Some(pool), "pages", PAGE_SIZE).unwrap();
    let before = acquired(&zone);

    let objs: Vec<_> = (0..4).map(|_| zone.allocate(cache).unwrap()).collect();
    assert_eq!(zone.allocate(cache), Err(AllocationError::OutOfMemory));
    assert_eq!(acquired(&zone), before);

    unsafe { zone.free(objs[2]) };
    assert_eq!(released(&zone), 0);
    assert_eq!(zone.allocate(cache).unwrap(), objs[2]);

    let report = zone.destroy_pool(pool);
    assert_eq!(report.caches_finalized, 1);
    assert_eq!(report.pages_released, 4);
    assert_eq!(zone.page_source().free_pages(), 16);
}

#[test]
fn borrowing_pool_falls_back_and_refills() {
    let mut region = Region::new(16);
    let mut zone = Zone::with_config(region.arena(), checked());

    let pool = zone.create_pool_with("borrow", 2, ReservePolicy::Borrow).unwrap();
    let cache = zone.create_cache(Some(pool), "pages", PAGE_SIZE).unwrap();
    let before = acquired(&zone);

    let objs: Vec<_> = (0..3).map(|_| zone.allocate(cache).unwrap()).collect();
    assert_eq!(acquired(&zone), before + 1);

    for ptr in &objs {
        unsafe { zone.free(*ptr) };
    }
    // Two chunks refill the reserve, the third goes back.
    assert_eq!(released(&zone), 1);

    let report = zone.destroy_pool(pool);
    assert_eq!(report.pages_released, 2);
    assert_eq!(zone.page_source().free_pages(), 16);
}

#[test]
fn destroying_a_pool_finalizes_its_caches() {
    let mut region = Region::new(16);
    let mut zone = Zone::with_config(region.arena(), checked());

    let pool = zone.create_pool("p", 3).unwrap();
    let small = zone.create_cache(Some(pool), "small", 32).unwrap();
    let big = zone.create_cache(Some(pool), "big", 3000).unwrap();
    let global = zone.create_cache(None, "global", 32).unwrap();
    for _ in 0..200 {
        zone.allocate(small).unwrap();
    }
    zone.allocate(big).unwrap();
    let g = zone.allocate(global).unwrap();

    let report = zone.destroy_pool(pool);
    assert_eq!(report.caches_finalized, 2);
    assert_eq!(report.pages_released, 3);

    // Caches on the global pool are untouched.
    assert_eq!(zone.verify_cache(global).objects_in_use, 1);
    unsafe { zone.free_checked(global, g) };
    zone.finalize_cache(global);
    assert_eq!(zone.page_source().free_pages(), 16);
}

#[test]
fn finalize_reports_live_objects() {
    let mut region = Region::new(8);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "obj128", 128).unwrap();

    let objs: Vec<_> = (0..40).map(|_| zone.allocate(cache).unwrap()).collect();
    unsafe { zone.free(objs[0]) };

    let report = zone.finalize_cache(cache);
    assert_eq!(report.chunks_released, 2);
    assert_eq!(report.objects_in_use, 39);
    assert_eq!(report.bytes_total(), 2 * PAGE_SIZE);
    assert_eq!(report.bytes_in_use(), 39 * 128);
    assert_eq!(zone.page_source().free_pages(), 8);
}

#[test]
fn metadata_caches_span_several_pages() {
    let mut region = Region::new(64);
    let mut zone = Zone::new(region.arena());

    let caches: Vec<_> = (0..200)
        .map(|_| zone.create_cache(None, "many", 16).unwrap())
        .collect();
    // Metadata of 200 caches does not fit one page.
    assert!(acquired(&zone) > 1);
    assert_eq!(released(&zone), 0);

    for cache in caches {
        zone.finalize_cache(cache);
    }
    assert_eq!(released(&zone), acquired(&zone));
    assert_eq!(zone.page_source().free_pages(), 64);
}

#[test]
fn metadata_allocation_failure_changes_nothing() {
    setup_logger();
    let mut descriptors: [PageDescriptor; 0] = [];
    // No pages, so the base is never dereferenced.
    let arena = unsafe { FrameArena::new(VirtAddr::new(PAGE_SIZE), &mut descriptors) };
    let mut zone = Zone::new(arena);

    assert_eq!(
        zone.create_cache(None, "nometa", 32),
        Err(AllocationError::OutOfMemory)
    );
    assert_eq!(
        zone.create_pool("nometa", 1),
        Err(AllocationError::OutOfMemory)
    );
    assert_eq!(zone.pool_count(), 0);
    assert_eq!(
        zone.page_source().stats(),
        FrameStats {
            acquired: 0,
            released: 0,
            failed: 2,
        }
    );
}

#[test]
fn zeroed_allocation_clears_poison() {
    let mut region = Region::new(4);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "zero", 100).unwrap();

    let a = zone.allocate(cache).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(a.as_ptr(), 100) };
    assert!(bytes.iter().all(|b| *b == POISON_PATTERN));
    unsafe { zone.free(a) };

    let _keep = zone.allocate(cache).unwrap();
    let z = zone.allocate_zeroed(cache).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 100) };
    assert!(bytes.iter().all(|b| *b == 0));
}

#[test]
fn random_sequences_keep_accounting() {
    setup_logger();
    let mut rng = StdRng::seed_from_u64(0x0b1ec7);
    let mut region = Region::new(512);
    let mut zone = Zone::with_config(region.arena(), checked());

    for &size in &[8, 40, 256, 1000, 2049] {
        let cache = zone.create_cache(None, "random", size).unwrap();
        let mut live = Vec::new();
        for _ in 0..1500 {
            if live.is_empty() || rng.gen_range(0, 100) < 50 {
                live.push(zone.allocate(cache).unwrap());
            } else {
                let idx = rng.gen_range(0, live.len());
                let ptr = live.swap_remove(idx);
                unsafe { zone.free_checked(cache, ptr) };
            }
            assert_eq!(zone.verify_cache(cache).objects_in_use, live.len());
        }

        live.shuffle(&mut rng);
        for ptr in live.drain(..) {
            unsafe { zone.free(ptr) };
        }
        let stats = zone.verify_cache(cache);
        assert_eq!(stats.chunks(), 0);
        assert_eq!(stats.objects_in_use, 0);
        zone.finalize_cache(cache);
    }
    assert_eq!(released(&zone), acquired(&zone));
    assert_eq!(zone.page_source().free_pages(), 512);
}

#[test]
#[should_panic]
fn free_checked_against_wrong_cache_halts() {
    let mut region = Region::new(4);
    let mut zone = Zone::new(region.arena());
    let a = zone.create_cache(None, "a", 64).unwrap();
    let b = zone.create_cache(None, "b", 64).unwrap();
    let obj = zone.allocate(a).unwrap();
    unsafe { zone.free_checked(b, obj) };
}

#[test]
#[should_panic]
fn double_free_halts() {
    let mut region = Region::new(4);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "twice", 64).unwrap();
    let obj = zone.allocate(cache).unwrap();
    let _other = zone.allocate(cache).unwrap();
    unsafe {
        zone.free(obj);
        zone.free(obj);
    }
}

#[test]
#[should_panic]
fn free_of_unallocated_slot_halts() {
    let mut region = Region::new(4);
    let mut zone = Zone::with_config(region.arena(), checked());
    let cache = zone.create_cache(None, "bump", 64).unwrap();
    let obj = zone.allocate(cache).unwrap();
    let beyond = NonNull::new(unsafe { obj.as_ptr().add(64 * 3) }).unwrap();
    unsafe { zone.free(beyond) };
}

#[test]
#[should_panic]
fn cache_used_after_finalize_halts() {
    let mut region = Region::new(4);
    let mut zone = Zone::new(region.arena());
    let keep = zone.create_cache(None, "keep", 64).unwrap();
    let gone = zone.create_cache(None, "gone", 64).unwrap();
    zone.finalize_cache(gone);
    let _ = keep;
    let _ = zone.allocate(gone);
}

#[test]
fn locked_zone_initializes_once() {
    let mut first = Region::new(4);
    let mut second = Region::new(4);
    let zone: LockedZone<FrameArena<'_>> = LockedZone::new();
    assert!(!zone.is_initialized());
    assert!(zone.try_lock().is_none());

    assert!(zone.init(first.arena()).is_ok());
    let rejected = zone.init(second.arena()).err().unwrap();
    assert_eq!(rejected.free_pages(), 4);
    assert!(zone.is_initialized());

    let cache = zone.lock().create_cache(None, "locked", 256).unwrap();
    let obj = zone.lock().allocate(cache).unwrap();
    unsafe { zone.lock().free_checked(cache, obj) };
    zone.lock().finalize_cache(cache);
    assert_eq!(zone.lock().page_source().free_pages(), 4);
}
