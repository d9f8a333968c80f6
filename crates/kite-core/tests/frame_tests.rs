use kite_core::mem::frame::{FrameAllocator, FRAME_SIZE};

const BASE: u32 = 0x0010_0000;

fn allocator(frames: usize) -> FrameAllocator {
    let mut alloc = FrameAllocator::new(BASE, frames);
    alloc.mark_region_free(BASE as u64, frames as u64 * FRAME_SIZE as u64);
    alloc
}

#[test]
fn starts_with_every_frame_used() {
    let mut alloc = FrameAllocator::new(BASE, 64);
    let stats = alloc.stats();
    assert_eq!(stats.total, 64);
    assert_eq!(stats.used, 64);
    assert_eq!(alloc.alloc(), None);
}

#[test]
fn allocation_is_first_fit_from_the_bottom() {
    let mut alloc = allocator(64);
    assert_eq!(alloc.alloc(), Some(BASE));
    assert_eq!(alloc.alloc(), Some(BASE + FRAME_SIZE));
    alloc.free(BASE);
    assert_eq!(alloc.alloc(), Some(BASE));
    assert_eq!(alloc.alloc(), Some(BASE + 2 * FRAME_SIZE));
}

#[test]
fn used_count_tracks_allocs_minus_frees() {
    let mut alloc = allocator(128);
    let mut held = Vec::new();
    for _ in 0..40 {
        held.push(alloc.alloc().unwrap());
    }
    for frame in held.iter().step_by(3) {
        alloc.free(*frame);
    }
    let freed = held.iter().step_by(3).count();
    assert_eq!(alloc.stats().used, 40 - freed);

    alloc.free(held[0]);
    assert_eq!(alloc.stats().used, 40 - freed, "double free must not decrement");
}

#[test]
fn bad_frees_are_ignored() {
    let mut alloc = allocator(16);
    let frame = alloc.alloc().unwrap();
    alloc.free(frame + 12);
    alloc.free(BASE - FRAME_SIZE);
    alloc.free(BASE + 64 * FRAME_SIZE);
    assert_eq!(alloc.stats().used, 1);
    assert!(alloc.is_used(frame));
}

#[test]
fn region_free_rounds_inward() {
    let mut alloc = FrameAllocator::new(BASE, 16);
    alloc.mark_region_free(BASE as u64 + 100, 3 * FRAME_SIZE as u64);
    // Only frames 1 and 2 lie wholly inside the range.
    assert_eq!(alloc.stats().free, 2);
    assert!(alloc.is_used(BASE));
    assert!(!alloc.is_used(BASE + FRAME_SIZE));
    assert!(!alloc.is_used(BASE + 2 * FRAME_SIZE));
    assert!(alloc.is_used(BASE + 3 * FRAME_SIZE));
}

#[test]
fn region_used_rounds_outward() {
    let mut alloc = allocator(16);
    alloc.mark_region_used(BASE as u64 + FRAME_SIZE as u64 + 10, 20);
    assert!(alloc.is_used(BASE + FRAME_SIZE));
    assert!(!alloc.is_used(BASE + 2 * FRAME_SIZE));
    alloc.mark_region_used(BASE as u64 + 2 * FRAME_SIZE as u64 - 1, 2);
    assert!(alloc.is_used(BASE + 2 * FRAME_SIZE));
    assert_eq!(alloc.stats().used, 2);
}

#[test]
fn exhaustion_returns_none() {
    let mut alloc = allocator(33);
    for _ in 0..33 {
        assert!(alloc.alloc().is_some());
    }
    assert_eq!(alloc.alloc(), None);
    assert_eq!(alloc.stats().free, 0);
}

#[test]
fn regions_outside_the_tracked_range_are_clipped() {
    let mut alloc = FrameAllocator::new(BASE, 8);
    alloc.mark_region_free(0, u32::MAX as u64 + 1);
    assert_eq!(alloc.stats().free, 8);
    assert_eq!(alloc.end(), BASE as u64 + 8 * FRAME_SIZE as u64);
}
