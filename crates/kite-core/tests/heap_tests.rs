mod common;

use common::PageBacking;
use kite_core::mem::heap::{header_size, HeapError, KernelHeap, INITIAL_PAGES, MIN_ALIGN};
use kite_core::mem::PAGE_SIZE;

fn heap() -> KernelHeap<PageBacking> {
    let mut heap = KernelHeap::new(PageBacking::new());
    heap.init(INITIAL_PAGES).expect("init");
    heap
}

#[test]
fn small_allocations_are_aligned() {
    let mut heap = heap();
    for size in [1usize, 3, 7, 8, 13, 100, 1000] {
        let ptr = heap.alloc(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % MIN_ALIGN, 0, "size {size}");
    }
    assert_eq!(heap.stats().live_blocks, 7);
}

#[test]
fn growth_happens_when_the_arena_is_exhausted() {
    let mut heap = heap();
    heap.set_growth(false);

    let mut blocks = Vec::new();
    loop {
        match heap.alloc(1024) {
            Ok(ptr) => blocks.push(ptr),
            Err(HeapError::OutOfMemory) => break,
            Err(err) => panic!("unexpected {err:?}"),
        }
    }
    assert!(!blocks.is_empty());
    assert_eq!(heap.stats().grow_count, 0);

    heap.set_growth(true);
    blocks.push(heap.alloc(1024).expect("grown allocation"));
    assert_eq!(heap.stats().grow_count, 1);
    assert_eq!(heap.stats().arena_pages, INITIAL_PAGES + 1);

    // Use up the grown page so no free block can hold 2000 bytes, then two
    // neighbouring holes must merge to serve it.
    heap.set_growth(false);
    while let Ok(ptr) = heap.alloc(1024) {
        blocks.push(ptr);
    }
    heap.free(blocks[1]).unwrap();
    heap.free(blocks[2]).unwrap();
    let merged = heap.alloc(2000).expect("coalesced allocation");
    assert_eq!(merged, blocks[1]);
    assert_eq!(heap.stats().grow_count, 1);

    heap.free(merged).unwrap();
    for (index, ptr) in blocks.iter().enumerate() {
        if index != 1 && index != 2 {
            heap.free(*ptr).unwrap();
        }
    }
    assert_eq!(heap.stats().live_blocks, 0);
    heap.check().unwrap();
}

#[test]
fn adjacent_free_blocks_coalesce() {
    let mut heap = heap();
    heap.set_growth(false);

    let mut blocks = Vec::new();
    while let Ok(ptr) = heap.alloc(1024) {
        blocks.push(ptr);
    }
    assert!(blocks.len() >= 4);

    // Neither 1 KiB hole alone can hold this request; the merged pair can.
    let request = 2000;
    assert!(request + header_size() < PAGE_SIZE / 2);
    assert!(request > 1024 + header_size());
    assert_eq!(heap.alloc(request), Err(HeapError::OutOfMemory));

    heap.free(blocks[1]).unwrap();
    heap.free(blocks[2]).unwrap();
    let merged = heap.alloc(request).expect("coalesced allocation");
    assert_eq!(merged, blocks[1]);
}

#[test]
fn freeing_everything_restores_a_single_block() {
    let mut heap = heap();
    let free_before = heap.stats().free_bytes;
    let ptrs: Vec<_> = (0..20).map(|i| heap.alloc(16 + i * 24).unwrap()).collect();
    for ptr in ptrs.into_iter().rev() {
        heap.free(ptr).unwrap();
    }
    assert_eq!(heap.stats().free_bytes, free_before);
    assert_eq!(heap.check().unwrap(), 1);
    assert_eq!(heap.stats().live_blocks, 0);
}

#[test]
fn large_requests_take_whole_pages() {
    let mut heap = heap();
    let before = heap.backing().outstanding();

    let ptr = heap.alloc(3 * PAGE_SIZE).unwrap();
    assert_eq!(heap.stats().large_pages, 4);
    assert_eq!(heap.backing().outstanding(), before + 4);
    unsafe { ptr.as_ptr().write_bytes(0xAB, 3 * PAGE_SIZE) };

    heap.free(ptr).unwrap();
    assert_eq!(heap.stats().large_pages, 0);
    assert_eq!(heap.backing().outstanding(), before);
}

#[test]
fn over_aligned_requests_are_honoured() {
    let mut heap = heap();
    for align in [16usize, 64, 256, PAGE_SIZE] {
        let ptr = heap.alloc_aligned(40, align).unwrap();
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        heap.free(ptr).unwrap();
    }
    assert_eq!(heap.alloc_aligned(8, 3), Err(HeapError::InvalidLayout));
    assert_eq!(heap.alloc_aligned(8, 2 * PAGE_SIZE), Err(HeapError::InvalidLayout));
}

#[test]
fn double_free_is_detected() {
    let mut heap = heap();
    let ptr = heap.alloc(64).unwrap();
    let _guard = heap.alloc(64).unwrap();
    heap.free(ptr).unwrap();
    assert!(matches!(heap.free(ptr), Err(HeapError::DoubleFree { .. })));
}

#[test]
fn foreign_pointers_are_reported_as_corruption() {
    let mut heap = heap();
    let ptr = heap.alloc(64).unwrap();
    let inner = unsafe { std::ptr::NonNull::new_unchecked(ptr.as_ptr().add(32)) };
    assert!(matches!(heap.free(inner), Err(HeapError::Corrupted { .. })));
}

#[test]
fn backing_exhaustion_surfaces_as_out_of_memory() {
    let mut heap = KernelHeap::new(PageBacking::with_limit(INITIAL_PAGES + 1));
    heap.init(INITIAL_PAGES).unwrap();
    assert_eq!(heap.alloc(2 * PAGE_SIZE), Err(HeapError::OutOfMemory));
    let mut count = 0;
    while heap.alloc(512).is_ok() {
        count += 1;
    }
    assert!(count > 0);
    assert_eq!(heap.stats().grow_count, 1);
}
