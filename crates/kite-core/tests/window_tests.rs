use kite_core::mem::window::{VirtualWindow, MAX_FREE_RUNS};
use kite_core::mem::PAGE_SIZE;

const START: u32 = 0xD000_0000;
const END: u32 = 0xD100_0000;
const PAGE: u32 = PAGE_SIZE as u32;

#[test]
fn fresh_runs_come_from_the_cursor() {
    let mut window = VirtualWindow::new(START, END);
    assert_eq!(window.take(2), Some(START));
    assert_eq!(window.take(1), Some(START + 2 * PAGE));
    assert_eq!(window.cursor(), START + 3 * PAGE);
    assert_eq!(window.take(0), None);
}

#[test]
fn the_window_end_is_respected() {
    let mut window = VirtualWindow::new(START, START + 4 * PAGE);
    assert_eq!(window.take(3), Some(START));
    assert_eq!(window.take(2), None);
    assert_eq!(window.take(1), Some(START + 3 * PAGE));
}

#[test]
fn returned_runs_are_reused_first_fit() {
    let mut window = VirtualWindow::new(START, END);
    let a = window.take(4).unwrap();
    let _guard = window.take(1).unwrap();
    window.give_back(a, 4);
    assert_eq!(window.free_runs(), 1);

    assert_eq!(window.take(1), Some(a));
    assert_eq!(window.take(3), Some(a + PAGE));
    assert_eq!(window.free_runs(), 0);
}

#[test]
fn neighbouring_runs_merge() {
    let mut window = VirtualWindow::new(START, END);
    let runs: Vec<u32> = (0..4).map(|_| window.take(2).unwrap()).collect();
    let _guard = window.take(1).unwrap();

    window.give_back(runs[0], 2);
    window.give_back(runs[2], 2);
    assert_eq!(window.free_runs(), 2);
    window.give_back(runs[1], 2);
    assert_eq!(window.free_runs(), 1);
    window.give_back(runs[3], 2);
    assert_eq!(window.free_runs(), 1);

    assert_eq!(window.take(8), Some(runs[0]));
}

#[test]
fn a_run_at_the_cursor_pulls_it_back() {
    let mut window = VirtualWindow::new(START, END);
    let a = window.take(2).unwrap();
    let b = window.take(3).unwrap();
    window.give_back(a, 2);
    window.give_back(b, 3);
    assert_eq!(window.cursor(), START);
    assert_eq!(window.free_runs(), 0);
}

#[test]
fn reserved_pages_are_never_recycled() {
    let mut window = VirtualWindow::new(START, END);
    let a = window.take(1).unwrap();
    let _guard = window.take(1).unwrap();
    window.give_back(a, 1);
    let reserved = window.reserve(1).unwrap();
    assert_ne!(reserved, a);
    assert_eq!(window.take(1), Some(a));
}

#[test]
fn a_full_run_table_drops_the_smallest_run() {
    let mut window = VirtualWindow::new(START, END);
    // Alternate kept and returned runs so none of them can merge.
    let mut returned = Vec::new();
    for index in 0..=MAX_FREE_RUNS {
        returned.push((window.take(index + 1).unwrap(), index + 1));
        window.take(1).unwrap();
    }
    for &(base, pages) in &returned[1..] {
        window.give_back(base, pages);
    }
    assert_eq!(window.free_runs(), MAX_FREE_RUNS);
    assert_eq!(window.dropped_pages(), 0);

    // One page is smaller than everything held, so it is the one lost.
    let (first, pages) = returned[0];
    window.give_back(first, pages);
    assert_eq!(window.free_runs(), MAX_FREE_RUNS);
    assert_eq!(window.dropped_pages(), 1);
    assert_ne!(window.take(1), Some(first));
}
