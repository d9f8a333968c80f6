//! Page-granular allocation of a fixed virtual window.
//!
//! Runs come from a bump cursor; returned runs are merged with their
//! neighbours and reused first-fit. A run that ends at the cursor pulls the
//! cursor back instead of being kept. The run table is fixed-size so the
//! window can back the kernel heap without allocating.

use log::warn;

use super::PAGE_SIZE;

pub const MAX_FREE_RUNS: usize = 16;

const fn run_bytes(pages: usize) -> u32 {
    (pages * PAGE_SIZE) as u32
}

pub struct VirtualWindow {
    end: u32,
    cursor: u32,
    runs: [(u32, usize); MAX_FREE_RUNS],
    len: usize,
    dropped_pages: usize,
}

impl VirtualWindow {
    pub const fn new(start: u32, end: u32) -> Self {
        Self {
            end,
            cursor: start,
            runs: [(0, 0); MAX_FREE_RUNS],
            len: 0,
            dropped_pages: 0,
        }
    }

    /// First returned run large enough, else fresh pages at the cursor.
    pub fn take(&mut self, pages: usize) -> Option<u32> {
        if pages == 0 {
            return None;
        }
        if let Some(index) = self.runs[..self.len].iter().position(|&(_, len)| len >= pages) {
            let (base, len) = self.runs[index];
            if len == pages {
                self.remove(index);
            } else {
                self.runs[index] = (base + run_bytes(pages), len - pages);
            }
            return Some(base);
        }
        self.reserve(pages)
    }

    /// Fresh pages at the cursor, never a recycled run.
    pub fn reserve(&mut self, pages: usize) -> Option<u32> {
        let base = self.cursor;
        let end = base.checked_add(run_bytes(pages))?;
        if end > self.end {
            return None;
        }
        self.cursor = end;
        Some(base)
    }

    pub fn give_back(&mut self, base: u32, pages: usize) {
        if pages == 0 {
            return;
        }
        let (mut base, mut pages) = (base, pages);
        let mut index = 0;
        while index < self.len {
            let (run, len) = self.runs[index];
            if run + run_bytes(len) == base {
                base = run;
                pages += len;
                self.remove(index);
            } else if base + run_bytes(pages) == run {
                pages += len;
                self.remove(index);
            } else {
                index += 1;
            }
        }

        if base + run_bytes(pages) == self.cursor {
            self.cursor = base;
            return;
        }

        if self.len < MAX_FREE_RUNS {
            self.runs[self.len] = (base, pages);
            self.len += 1;
            return;
        }

        let mut smallest = 0;
        for index in 1..self.len {
            if self.runs[index].1 < self.runs[smallest].1 {
                smallest = index;
            }
        }
        let (run, len) = self.runs[smallest];
        if len >= pages {
            self.drop_run(base, pages);
        } else {
            self.drop_run(run, len);
            self.runs[smallest] = (base, pages);
        }
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn free_runs(&self) -> usize {
        self.len
    }

    /// Pages given back while the run table was full; never reused.
    pub fn dropped_pages(&self) -> usize {
        self.dropped_pages
    }

    fn remove(&mut self, index: usize) {
        self.len -= 1;
        self.runs[index] = self.runs[self.len];
    }

    fn drop_run(&mut self, base: u32, pages: usize) {
        self.dropped_pages += pages;
        warn!(
            "[window] run table full, {} page(s) at 0x{:08X} lost ({} total)",
            pages, base, self.dropped_pages
        );
    }
}
