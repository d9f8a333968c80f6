//! Physical frame bitmap.
//!
//! One bit per 4 KiB frame, set when the frame is in use. The allocator
//! starts with every frame marked used; boot code frees the regions the
//! firmware reports as available and re-reserves the kernel image.

use log::warn;

pub const FRAME_SIZE: u32 = 4096;

/// 32768 frames cover the first 128 MiB.
pub const MAX_FRAMES: usize = 32 * 1024;

const WORD_BITS: usize = 32;
const WORDS: usize = MAX_FRAMES / WORD_BITS;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

pub struct FrameAllocator {
    bitmap: [u32; WORDS],
    base: u32,
    frames: usize,
    used: usize,
}

impl FrameAllocator {
    /// Tracks `frames` frames starting at physical address `base`, all used.
    pub const fn new(base: u32, frames: usize) -> Self {
        let frames = if frames > MAX_FRAMES { MAX_FRAMES } else { frames };
        Self {
            bitmap: [u32::MAX; WORDS],
            base,
            frames,
            used: frames,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn end(&self) -> u64 {
        self.base as u64 + self.frames as u64 * FRAME_SIZE as u64
    }

    /// Marks every whole frame inside `[base, base + len)` as free.
    pub fn mark_region_free(&mut self, base: u64, len: u64) {
        let start = align_up64(base, FRAME_SIZE as u64);
        let end = align_down64(base.saturating_add(len), FRAME_SIZE as u64);
        let mut addr = start;
        while addr < end {
            if let Some(index) = self.index_of(addr) {
                self.clear(index);
            }
            addr += FRAME_SIZE as u64;
        }
    }

    /// Marks every frame touching `[base, base + len)` as used.
    pub fn mark_region_used(&mut self, base: u64, len: u64) {
        let start = align_down64(base, FRAME_SIZE as u64);
        let end = align_up64(base.saturating_add(len), FRAME_SIZE as u64);
        let mut addr = start;
        while addr < end {
            if let Some(index) = self.index_of(addr) {
                self.set(index);
            }
            addr += FRAME_SIZE as u64;
        }
    }

    /// First-fit allocation from the lowest frame index.
    pub fn alloc(&mut self) -> Option<u32> {
        let words = self.frames.div_ceil(WORD_BITS);
        for word_index in 0..words {
            let word = self.bitmap[word_index];
            if word == u32::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let index = word_index * WORD_BITS + bit;
            if index >= self.frames {
                return None;
            }
            self.set(index);
            return Some(self.base + (index as u32) * FRAME_SIZE);
        }
        None
    }

    /// Returns a frame. Freeing a free, unaligned or foreign frame is a no-op.
    pub fn free(&mut self, addr: u32) {
        if addr % FRAME_SIZE != 0 {
            warn!("[frame] ignoring free of unaligned address 0x{:08X}", addr);
            return;
        }
        match self.index_of(addr as u64) {
            Some(index) => self.clear(index),
            None => warn!("[frame] ignoring free of untracked frame 0x{:08X}", addr),
        }
    }

    pub fn is_used(&self, addr: u32) -> bool {
        match self.index_of(addr as u64) {
            Some(index) => self.test(index),
            None => true,
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.frames,
            used: self.used,
            free: self.frames - self.used,
        }
    }

    fn index_of(&self, addr: u64) -> Option<usize> {
        if addr < self.base as u64 {
            return None;
        }
        let index = ((addr - self.base as u64) / FRAME_SIZE as u64) as usize;
        (index < self.frames).then_some(index)
    }

    fn test(&self, index: usize) -> bool {
        self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize) {
        if !self.test(index) {
            self.bitmap[index / WORD_BITS] |= 1 << (index % WORD_BITS);
            self.used += 1;
        }
    }

    fn clear(&mut self, index: usize) {
        if self.test(index) {
            self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
            self.used -= 1;
        }
    }
}

fn align_up64(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn align_down64(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}
