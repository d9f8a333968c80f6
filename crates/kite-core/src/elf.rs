//! ELF32 executable parsing and loading.

use alloc::vec::Vec;

use log::debug;

use crate::mem::paging::{MapError, Region, RegionFlags};
use crate::mem::layout::{is_user_address, USER_END};
use crate::mem::{align_down, align_up, PAGE_SIZE};
use crate::task::ImageExtents;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ElfError {
    InvalidMagic,
    UnsupportedClass,
    UnsupportedEncoding,
    UnsupportedType,
    UnsupportedMachine,
    InvalidHeader,
    InvalidProgramHeader,
    NoLoadableSegments,
    SegmentOutOfRange,
    Map(MapError),
}

impl From<MapError> for ElfError {
    fn from(err: MapError) -> Self {
        ElfError::Map(err)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ElfSegment {
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub offset: u32,
    pub flags: u32,
}

impl ElfSegment {
    pub fn writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub fn region_flags(&self) -> RegionFlags {
        let mut flags = RegionFlags::READ | RegionFlags::USER;
        if self.writable() {
            flags |= RegionFlags::WRITE;
        }
        if self.executable() {
            flags |= RegionFlags::EXEC;
        }
        flags
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ElfImage {
    pub entry: u32,
    pub segments: Vec<ElfSegment>,
}

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

pub fn parse(bytes: &[u8]) -> Result<ElfImage, ElfError> {
    if bytes.len() < EHDR_SIZE {
        return Err(ElfError::InvalidHeader);
    }
    if bytes[0..4] != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }
    if bytes[4] != ELFCLASS32 {
        return Err(ElfError::UnsupportedClass);
    }
    if bytes[5] != ELFDATA2LSB {
        return Err(ElfError::UnsupportedEncoding);
    }
    if read_u16(bytes, 16)? != ET_EXEC {
        return Err(ElfError::UnsupportedType);
    }
    if read_u16(bytes, 18)? != EM_386 {
        return Err(ElfError::UnsupportedMachine);
    }

    let entry = read_u32(bytes, 24)?;
    let phoff = read_u32(bytes, 28)? as usize;
    let phentsize = read_u16(bytes, 42)? as usize;
    let phnum = read_u16(bytes, 44)? as usize;

    if phentsize != PHDR_SIZE || phnum == 0 {
        return Err(ElfError::InvalidProgramHeader);
    }

    let mut segments = Vec::new();
    for index in 0..phnum {
        let offset = index
            .checked_mul(phentsize)
            .and_then(|delta| phoff.checked_add(delta))
            .filter(|offset| offset.checked_add(phentsize).is_some_and(|end| end <= bytes.len()))
            .ok_or(ElfError::InvalidProgramHeader)?;
        if read_u32(bytes, offset)? != PT_LOAD {
            continue;
        }

        let segment = ElfSegment {
            offset: read_u32(bytes, offset + 4)?,
            vaddr: read_u32(bytes, offset + 8)?,
            filesz: read_u32(bytes, offset + 16)?,
            memsz: read_u32(bytes, offset + 20)?,
            flags: read_u32(bytes, offset + 24)?,
        };
        if segment.memsz == 0 {
            continue;
        }
        if segment.filesz > segment.memsz
            || (segment.offset as usize).saturating_add(segment.filesz as usize) > bytes.len()
        {
            return Err(ElfError::InvalidProgramHeader);
        }
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(ElfError::NoLoadableSegments);
    }
    Ok(ElfImage { entry, segments })
}

/// Destination of a load: one page of the target address space at a time.
pub trait PageSink {
    /// Maps `vaddr` (user + write) if needed and hands `fill` a kernel view of
    /// the page. `fresh` is true when the page was just mapped and zeroed.
    fn with_page(&mut self, vaddr: u32, fill: &mut dyn FnMut(&mut [u8], bool)) -> Result<(), ElfError>;

    fn add_region(&mut self, region: Region);
}

/// Copies every loadable segment of `bytes` into `sink`.
pub fn load(bytes: &[u8], image: &ElfImage, sink: &mut dyn PageSink) -> Result<ImageExtents, ElfError> {
    let mut start = u32::MAX;
    let mut end = 0u32;

    for segment in &image.segments {
        let seg_end = segment
            .vaddr
            .checked_add(segment.memsz)
            .ok_or(ElfError::SegmentOutOfRange)?;
        if !is_user_address(segment.vaddr) || seg_end > USER_END {
            return Err(ElfError::SegmentOutOfRange);
        }

        let first_page = align_down(segment.vaddr as usize, PAGE_SIZE) as u32;
        let last_page = align_up(seg_end as usize, PAGE_SIZE) as u32;
        let file_start = segment.vaddr;
        let file_end = segment.vaddr + segment.filesz;

        let mut page = first_page;
        while page < last_page {
            sink.with_page(page, &mut |view: &mut [u8], fresh: bool| {
                if fresh {
                    view.fill(0);
                }
                let copy_start = page.max(file_start);
                let copy_end = (page + PAGE_SIZE as u32).min(file_end);
                if copy_start < copy_end {
                    let src = (segment.offset + (copy_start - file_start)) as usize;
                    let len = (copy_end - copy_start) as usize;
                    let dst = (copy_start - page) as usize;
                    view[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
                }
            })?;
            page += PAGE_SIZE as u32;
        }

        sink.add_region(Region::new(first_page, last_page, segment.region_flags()));
        start = start.min(first_page);
        end = end.max(last_page);
        debug!(
            "[elf] segment vaddr=0x{:08X} filesz=0x{:X} memsz=0x{:X} flags={:#x}",
            segment.vaddr, segment.filesz, segment.memsz, segment.flags
        );
    }

    Ok(ImageExtents {
        start,
        end,
        entry: image.entry,
    })
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, ElfError> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ElfError::InvalidHeader)
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ElfError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ElfError::InvalidHeader)
}
