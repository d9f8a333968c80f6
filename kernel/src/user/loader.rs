use kite_core::elf::{self, ElfError, PageSink};
use kite_core::mem::layout::{USER_STACK_PAGES, USER_STACK_TOP};
use kite_core::mem::paging::{AddressSpace, MapError, PageFlags, Region, RegionFlags};
use kite_core::mem::PAGE_SIZE;
use kite_core::task::ImageExtents;
use kite_core::vfs::VfsError;
use log::{debug, info};

use crate::fs;
use crate::mem::paging::{kernel_directory, TempMapping};
use crate::mem::with_paging;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadError {
    File(VfsError),
    Elf(ElfError),
    Map(MapError),
}

impl From<VfsError> for LoadError {
    fn from(err: VfsError) -> Self {
        LoadError::File(err)
    }
}

impl From<ElfError> for LoadError {
    fn from(err: ElfError) -> Self {
        LoadError::Elf(err)
    }
}

impl From<MapError> for LoadError {
    fn from(err: MapError) -> Self {
        LoadError::Map(err)
    }
}

/// A program image in its own address space, ready to become a task.
pub struct LoadedImage {
    pub space: AddressSpace,
    pub image: ImageExtents,
}

pub fn load_program(path: &str) -> Result<LoadedImage, LoadError> {
    let bytes = fs::with_vfs(|vfs| vfs.read_all(path))?;
    debug!("[loader] read '{}' ({} bytes)", path, bytes.len());
    let loaded = load_image(&bytes)?;
    info!(
        "[loader] '{}' loaded at 0x{:08X}..0x{:08X} entry=0x{:08X}",
        path, loaded.image.start, loaded.image.end, loaded.image.entry
    );
    Ok(loaded)
}

/// Builds a new address space holding every loadable segment of `bytes`
/// plus a user stack below `USER_STACK_TOP` whose top page is mapped.
pub fn load_image(bytes: &[u8]) -> Result<LoadedImage, LoadError> {
    let parsed = elf::parse(bytes)?;
    let space = with_paging(|paging| paging.create_address_space(kernel_directory()))?;
    let mut sink = SpaceSink { space };

    let loaded = elf::load(bytes, &parsed, &mut sink).and_then(|image| {
        sink.map_stack()?;
        Ok(image)
    });
    match loaded {
        Ok(image) => Ok(LoadedImage { space: sink.space, image }),
        Err(err) => {
            let space = sink.space;
            with_paging(|paging| paging.destroy_address_space(space));
            Err(err.into())
        }
    }
}

struct SpaceSink {
    space: AddressSpace,
}

impl SpaceSink {
    fn map_stack(&mut self) -> Result<(), ElfError> {
        let base = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u32;
        let flags = RegionFlags::READ | RegionFlags::WRITE | RegionFlags::USER | RegionFlags::STACK;
        self.space.add_region(Region::new(base, USER_STACK_TOP, flags));

        let directory = self.space.directory();
        let top_page = USER_STACK_TOP - PAGE_SIZE as u32;
        with_paging(|paging| paging.map_fresh(directory, top_page, flags.page_flags()))?;
        Ok(())
    }
}

impl PageSink for SpaceSink {
    fn with_page(&mut self, vaddr: u32, fill: &mut dyn FnMut(&mut [u8], bool)) -> Result<(), ElfError> {
        let directory = self.space.directory();
        let (frame, fresh) = with_paging(|paging| match paging.translate(directory, vaddr) {
            Some(phys) => Ok((phys & !(PAGE_SIZE as u32 - 1), false)),
            None => paging
                .map_fresh(directory, vaddr, PageFlags::WRITABLE | PageFlags::USER)
                .map(|frame| (frame, true)),
        })?;

        let mut view = TempMapping::new(frame)?;
        fill(view.as_mut_slice(), fresh);
        Ok(())
    }

    fn add_region(&mut self, region: Region) {
        self.space.add_region(region);
    }
}
