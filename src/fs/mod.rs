//! Flat file store for SPI NOR flash.
//!
//! The first few sectors hold the allocation bitmap and the file directory;
//! everything after them is split into clusters, one per sector, linked into
//! chains by a trailing forward pointer. All updates respect NOR rules:
//! a program only clears bits, so anything that needs a 0 -> 1 transition is
//! done by reading the sector, patching it in RAM, erasing and rewriting it.

mod append;
mod bitmap;
mod chain;
mod directory;
mod error;
mod gc;
mod layout;
mod shared;

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};
use serde::Serialize;

pub use directory::DirIter;
pub use error::FsError;
pub use gc::GcReport;
pub use layout::{CreationDate, File, FileState, Geometry};
pub use shared::SharedFs;

use crate::cfg::fs_cfg::{FsConfig, BLOCK_64K, ERASED};
use crate::mem::ex_flash::FlashDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    /// Reset the bitmap and directory only; stale clusters are erased lazily
    /// when they are next allocated.
    Quick,
    /// Also erase the whole data area
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub data_sectors: u32,
    pub free_sectors: u32,
    pub slots: u32,
    pub free_slots: u32,
}

pub struct FlashFs<D> {
    device: D,
    geometry: Geometry,
}

impl<D: FlashDevice> FlashFs<D> {
    /// Wrap `device` without touching it. Use [`FlashFs::mount`] to also
    /// check that the media carries a file store.
    pub fn new(device: D, config: FsConfig) -> Result<Self, FsError> {
        let geometry = Geometry::new(
            device.page_size(),
            device.sector_size(),
            device.capacity(),
            &config,
        )?;
        debug!(
            "Flash geometry: {} sectors of {} bytes, {} metadata sectors, {} slots",
            geometry.sector_count,
            geometry.sector_size,
            geometry.metadata_sectors,
            geometry.total_slots()
        );
        Ok(Self { device, geometry })
    }

    pub fn mount(device: D, config: FsConfig) -> Result<Self, FsError> {
        let mut fs = Self::new(device, config)?;
        if !fs.is_formatted()? {
            warn!("No file store found on flash");
            return Err(FsError::NotFormatted);
        }
        info!("✓ File store mounted");
        Ok(fs)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    /// True when every metadata sector is marked used in the bitmap
    pub fn is_formatted(&mut self) -> Result<bool, FsError> {
        let bitmap = self.load_bitmap()?;
        Ok((0..self.geometry.metadata_sectors).all(|sector| !bitmap.is_free(sector)))
    }

    pub fn format(&mut self, mode: FormatMode) -> Result<(), FsError> {
        let geo = self.geometry;
        info!("Formatting flash ({mode:?})");
        for k in 0..geo.metadata_sectors {
            self.device.erase_sector(geo.sector_addr(k))?;
        }

        let mut bitmap = vec![ERASED; geo.bitmap_size as usize];
        for sector in 0..geo.metadata_sectors {
            bitmap[(sector / 8) as usize] &= !(1 << (sector % 8));
        }
        self.program(0, &bitmap)?;

        if mode == FormatMode::Full {
            let end = geo.sector_addr(geo.sector_count);
            let mut address = geo.sector_addr(geo.first_data_sector());
            while address < end {
                if address % BLOCK_64K == 0 && address + BLOCK_64K <= end {
                    debug!("Erasing 64KiB block at 0x{address:08X}");
                    self.device.erase_block(address, BLOCK_64K)?;
                    address += BLOCK_64K;
                } else {
                    self.device.erase_sector(address)?;
                    address += geo.sector_size;
                }
            }
        }
        info!("✓ Flash formatted");
        Ok(())
    }

    pub fn usage(&mut self) -> Result<Usage, FsError> {
        let geo = self.geometry;
        let bitmap = self.load_bitmap()?;
        let free_sectors = (geo.first_data_sector()..geo.sector_count)
            .filter(|&sector| bitmap.is_free(sector))
            .count() as u32;
        let mut free_slots = 0;
        for k in 0..geo.metadata_sectors {
            free_slots += self.blank_slots(k)?;
        }
        Ok(Usage {
            data_sectors: geo.data_sectors(),
            free_sectors,
            slots: geo.total_slots(),
            free_slots,
        })
    }

    pub(crate) fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FsError> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.device.read(address, buffer)?;
        Ok(())
    }

    /// Program `data`, split so no single write crosses a page boundary
    pub(crate) fn program(&mut self, mut address: u32, mut data: &[u8]) -> Result<(), FsError> {
        let page = self.geometry.page_size;
        while !data.is_empty() {
            let room = (page - address % page) as usize;
            let (chunk, rest) = data.split_at(room.min(data.len()));
            self.device.write_page(address, chunk)?;
            address += chunk.len() as u32;
            data = rest;
        }
        Ok(())
    }

    pub(crate) fn read_sector(&mut self, sector: u32) -> Result<Vec<u8>, FsError> {
        let mut buf = vec![0u8; self.geometry.sector_size as usize];
        let address = self.geometry.sector_addr(sector);
        self.read(address, &mut buf)?;
        Ok(buf)
    }

    /// Erase `sector` and program `content` back page by page, skipping
    /// pages that are still blank.
    pub(crate) fn rewrite_sector(&mut self, sector: u32, content: &[u8]) -> Result<(), FsError> {
        let base = self.geometry.sector_addr(sector);
        debug!("Rewriting sector {sector} at 0x{base:08X}");
        self.device.erase_sector(base)?;
        let page = self.geometry.page_size as usize;
        for (i, chunk) in content.chunks(page).enumerate() {
            if chunk.iter().all(|&b| b == ERASED) {
                continue;
            }
            self.device.write_page(base + (i * page) as u32, chunk)?;
        }
        Ok(())
    }

    /// True when `len` bytes from `address` all read as erased
    pub(crate) fn is_blank(&mut self, address: u32, len: u32) -> Result<bool, FsError> {
        let mut buf = vec![0u8; self.geometry.page_size as usize];
        let mut offset = 0;
        while offset < len {
            let take = buf.len().min((len - offset) as usize);
            self.read(address + offset, &mut buf[..take])?;
            if buf[..take].iter().any(|&b| b != ERASED) {
                return Ok(false);
            }
            offset += take as u32;
        }
        Ok(true)
    }

    /// Erase the sector at `address` unless it already reads blank
    pub(crate) fn ensure_erased(&mut self, address: u32) -> Result<(), FsError> {
        if !self.is_blank(address, self.geometry.sector_size)? {
            debug!("Sector at 0x{address:08X} not blank, erasing");
            self.device.erase_sector(address)?;
        }
        Ok(())
    }

    /// Run `op`; if it reports no space, collect garbage once and retry.
    /// `protect` is a slot address the collector must leave alone.
    pub(crate) fn with_gc_retry<T>(
        &mut self,
        protect: Option<u32>,
        mut op: impl FnMut(&mut Self) -> Result<Option<T>, FsError>,
    ) -> Result<Option<T>, FsError> {
        if let Some(value) = op(self)? {
            return Ok(Some(value));
        }
        warn!("Flash space exhausted, running garbage collection");
        self.collect(protect)?;
        op(self)
    }
}
