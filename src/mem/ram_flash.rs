//! In-memory NOR flash.
//!
//! Behaves like the real part where it matters to the file store: erased
//! bytes read 0xFF, programming ANDs into the array (bits only go 1 -> 0),
//! a program may not cross a page boundary, and erases work on whole
//! sectors. Per-sector erase counters let callers check wear behaviour.

use alloc::vec;
use alloc::vec::Vec;

use super::ex_flash::{FlashDevice, FlashError};
use crate::cfg::fs_cfg::ERASED;

pub struct RamFlash {
    mem: Vec<u8>,
    page_size: usize,
    sector_size: usize,
    erase_counts: Vec<u32>,
    page_writes: u32,
    strict: bool,
}

impl RamFlash {
    /// Blank (fully erased) device.
    ///
    /// `capacity` must be a multiple of `sector_size`, which must be a
    /// multiple of `page_size`.
    pub fn new(capacity: usize, sector_size: usize, page_size: usize) -> Self {
        Self {
            mem: vec![ERASED; capacity],
            page_size,
            sector_size,
            erase_counts: vec![0; capacity / sector_size],
            page_writes: 0,
            strict: false,
        }
    }

    /// W25Q32 geometry: 4 MiB, 4 KiB sectors, 256 B pages
    pub fn w25q32() -> Self {
        Self::new(4 * 1024 * 1024, 4096, 256)
    }

    /// Reject programs that would need a 0 -> 1 transition instead of
    /// silently ANDing them in like the silicon does.
    pub fn with_strict_programming(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Raw view of the array
    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }

    /// Number of times the sector with index `sector` has been erased
    pub fn erase_count(&self, sector: u32) -> u32 {
        self.erase_counts.get(sector as usize).copied().unwrap_or(0)
    }

    pub fn total_erases(&self) -> u32 {
        self.erase_counts.iter().sum()
    }

    /// Number of successful `write_page` calls
    pub fn page_writes(&self) -> u32 {
        self.page_writes
    }

    /// Overwrite bytes without NOR rules, for corrupting images in tests
    pub fn poke(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    fn check_range(&self, address: u32, len: usize) -> Result<usize, FlashError> {
        let start = address as usize;
        if start >= self.mem.len() {
            return Err(FlashError::AddressInvalid);
        }
        if start + len > self.mem.len() {
            return Err(FlashError::LenInvalid);
        }
        Ok(start)
    }
}

impl FlashDevice for RamFlash {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn capacity(&self) -> u32 {
        self.mem.len() as u32
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let start = self.check_range(address, buffer.len())?;
        buffer.copy_from_slice(&self.mem[start..start + buffer.len()]);
        Ok(())
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Err(FlashError::LenInvalid);
        }
        let start = self.check_range(address, data.len())?;
        if start % self.page_size + data.len() > self.page_size {
            return Err(FlashError::PageBoundaryViolation);
        }
        let cells = &mut self.mem[start..start + data.len()];
        if self.strict && cells.iter().zip(data).any(|(&cell, &byte)| !cell & byte != 0) {
            return Err(FlashError::ProgramViolation);
        }
        for (cell, &byte) in cells.iter_mut().zip(data) {
            *cell &= byte;
        }
        self.page_writes += 1;
        Ok(())
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        let start = self.check_range(address, 0)?;
        let sector = start / self.sector_size;
        let base = sector * self.sector_size;
        self.mem[base..base + self.sector_size].fill(ERASED);
        self.erase_counts[sector] += 1;
        Ok(())
    }
}
