//! Allocation bitmap at the start of sector 0.
//!
//! Bit `i` (byte `i / 8`, bit `i % 8`) describes sector `i`: 1 = free,
//! 0 = used. Claiming clears a bit with a one-byte program; freeing needs a
//! 0 -> 1 transition and therefore an erase and rewrite of sector 0.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace};

use super::{FlashFs, FsError};
use crate::cfg::fs_cfg::{ERASED, SLOT_HEAD_OFFSET, SLOT_STATE_OFFSET};
use crate::mem::ex_flash::FlashDevice;

/// RAM copy of the bitmap
pub(crate) struct Bitmap {
    bytes: Vec<u8>,
    dirty: bool,
}

impl Bitmap {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, dirty: false }
    }

    pub fn is_free(&self, sector: u32) -> bool {
        self.bytes
            .get((sector / 8) as usize)
            .is_some_and(|&b| b & (1 << (sector % 8)) != 0)
    }

    pub fn set_free(&mut self, sector: u32) {
        if let Some(b) = self.bytes.get_mut((sector / 8) as usize) {
            let freed = *b | (1 << (sector % 8));
            if freed != *b {
                *b = freed;
                self.dirty = true;
            }
        }
    }

    /// True once any bit went from used to free
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// First `count` free sectors in `from..to`, lowest first
    pub fn first_free(&self, from: u32, to: u32, count: u32) -> Option<Vec<u32>> {
        let found: Vec<u32> = (from..to)
            .filter(|&sector| self.is_free(sector))
            .take(count as usize)
            .collect();
        (found.len() == count as usize).then_some(found)
    }
}

impl<D: FlashDevice> FlashFs<D> {
    pub(crate) fn load_bitmap(&mut self) -> Result<Bitmap, FsError> {
        let mut bytes = vec![0u8; self.geometry.bitmap_size as usize];
        self.read(0, &mut bytes)?;
        Ok(Bitmap::from_bytes(bytes))
    }

    pub fn is_sector_free(&mut self, sector: u32) -> Result<bool, FsError> {
        if sector >= self.geometry.sector_count {
            return Err(FsError::OutOfRange);
        }
        let mut byte = [0u8; 1];
        self.read(sector / 8, &mut byte)?;
        Ok(byte[0] & (1 << (sector % 8)) != 0)
    }

    /// First-fit search over the data area; nothing is claimed
    pub(crate) fn find_free_sectors(&mut self, count: u32) -> Result<Option<Vec<u32>>, FsError> {
        let geo = self.geometry;
        let bitmap = self.load_bitmap()?;
        Ok(bitmap.first_free(geo.first_data_sector(), geo.sector_count, count))
    }

    /// Clear the bit of `sector`. `false` when it was already in use, which
    /// means the sector is about to be handed out twice.
    pub(crate) fn mark_used(&mut self, sector: u32) -> Result<bool, FsError> {
        let address = sector / 8;
        let mut byte = [0u8; 1];
        self.read(address, &mut byte)?;
        let used = byte[0] & !(1 << (sector % 8));
        if used == byte[0] {
            return Ok(false);
        }
        trace!("Claiming sector {sector}");
        self.program(address, &[used])?;
        Ok(true)
    }

    /// Return `sectors` to the free pool with a single rewrite of sector 0.
    /// `detach` is a slot in sector 0 whose head and length are reset to
    /// empty in that same rewrite.
    pub(crate) fn release_sectors(
        &mut self,
        sectors: &[u32],
        detach: Option<u32>,
    ) -> Result<(), FsError> {
        if sectors.is_empty() && detach.is_none() {
            return Ok(());
        }
        let mut content = self.read_sector(0)?;
        let size = self.geometry.bitmap_size as usize;
        let mut bitmap = Bitmap::from_bytes(content[..size].to_vec());
        for &sector in sectors {
            bitmap.set_free(sector);
        }
        let mut changed = bitmap.is_dirty();

        if let Some(address) = detach {
            let base = address as usize;
            let fields = &mut content[base + SLOT_HEAD_OFFSET..base + SLOT_STATE_OFFSET];
            if fields.iter().any(|&b| b != ERASED) {
                fields.fill(ERASED);
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
        debug!("Releasing {} sectors", sectors.len());
        content[..size].copy_from_slice(bitmap.bytes());
        self.rewrite_sector(0, &content)
    }
}
