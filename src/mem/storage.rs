use embedded_storage::nor_flash::{NorFlash, NorFlashError, ReadNorFlash};
use log::error;

use super::ex_flash::{FlashDevice, FlashError};

/// Exposes any `embedded-storage` NOR flash (esp-storage, a HAL's internal
/// flash, ...) as a [`FlashDevice`].
///
/// The file store patches single bytes, so the wrapped flash must accept
/// byte-granular reads and writes. Its erase unit becomes the sector.
pub struct NorFlashDevice<F> {
    flash: F,
    page_size: usize,
}

impl<F: NorFlash> NorFlashDevice<F> {
    pub fn new(flash: F, page_size: usize) -> Result<Self, FlashError> {
        if F::READ_SIZE != 1 || F::WRITE_SIZE != 1 {
            error!(
                "NOR flash needs byte granularity, got read {} / write {}",
                F::READ_SIZE,
                F::WRITE_SIZE
            );
            return Err(FlashError::Unsupported);
        }
        if page_size == 0 || F::ERASE_SIZE % page_size != 0 {
            error!(
                "Page size {page_size} does not divide erase size {}",
                F::ERASE_SIZE
            );
            return Err(FlashError::Unsupported);
        }
        Ok(Self { flash, page_size })
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F: NorFlash> FlashDevice for NorFlashDevice<F> {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn sector_size(&self) -> usize {
        F::ERASE_SIZE
    }

    fn capacity(&self) -> u32 {
        self.flash.capacity() as u32
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        if address >= self.capacity() {
            error!(
                "Invalid read offset {address}: exceeds flash capacity {}",
                self.capacity()
            );
            return Err(FlashError::AddressInvalid);
        }
        self.flash.read(address, buffer).map_err(|e| {
            error!("Read error at offset {address}: {e:?}");
            FlashError::Storage(e.kind())
        })
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Err(FlashError::LenInvalid);
        }
        if address as usize % self.page_size + data.len() > self.page_size {
            return Err(FlashError::PageBoundaryViolation);
        }
        if address as u64 + data.len() as u64 > self.capacity() as u64 {
            error!(
                "Invalid write offset {} or length {}: exceeds flash capacity {}",
                address,
                data.len(),
                self.capacity()
            );
            return Err(FlashError::AddressInvalid);
        }
        self.flash.write(address, data).map_err(|e| {
            error!("Write error at offset {address}: {e:?}");
            FlashError::Storage(e.kind())
        })
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        if address >= self.capacity() {
            error!(
                "Invalid erase offset {address}: exceeds flash capacity {}",
                self.capacity()
            );
            return Err(FlashError::AddressInvalid);
        }
        let erase_size = F::ERASE_SIZE as u32;
        let from = address - address % erase_size;
        self.flash.erase(from, from + erase_size).map_err(|e| {
            error!("Erase error at offset {from}: {e:?}");
            FlashError::Storage(e.kind())
        })
    }
}
