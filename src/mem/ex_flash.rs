use core::fmt;
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};
use embedded_storage::nor_flash::NorFlashErrorKind;
use log::error;

use crate::cfg::fs_cfg::{BLOCK_32K, BLOCK_64K};

#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(u8)]
pub enum SpiCommand {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadStatusReg1 = 0x05,
    ReadJedecId = 0x9F,
    ReadData = 0x03,
    FastRead = 0x0B,
    PageProgram = 0x02,
    SectorErase4Kb = 0x20,
    BlockErase32Kb = 0x52,
    BlockErase64Kb = 0xD8,
    ChipErase = 0xC7,
    PowerDown = 0xB9,
    ReleasePowerDown = 0xAB,
    EnableReset = 0x66,
    ResetDevice = 0x99,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    AddressInvalid,
    LenInvalid,
    SpiError,
    WriteEnableFailed,
    Timeout,
    PageBoundaryViolation,
    /// Programming asked for a 0 -> 1 transition (only raised by strict simulators)
    ProgramViolation,
    /// Geometry or erase size the device cannot serve
    Unsupported,
    Storage(NorFlashErrorKind),
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressInvalid => write!(f, "Address out of range"),
            Self::LenInvalid => write!(f, "Invalid length"),
            Self::SpiError => write!(f, "SPI transfer error"),
            Self::WriteEnableFailed => write!(f, "Write enable latch not set"),
            Self::Timeout => write!(f, "Device busy timeout"),
            Self::PageBoundaryViolation => write!(f, "Write crosses a page boundary"),
            Self::ProgramViolation => write!(f, "Program would set cleared bits"),
            Self::Unsupported => write!(f, "Unsupported operation"),
            Self::Storage(kind) => write!(f, "Storage error: {kind:?}"),
        }
    }
}

/// Byte-readable, page-programmable, sector-erasable NOR part.
///
/// Programming can only clear bits; `write_page` must be given at most one
/// page and must not cross a page boundary. Erasing resets to 0xFF.
pub trait FlashDevice {
    fn page_size(&self) -> usize;

    fn sector_size(&self) -> usize;

    /// Device size in bytes
    fn capacity(&self) -> u32;

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError>;

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase the sector containing `address`
    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError>;

    /// Erase the `size`-aligned region containing `address`
    fn erase_block(&mut self, address: u32, size: u32) -> Result<(), FlashError> {
        erase_sectors(self, address, size)
    }
}

impl<T: FlashDevice + ?Sized> FlashDevice for &mut T {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(address, buffer)
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write_page(address, data)
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        (**self).erase_sector(address)
    }

    fn erase_block(&mut self, address: u32, size: u32) -> Result<(), FlashError> {
        (**self).erase_block(address, size)
    }
}

/// Block erase for parts without a native command: aligns `address` down to
/// `size` and erases every sector in the region.
pub fn erase_sectors<D: FlashDevice + ?Sized>(
    dev: &mut D,
    address: u32,
    size: u32,
) -> Result<(), FlashError> {
    let sector_size = dev.sector_size() as u32;
    if size == 0 || size % sector_size != 0 {
        return Err(FlashError::LenInvalid);
    }
    let start = address - address % size;
    if start as u64 + size as u64 > dev.capacity() as u64 {
        return Err(FlashError::AddressInvalid);
    }
    for sector_addr in (start..start + size).step_by(sector_size as usize) {
        dev.erase_sector(sector_addr)?;
    }
    Ok(())
}

// Status Register 1 bits
const BUSY_BIT: u8 = 0x01;
const WEL_BIT: u8 = 0x02;

// Geometry shared by the whole W25Q family
pub const PAGE_SIZE: usize = 256;
pub const SECTOR_SIZE: usize = 4096;
pub const W25Q32_CAPACITY: u32 = 4 * 1024 * 1024;
pub const W25Q128_CAPACITY: u32 = 16 * 1024 * 1024;

// Worst-case busy times (from datasheet), in milliseconds
const PAGE_PROGRAM_TIMEOUT_MS: u32 = 10;
const SECTOR_ERASE_TIMEOUT_MS: u32 = 500;
const BLOCK_32K_ERASE_TIMEOUT_MS: u32 = 1600;
const BLOCK_64K_ERASE_TIMEOUT_MS: u32 = 2500;
const CHIP_ERASE_TIMEOUT_MS: u32 = 200_000;

/// Blocking driver for Winbond W25Qxx serial NOR flash.
#[derive(Debug)]
pub struct W25Q<SPI, DELAY> {
    spi: SPI,
    delay: DELAY,
    capacity: u32,
}

#[allow(dead_code)]
impl<SPI: SpiDevice, DELAY: DelayNs> W25Q<SPI, DELAY> {
    pub fn new(spi: SPI, delay: DELAY, capacity: u32) -> Self {
        Self {
            spi,
            delay,
            capacity,
        }
    }

    pub fn w25q32(spi: SPI, delay: DELAY) -> Self {
        Self::new(spi, delay, W25Q32_CAPACITY)
    }

    pub fn w25q128(spi: SPI, delay: DELAY) -> Self {
        Self::new(spi, delay, W25Q128_CAPACITY)
    }

    pub fn init(&mut self) -> Result<(), FlashError> {
        // Release from power-down if needed
        self.release_power_down()?;
        self.delay.delay_us(30);
        Ok(())
    }

    /// Give back the bus and the delay provider
    pub fn release(self) -> (SPI, DELAY) {
        (self.spi, self.delay)
    }

    /// Validate address is within flash capacity
    fn validate_address(&self, address: u32) -> Result<(), FlashError> {
        if address >= self.capacity {
            return Err(FlashError::AddressInvalid);
        }
        Ok(())
    }

    /// Validate address range is within flash capacity
    fn validate_address_range(&self, address: u32, length: usize) -> Result<(), FlashError> {
        if address >= self.capacity {
            return Err(FlashError::AddressInvalid);
        }
        if address as u64 + length as u64 > self.capacity as u64 {
            return Err(FlashError::LenInvalid);
        }
        Ok(())
    }

    fn command(&mut self, bytes: &[u8]) -> Result<(), FlashError> {
        self.spi.write(bytes).map_err(|_| FlashError::SpiError)
    }

    fn addressed(command: SpiCommand, address: u32) -> [u8; 4] {
        [
            command as u8,
            (address >> 16) as u8,
            (address >> 8) as u8,
            address as u8,
        ]
    }

    /// Read JEDEC ID (Manufacturer ID + Device ID)
    pub fn read_id(&mut self) -> Result<[u8; 3], FlashError> {
        let mut id = [0u8; 3];
        self.spi
            .transaction(&mut [
                Operation::Write(&[SpiCommand::ReadJedecId as u8]),
                Operation::Read(&mut id),
            ])
            .map_err(|_| FlashError::SpiError)?;
        Ok(id)
    }

    /// Read status register 1
    pub fn read_status_reg1(&mut self) -> Result<u8, FlashError> {
        let mut status = [0u8; 1];
        self.spi
            .transaction(&mut [
                Operation::Write(&[SpiCommand::ReadStatusReg1 as u8]),
                Operation::Read(&mut status),
            ])
            .map_err(|_| FlashError::SpiError)?;
        Ok(status[0])
    }

    /// Check if device is busy (programming/erasing)
    pub fn is_busy(&mut self) -> Result<bool, FlashError> {
        let status = self.read_status_reg1()?;
        Ok((status & BUSY_BIT) != 0)
    }

    /// Poll BUSY once per millisecond, giving up after `timeout_ms`
    fn wait_ready(&mut self, timeout_ms: u32) -> Result<(), FlashError> {
        let mut waited = 0;
        while self.is_busy()? {
            if waited >= timeout_ms {
                error!("✗ Flash still busy after {timeout_ms} ms");
                return Err(FlashError::Timeout);
            }
            self.delay.delay_ms(1);
            waited += 1;
        }
        Ok(())
    }

    /// Check if write enable latch is set
    pub fn is_write_enabled(&mut self) -> Result<bool, FlashError> {
        let status = self.read_status_reg1()?;
        Ok((status & WEL_BIT) != 0)
    }

    /// Send write enable command
    pub fn write_enable(&mut self) -> Result<(), FlashError> {
        self.command(&[SpiCommand::WriteEnable as u8])?;

        // Verify write enable was set
        self.delay.delay_us(10);
        if !self.is_write_enabled()? {
            error!("✗ Write enable latch did not set");
            return Err(FlashError::WriteEnableFailed);
        }
        Ok(())
    }

    /// Send write disable command
    pub fn write_disable(&mut self) -> Result<(), FlashError> {
        self.command(&[SpiCommand::WriteDisable as u8])
    }

    /// Read data from flash memory
    pub fn read_data(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.validate_address_range(address, buffer.len())?;

        if buffer.is_empty() {
            return Err(FlashError::LenInvalid);
        }

        let command = Self::addressed(SpiCommand::ReadData, address);
        self.spi
            .transaction(&mut [Operation::Write(&command), Operation::Read(buffer)])
            .map_err(|_| FlashError::SpiError)
    }

    /// Write data to flash memory (page program)
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.validate_address(address)?;

        if data.is_empty() {
            return Err(FlashError::LenInvalid);
        }

        // Ensure we don't cross page boundaries
        let page_offset = address as usize % PAGE_SIZE;
        let max_write_size = PAGE_SIZE - page_offset;

        if data.len() > max_write_size {
            return Err(FlashError::PageBoundaryViolation);
        }

        self.validate_address_range(address, data.len())?;

        self.wait_ready(PAGE_PROGRAM_TIMEOUT_MS)?;
        self.write_enable()?;

        let command = Self::addressed(SpiCommand::PageProgram, address);
        self.spi
            .transaction(&mut [Operation::Write(&command), Operation::Write(data)])
            .map_err(|_| FlashError::SpiError)?;

        // Wait for programming to complete
        self.wait_ready(PAGE_PROGRAM_TIMEOUT_MS)
    }

    fn erase_aligned(
        &mut self,
        command: SpiCommand,
        address: u32,
        size: u32,
        timeout_ms: u32,
    ) -> Result<(), FlashError> {
        // Validate address and align to region boundary
        self.validate_address(address)?;
        let aligned_address = address & !(size - 1);

        self.wait_ready(timeout_ms)?;
        self.write_enable()?;
        self.command(&Self::addressed(command, aligned_address))?;

        // Wait for erase to complete
        self.wait_ready(timeout_ms)
    }

    /// Erase 4KB sector
    pub fn erase_sector_4kb(&mut self, address: u32) -> Result<(), FlashError> {
        self.erase_aligned(
            SpiCommand::SectorErase4Kb,
            address,
            SECTOR_SIZE as u32,
            SECTOR_ERASE_TIMEOUT_MS,
        )
    }

    /// Erase 32KB block
    pub fn erase_block_32kb(&mut self, address: u32) -> Result<(), FlashError> {
        self.erase_aligned(
            SpiCommand::BlockErase32Kb,
            address,
            BLOCK_32K,
            BLOCK_32K_ERASE_TIMEOUT_MS,
        )
    }

    /// Erase 64KB block
    pub fn erase_block_64kb(&mut self, address: u32) -> Result<(), FlashError> {
        self.erase_aligned(
            SpiCommand::BlockErase64Kb,
            address,
            BLOCK_64K,
            BLOCK_64K_ERASE_TIMEOUT_MS,
        )
    }

    /// Erase entire chip
    pub fn erase_chip(&mut self) -> Result<(), FlashError> {
        self.wait_ready(CHIP_ERASE_TIMEOUT_MS)?;
        self.write_enable()?;
        self.command(&[SpiCommand::ChipErase as u8])?;
        self.wait_ready(CHIP_ERASE_TIMEOUT_MS)
    }

    /// Enter power-down mode
    pub fn power_down(&mut self) -> Result<(), FlashError> {
        self.command(&[SpiCommand::PowerDown as u8])
    }

    /// Release from power-down mode
    pub fn release_power_down(&mut self) -> Result<(), FlashError> {
        self.command(&[SpiCommand::ReleasePowerDown as u8])
    }

    /// Software reset sequence
    pub fn software_reset(&mut self) -> Result<(), FlashError> {
        self.command(&[SpiCommand::EnableReset as u8])?;
        self.command(&[SpiCommand::ResetDevice as u8])?;

        // Wait for reset to complete
        self.delay.delay_us(30);
        Ok(())
    }
}

impl<SPI: SpiDevice, DELAY: DelayNs> FlashDevice for W25Q<SPI, DELAY> {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.read_data(address, buffer)
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.write_data(address, data)
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        self.erase_sector_4kb(address)
    }

    fn erase_block(&mut self, address: u32, size: u32) -> Result<(), FlashError> {
        match size {
            BLOCK_32K => self.erase_block_32kb(address),
            BLOCK_64K => self.erase_block_64kb(address),
            _ => erase_sectors(self, address, size),
        }
    }
}
