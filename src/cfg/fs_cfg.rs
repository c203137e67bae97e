// On-media layout constants
/// All-ones word: "no next cluster" / "field never written"
pub const SENTINEL: u32 = 0xFFFF_FFFF;
/// Value of every byte after an erase
pub const ERASED: u8 = 0xFF;

// Directory slot: name[8] ext[4] head[4] length[4] state[4], little-endian
pub const SLOT_SIZE: usize = 24;
pub const NAME_LEN: usize = 8;
pub const EXT_LEN: usize = 4;
pub const SLOT_NAME_OFFSET: usize = 0;
pub const SLOT_EXT_OFFSET: usize = 8;
pub const SLOT_HEAD_OFFSET: usize = 12;
pub const SLOT_LENGTH_OFFSET: usize = 16;
pub const SLOT_STATE_OFFSET: usize = 20;
/// Status byte is the most significant byte of the state word
pub const SLOT_STATUS_OFFSET: usize = 23;
/// Liveness flag inside the status byte (1 = live, 0 = soft-deleted)
pub const STATUS_LIVE_BIT: u8 = 0x01;
/// Status byte of a freshly created file
pub const STATUS_NEW: u8 = 0xFF;

/// Trailing forward pointer of every cluster
pub const LINK_SIZE: usize = 4;

// Vacancy flag in the last byte of each metadata sector
pub const VACANCY_OPEN: u8 = 0xFF;
pub const VACANCY_FULL: u8 = 0x00;

/// Creation years are stored as an offset from this year
pub const YEAR_BASE: u16 = 2000;

// Defaults (W25Q-class part: 4 KiB sectors, 256 B pages)
pub const DEFAULT_METADATA_SECTORS: u32 = 4;
pub const DEFAULT_BITMAP_SIZE: u32 = 512;

// Erase granularities used by a full format
pub const BLOCK_32K: u32 = 32 * 1024;
pub const BLOCK_64K: u32 = 64 * 1024;

/// Engine configuration. Page size, sector size and capacity come from the
/// device; this only fixes how the leading sectors are carved up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// Number of leading sectors holding the bitmap and the directory
    pub metadata_sectors: u32,
    /// Bytes at the start of sector 0 reserved for the allocation bitmap
    pub bitmap_size: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            metadata_sectors: DEFAULT_METADATA_SECTORS,
            bitmap_size: DEFAULT_BITMAP_SIZE,
        }
    }
}

impl FsConfig {
    pub const fn new(metadata_sectors: u32, bitmap_size: u32) -> Self {
        Self {
            metadata_sectors,
            bitmap_size,
        }
    }
}
