//! On-media layout: geometry arithmetic and the directory slot codec.
//!
//! ```text
//! sector 0         [bitmap: bitmap_size][slot][slot]...[pad][vacancy]
//! sector 1..K      [slot][slot]...............[pad][vacancy]
//! sector K..N      cluster = [data: S-4][next cluster address: u32 LE]
//! ```
//!
//! Slots are 24 bytes, fields little-endian. Names are padded with 0xFF.

use heapless::String;
use serde::Serialize;

use super::error::FsError;
use crate::cfg::fs_cfg::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: u32,
    pub sector_size: u32,
    pub sector_count: u32,
    pub metadata_sectors: u32,
    pub bitmap_size: u32,
}

impl Geometry {
    pub fn new(
        page_size: usize,
        sector_size: usize,
        capacity: u32,
        config: &FsConfig,
    ) -> Result<Self, FsError> {
        let page_size = page_size as u32;
        let sector_size = sector_size as u32;
        if page_size == 0 || sector_size < 2 * page_size || sector_size % page_size != 0 {
            return Err(FsError::InvalidGeometry);
        }
        if capacity == 0 || capacity % sector_size != 0 {
            return Err(FsError::InvalidGeometry);
        }
        let sector_count = capacity / sector_size;
        if config.metadata_sectors == 0 || config.metadata_sectors >= sector_count {
            return Err(FsError::InvalidGeometry);
        }
        // one bit per sector, and room for at least one slot plus the vacancy byte
        if config.bitmap_size == 0
            || sector_count as u64 > config.bitmap_size as u64 * 8
            || config.bitmap_size as u64 + SLOT_SIZE as u64 + 1 > sector_size as u64
        {
            return Err(FsError::InvalidGeometry);
        }
        Ok(Self {
            page_size,
            sector_size,
            sector_count,
            metadata_sectors: config.metadata_sectors,
            bitmap_size: config.bitmap_size,
        })
    }

    /// Payload bytes per cluster
    pub fn data_area(&self) -> u32 {
        self.sector_size - LINK_SIZE as u32
    }

    pub fn sector_addr(&self, sector: u32) -> u32 {
        sector * self.sector_size
    }

    pub fn sector_of(&self, address: u32) -> u32 {
        address / self.sector_size
    }

    pub fn first_data_sector(&self) -> u32 {
        self.metadata_sectors
    }

    pub fn data_sectors(&self) -> u32 {
        self.sector_count - self.metadata_sectors
    }

    /// Clusters needed to hold `size` bytes
    pub fn clusters_for(&self, size: u32) -> u32 {
        size.div_ceil(self.data_area())
    }

    /// True when `address` is the start of a data sector
    pub fn is_cluster(&self, address: u32) -> bool {
        address % self.sector_size == 0
            && (self.first_data_sector()..self.sector_count).contains(&self.sector_of(address))
    }

    /// Address of the forward pointer of the cluster at `cluster`
    pub fn link_addr(&self, cluster: u32) -> u32 {
        cluster + self.data_area()
    }

    /// Absolute address of the first slot of metadata sector `k`
    pub fn slot_table_start(&self, k: u32) -> u32 {
        let base = self.sector_addr(k);
        if k == 0 {
            base + self.bitmap_size
        } else {
            base
        }
    }

    pub fn slots_in(&self, k: u32) -> u32 {
        let start = self.slot_table_start(k) - self.sector_addr(k);
        (self.sector_size - 1 - start) / SLOT_SIZE as u32
    }

    pub fn total_slots(&self) -> u32 {
        (0..self.metadata_sectors).map(|k| self.slots_in(k)).sum()
    }

    /// Address of slot `index` in metadata sector `k`
    pub fn slot_addr(&self, k: u32, index: u32) -> u32 {
        self.slot_table_start(k) + index * SLOT_SIZE as u32
    }

    pub fn vacancy_addr(&self, k: u32) -> u32 {
        self.sector_addr(k + 1) - 1
    }

    /// True when `address` is the start of a slot
    pub fn is_slot_addr(&self, address: u32) -> bool {
        let k = self.sector_of(address);
        if k >= self.metadata_sectors {
            return false;
        }
        let start = self.slot_table_start(k);
        address >= start
            && (address - start) % SLOT_SIZE as u32 == 0
            && (address - start) / (SLOT_SIZE as u32) < self.slots_in(k)
    }
}

/// Creation date stored in the state word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreationDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl CreationDate {
    /// Month and day are bounded so a live state word never reads as all-ones
    pub fn new(year: u16, month: u8, day: u8) -> Result<Self, FsError> {
        if !(YEAR_BASE..YEAR_BASE + 255).contains(&year)
            || !(1..=12).contains(&month)
            || !(1..=31).contains(&day)
        {
            return Err(FsError::InvalidDate);
        }
        Ok(Self { year, month, day })
    }
}

/// Decoded state word: creation date plus status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileState {
    pub created: CreationDate,
    pub status: u8,
}

impl FileState {
    pub fn new(created: CreationDate) -> Self {
        Self {
            created,
            status: STATUS_NEW,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status & STATUS_LIVE_BIT != 0
    }

    pub fn to_word(&self) -> u32 {
        u32::from_le_bytes([
            self.created.day,
            self.created.month,
            (self.created.year - YEAR_BASE) as u8,
            self.status,
        ])
    }

    pub fn from_word(word: u32) -> Self {
        let [day, month, year, status] = word.to_le_bytes();
        Self {
            created: CreationDate {
                year: YEAR_BASE + year as u16,
                month,
                day,
            },
            status,
        }
    }
}

/// One directory record as stored on flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub name: [u8; NAME_LEN],
    pub ext: [u8; EXT_LEN],
    pub head: u32,
    pub length: u32,
    pub state: u32,
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

impl Slot {
    pub fn new(name: [u8; NAME_LEN], ext: [u8; EXT_LEN], state: u32) -> Self {
        Self {
            name,
            ext,
            head: SENTINEL,
            length: SENTINEL,
            state,
        }
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [ERASED; NAME_LEN];
        let mut ext = [ERASED; EXT_LEN];
        name.copy_from_slice(&raw[SLOT_NAME_OFFSET..SLOT_NAME_OFFSET + NAME_LEN]);
        ext.copy_from_slice(&raw[SLOT_EXT_OFFSET..SLOT_EXT_OFFSET + EXT_LEN]);
        Self {
            name,
            ext,
            head: read_u32(raw, SLOT_HEAD_OFFSET),
            length: read_u32(raw, SLOT_LENGTH_OFFSET),
            state: read_u32(raw, SLOT_STATE_OFFSET),
        }
    }

    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut raw = [ERASED; SLOT_SIZE];
        raw[SLOT_NAME_OFFSET..SLOT_NAME_OFFSET + NAME_LEN].copy_from_slice(&self.name);
        raw[SLOT_EXT_OFFSET..SLOT_EXT_OFFSET + EXT_LEN].copy_from_slice(&self.ext);
        raw[SLOT_HEAD_OFFSET..SLOT_HEAD_OFFSET + 4].copy_from_slice(&self.head.to_le_bytes());
        raw[SLOT_LENGTH_OFFSET..SLOT_LENGTH_OFFSET + 4].copy_from_slice(&self.length.to_le_bytes());
        raw[SLOT_STATE_OFFSET..SLOT_STATE_OFFSET + 4].copy_from_slice(&self.state.to_le_bytes());
        raw
    }

    /// Never written since the last erase; only these are handed out
    pub fn is_blank(&self) -> bool {
        self.name == [ERASED; NAME_LEN]
            && self.ext == [ERASED; EXT_LEN]
            && self.state == SENTINEL
            && self.is_empty()
    }

    pub fn is_allocated(&self) -> bool {
        self.state != SENTINEL
    }

    pub fn is_deleted(&self) -> bool {
        self.is_allocated() && FileState::from_word(self.state).status & STATUS_LIVE_BIT == 0
    }

    /// Allocated but never written
    pub fn is_empty(&self) -> bool {
        self.head == SENTINEL && self.length == SENTINEL
    }

    /// Allocated and not soft-deleted
    pub fn is_live(&self) -> bool {
        self.is_allocated() && !self.is_deleted()
    }

    /// Same name and extension as `file`
    pub fn names(&self, file: &File) -> bool {
        self.name == file.packed_name() && self.ext == file.packed_ext()
    }
}

pub(crate) fn pack_name<const N: usize>(text: &str) -> [u8; N] {
    let mut packed = [ERASED; N];
    packed[..text.len()].copy_from_slice(text.as_bytes());
    packed
}

fn unpack_name<const N: usize>(raw: &[u8]) -> String<N> {
    let end = raw.iter().position(|&b| b == ERASED).unwrap_or(raw.len());
    let mut text = String::new();
    // names are written from &str, anything else is a damaged slot
    let _ = text.push_str(core::str::from_utf8(&raw[..end]).unwrap_or("?"));
    text
}

/// Caller-side view of a file: name plus where its slot and content live.
///
/// Only the slot and the cluster chain are persisted; a handle is a cached
/// copy that `create_file`, `write_file`, `append_file` keep in step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct File {
    name: String<NAME_LEN>,
    ext: String<EXT_LEN>,
    slot: u32,
    head: u32,
    length: u32,
}

impl File {
    /// Unattached handle for `name.ext`; `create_file` gives it a slot.
    pub fn new(name: &str, ext: &str) -> Result<Self, FsError> {
        if name.is_empty() {
            return Err(FsError::InvalidName);
        }
        if name.len() > NAME_LEN || ext.len() > EXT_LEN {
            return Err(FsError::NameTooLong);
        }
        let mut file = Self {
            name: String::new(),
            ext: String::new(),
            slot: SENTINEL,
            head: SENTINEL,
            length: SENTINEL,
        };
        file.name.push_str(name).map_err(|_| FsError::NameTooLong)?;
        file.ext.push_str(ext).map_err(|_| FsError::NameTooLong)?;
        Ok(file)
    }

    pub(crate) fn from_slot(address: u32, slot: &Slot) -> Self {
        Self {
            name: unpack_name(&slot.name),
            ext: unpack_name(&slot.ext),
            slot: address,
            head: slot.head,
            length: slot.length,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    /// Directory slot address, once created
    pub fn slot(&self) -> Option<u32> {
        (self.slot != SENTINEL).then_some(self.slot)
    }

    /// Address of the first cluster, once written
    pub fn head(&self) -> Option<u32> {
        (self.head != SENTINEL).then_some(self.head)
    }

    /// Content length in bytes (0 before the first write)
    pub fn len(&self) -> u32 {
        if self.length == SENTINEL {
            0
        } else {
            self.length
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_content(&self) -> bool {
        self.head != SENTINEL
    }

    pub(crate) fn packed_name(&self) -> [u8; NAME_LEN] {
        pack_name(&self.name)
    }

    pub(crate) fn packed_ext(&self) -> [u8; EXT_LEN] {
        pack_name(&self.ext)
    }

    pub(crate) fn raw_slot(&self) -> u32 {
        self.slot
    }

    pub(crate) fn raw_length(&self) -> u32 {
        self.length
    }

    pub(crate) fn attach(&mut self, slot: u32) {
        self.slot = slot;
        self.head = SENTINEL;
        self.length = SENTINEL;
    }

    pub(crate) fn set_content(&mut self, head: u32, length: u32) {
        self.head = head;
        self.length = length;
    }

    pub(crate) fn grow(&mut self, by: u32) {
        self.length = self.len() + by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w25q32() -> Geometry {
        Geometry::new(256, 4096, 4 * 1024 * 1024, &FsConfig::default()).unwrap()
    }

    #[test]
    fn test_default_geometry() {
        let geo = w25q32();
        assert_eq!(geo.sector_count, 1024);
        assert_eq!(geo.data_area(), 4092);
        assert_eq!(geo.slots_in(0), 149);
        assert_eq!(geo.slots_in(1), 170);
        assert_eq!(geo.total_slots(), 659);
        assert_eq!(geo.slot_addr(0, 0), 0x200);
        assert_eq!(geo.slot_addr(2, 1), 0x2018);
        assert_eq!(geo.vacancy_addr(3), 0x3FFF);
        assert_eq!(geo.clusters_for(5120), 2);
        assert_eq!(geo.clusters_for(4092), 1);
        assert_eq!(geo.clusters_for(0), 0);
    }

    #[test]
    fn test_slot_table_does_not_reach_vacancy_byte() {
        let geo = w25q32();
        for k in 0..geo.metadata_sectors {
            let last = geo.slot_addr(k, geo.slots_in(k) - 1);
            assert!(last + SLOT_SIZE as u32 <= geo.vacancy_addr(k));
        }
    }

    #[test]
    fn test_address_classification() {
        let geo = w25q32();
        assert!(geo.is_cluster(0x4000));
        assert!(!geo.is_cluster(0x3000));
        assert!(!geo.is_cluster(0x4004));
        assert!(!geo.is_cluster(4 * 1024 * 1024));
        assert!(geo.is_slot_addr(0x200));
        assert!(geo.is_slot_addr(0x1000 + 24 * 169));
        assert!(!geo.is_slot_addr(0x1000 + 24 * 170));
        assert!(!geo.is_slot_addr(0x1FF));
        assert!(!geo.is_slot_addr(0x4000));
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let cfg = FsConfig::default();
        // 32 MiB needs 8192 bits, bitmap only has 4096
        assert_eq!(
            Geometry::new(256, 4096, 32 * 1024 * 1024, &cfg),
            Err(FsError::InvalidGeometry)
        );
        assert_eq!(
            Geometry::new(256, 4096, 16 * 1024, &cfg),
            Err(FsError::InvalidGeometry)
        );
        assert_eq!(
            Geometry::new(300, 4096, 4 * 1024 * 1024, &cfg),
            Err(FsError::InvalidGeometry)
        );
        assert_eq!(
            Geometry::new(4096, 4096, 4 * 1024 * 1024, &cfg),
            Err(FsError::InvalidGeometry)
        );
        assert!(Geometry::new(256, 4096, 20 * 1024, &cfg).is_ok());
    }

    #[test]
    fn test_state_word_layout() {
        let state = FileState::new(CreationDate::new(2019, 10, 24).unwrap());
        let word = state.to_word();
        assert_eq!(word.to_le_bytes(), [24, 10, 19, 0xFF]);
        assert_eq!(FileState::from_word(word), state);
        assert!(state.is_live());
        assert!(CreationDate::new(1999, 1, 1).is_err());
        assert!(CreationDate::new(2255, 1, 1).is_err());
        assert!(CreationDate::new(2020, 13, 1).is_err());
        assert!(CreationDate::new(2020, 2, 0).is_err());
    }

    #[test]
    fn test_slot_codec() {
        let state = FileState::new(CreationDate::new(2020, 2, 9).unwrap()).to_word();
        let mut slot = Slot::new(pack_name("hello"), pack_name("txt"), state);
        let raw = slot.encode();
        assert_eq!(&raw[..8], b"hello\xFF\xFF\xFF");
        assert_eq!(&raw[8..12], b"txt\xFF");
        assert_eq!(&raw[12..20], &[0xFF; 8]);
        assert_eq!(raw[23], 0xFF);
        assert!(Slot::decode(&raw).is_empty());

        slot.head = 0x4000;
        slot.length = 5120;
        let decoded = Slot::decode(&slot.encode());
        assert_eq!(decoded, slot);
        assert!(decoded.is_live());

        let mut raw = decoded.encode();
        raw[23] &= !STATUS_LIVE_BIT;
        assert!(Slot::decode(&raw).is_deleted());
        let blank = Slot::decode(&[0xFF; SLOT_SIZE]);
        assert!(blank.is_blank());
        assert!(!blank.is_allocated());
        assert!(!decoded.is_blank());
    }

    #[test]
    fn test_file_handle_names() {
        assert_eq!(File::new("toolongname", "txt"), Err(FsError::NameTooLong));
        assert_eq!(File::new("a", "json"), File::new("a", "json"));
        assert_eq!(File::new("a", "jsonx"), Err(FsError::NameTooLong));
        assert_eq!(File::new("", "txt"), Err(FsError::InvalidName));

        let file = File::new("hello", "txt").unwrap();
        assert_eq!(file.slot(), None);
        assert_eq!(file.len(), 0);
        assert!(!file.has_content());

        let slot = Slot::new(file.packed_name(), file.packed_ext(), 0);
        let back = File::from_slot(0x200, &slot);
        assert_eq!(back.name(), "hello");
        assert_eq!(back.ext(), "txt");
        assert_eq!(back.slot(), Some(0x200));
    }
}
