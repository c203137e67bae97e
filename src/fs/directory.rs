use log::{debug, info, trace, warn};

use super::layout::{CreationDate, File, FileState, Slot};
use super::{FlashFs, FsError};
use crate::cfg::fs_cfg::*;
use crate::mem::ex_flash::FlashDevice;

impl<D: FlashDevice> FlashFs<D> {
    /// Give `file` a directory slot stamped with `date`.
    ///
    /// Names are not checked for uniqueness; `open_file` returns the first
    /// match in directory order.
    pub fn create_file(&mut self, file: &mut File, date: CreationDate) -> Result<(), FsError> {
        let state = FileState::new(date).to_word();
        let slot = Slot::new(file.packed_name(), file.packed_ext(), state);
        let address = self
            .with_gc_retry(None, |fs| fs.claim_slot(&slot))?
            .ok_or_else(|| {
                warn!("Directory full");
                FsError::SlotSpaceExhausted
            })?;
        file.attach(address);
        info!("Created {}.{} at slot 0x{address:08X}", file.name(), file.ext());
        Ok(())
    }

    /// Handle for the first live file called `name.ext`
    pub fn open_file(&mut self, name: &str, ext: &str) -> Result<File, FsError> {
        let wanted = File::new(name, ext)?;
        for entry in self.list_files() {
            let entry = entry?;
            if entry.name() == wanted.name() && entry.ext() == wanted.ext() {
                debug!("Opened {name}.{ext} at slot 0x{:08X}", entry.raw_slot());
                return Ok(entry);
            }
        }
        Err(FsError::NotFound)
    }

    /// Soft delete: clears the live bit, space comes back on the next
    /// garbage collection. Deleting twice is not an error.
    pub fn delete_file(&mut self, file: &File) -> Result<(), FsError> {
        let address = file.slot().ok_or(FsError::FileUnallocated)?;
        let slot = self.read_slot(address)?;
        if !slot.is_allocated() || !slot.names(file) {
            return Err(FsError::NotFound);
        }
        let status = FileState::from_word(slot.state).status;
        let deleted = status & !STATUS_LIVE_BIT;
        if deleted != status {
            self.program(address + SLOT_STATUS_OFFSET as u32, &[deleted])?;
        }
        info!("Deleted {}.{}", file.name(), file.ext());
        Ok(())
    }

    /// Lazily walk the directory, yielding every allocated, non-deleted file
    pub fn list_files(&mut self) -> DirIter<'_, D> {
        DirIter {
            fs: self,
            sector: 0,
            index: 0,
        }
    }

    pub fn file_state(&mut self, file: &File) -> Result<FileState, FsError> {
        let slot = self.live_slot(file)?;
        Ok(FileState::from_word(slot.state))
    }

    pub(crate) fn read_slot(&mut self, address: u32) -> Result<Slot, FsError> {
        if !self.geometry.is_slot_addr(address) {
            return Err(FsError::FileUnallocated);
        }
        let mut raw = [0u8; SLOT_SIZE];
        self.read(address, &mut raw)?;
        Ok(Slot::decode(&raw))
    }

    /// Slot behind `file`, provided it still belongs to that file
    pub(crate) fn live_slot(&mut self, file: &File) -> Result<Slot, FsError> {
        let address = file.slot().ok_or(FsError::FileUnallocated)?;
        let slot = self.read_slot(address)?;
        if !slot.is_live() || !slot.names(file) {
            return Err(FsError::FileUnallocated);
        }
        Ok(slot)
    }

    /// Write `slot` into the first blank slot, maintaining the vacancy flags.
    /// `None` when every metadata sector is full.
    pub(crate) fn claim_slot(&mut self, slot: &Slot) -> Result<Option<u32>, FsError> {
        let geo = self.geometry;
        for k in 0..geo.metadata_sectors {
            let mut flag = [0u8; 1];
            self.read(geo.vacancy_addr(k), &mut flag)?;
            if flag[0] != VACANCY_OPEN {
                continue;
            }

            let content = self.read_sector(k)?;
            let base = geo.sector_addr(k);
            let mut blank = (0..geo.slots_in(k)).map(|i| geo.slot_addr(k, i)).filter(|&addr| {
                let offset = (addr - base) as usize;
                Slot::decode(&content[offset..offset + SLOT_SIZE]).is_blank()
            });
            let first = blank.next();
            let last_one = blank.next().is_none();

            if let Some(address) = first {
                trace!("Claiming slot 0x{address:08X}");
                self.program(address, &slot.encode())?;
            }
            if last_one {
                debug!("Metadata sector {k} full");
                self.program(geo.vacancy_addr(k), &[VACANCY_FULL])?;
            }
            if first.is_some() {
                return Ok(first);
            }
        }
        Ok(None)
    }

    pub(crate) fn blank_slots(&mut self, k: u32) -> Result<u32, FsError> {
        let geo = self.geometry;
        let content = self.read_sector(k)?;
        let base = geo.sector_addr(k);
        Ok((0..geo.slots_in(k))
            .filter(|&i| {
                let offset = (geo.slot_addr(k, i) - base) as usize;
                Slot::decode(&content[offset..offset + SLOT_SIZE]).is_blank()
            })
            .count() as u32)
    }

    /// Store `head` and `length` in the slot at `address`. A straight
    /// program when it only clears bits, otherwise the metadata sector is
    /// patched and rewritten.
    pub(crate) fn update_content(
        &mut self,
        address: u32,
        head: u32,
        length: u32,
    ) -> Result<(), FsError> {
        let field = address + SLOT_HEAD_OFFSET as u32;
        let mut current = [0u8; 8];
        self.read(field, &mut current)?;

        let mut wanted = [0u8; 8];
        wanted[..4].copy_from_slice(&head.to_le_bytes());
        wanted[4..].copy_from_slice(&length.to_le_bytes());
        if current == wanted {
            return Ok(());
        }

        if current.iter().zip(&wanted).all(|(&c, &w)| c & w == w) {
            trace!("Programming slot fields at 0x{address:08X}");
            return self.program(field, &wanted);
        }

        let sector = self.geometry.sector_of(address);
        let mut content = self.read_sector(sector)?;
        let offset = (field - self.geometry.sector_addr(sector)) as usize;
        content[offset..offset + wanted.len()].copy_from_slice(&wanted);
        self.rewrite_sector(sector, &content)
    }
}

/// Iterator returned by [`FlashFs::list_files`]. Stops after the first
/// device error.
pub struct DirIter<'a, D> {
    fs: &'a mut FlashFs<D>,
    sector: u32,
    index: u32,
}

impl<D: FlashDevice> Iterator for DirIter<'_, D> {
    type Item = Result<File, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        let geo = self.fs.geometry;
        while self.sector < geo.metadata_sectors {
            if self.index >= geo.slots_in(self.sector) {
                self.sector += 1;
                self.index = 0;
                continue;
            }
            let address = geo.slot_addr(self.sector, self.index);
            self.index += 1;
            match self.fs.read_slot(address) {
                Ok(slot) if slot.is_live() => return Some(Ok(File::from_slot(address, &slot))),
                Ok(_) => {}
                Err(e) => {
                    self.sector = geo.metadata_sectors;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FormatMode;
    use crate::mem::ram_flash::RamFlash;

    fn fresh() -> FlashFs<RamFlash> {
        let flash = RamFlash::w25q32().with_strict_programming();
        let mut fs = FlashFs::new(flash, FsConfig::default()).unwrap();
        fs.format(FormatMode::Quick).unwrap();
        fs
    }

    fn date() -> CreationDate {
        CreationDate::new(2024, 5, 17).unwrap()
    }

    #[test]
    fn test_first_slot_follows_bitmap() {
        let mut fs = fresh();
        let mut file = File::new("log", "txt").unwrap();
        fs.create_file(&mut file, date()).unwrap();
        assert_eq!(file.slot(), Some(0x200));

        let raw = &fs.device_mut().as_bytes()[0x200..0x218];
        assert_eq!(&raw[..12], b"log\xFF\xFF\xFF\xFF\xFFtxt\xFF");
        assert_eq!(&raw[12..20], &[0xFF; 8]);
        assert_eq!(&raw[20..], &[17, 5, 24, 0xFF]);
    }

    #[test]
    fn test_vacancy_flag_set_on_last_slot() {
        let mut fs = fresh();
        for i in 0..149 {
            let mut file = File::new("f", "bin").unwrap();
            fs.create_file(&mut file, date()).unwrap();
            assert_eq!(file.slot(), Some(0x200 + 24 * i));
        }
        assert_eq!(fs.device_mut().as_bytes()[0xFFF], VACANCY_FULL);

        let mut file = File::new("g", "bin").unwrap();
        fs.create_file(&mut file, date()).unwrap();
        assert_eq!(file.slot(), Some(0x1000));
    }

    #[test]
    fn test_stale_open_flag_is_corrected() {
        let mut fs = fresh();
        // fill sector 0 behind the engine's back
        for i in 0..149u32 {
            fs.device_mut().poke(0x200 + 24 * i, &[0u8; 24]);
        }
        let mut file = File::new("x", "").unwrap();
        fs.create_file(&mut file, date()).unwrap();
        assert_eq!(file.slot(), Some(0x1000));
        assert_eq!(fs.device_mut().as_bytes()[0xFFF], VACANCY_FULL);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut fs = fresh();
        let mut file = File::new("a", "b").unwrap();
        assert_eq!(fs.delete_file(&file), Err(FsError::FileUnallocated));
        fs.create_file(&mut file, date()).unwrap();
        fs.delete_file(&file).unwrap();
        fs.delete_file(&file).unwrap();
        assert_eq!(fs.device_mut().as_bytes()[0x200 + 23], 0xFE);
        assert_eq!(fs.open_file("a", "b"), Err(FsError::NotFound));
    }

    #[test]
    fn test_delete_blank_slot_not_found() {
        let mut fs = fresh();
        let mut file = File::new("a", "b").unwrap();
        fs.create_file(&mut file, date()).unwrap();
        let mut other = File::new("a", "b").unwrap();
        fs.create_file(&mut other, date()).unwrap();
        fs.device_mut().erase_sector(0).unwrap();
        assert_eq!(fs.delete_file(&other), Err(FsError::NotFound));
    }

    #[test]
    fn test_update_content_programs_or_rewrites() {
        let mut fs = fresh();
        let mut file = File::new("a", "b").unwrap();
        fs.create_file(&mut file, date()).unwrap();
        let erases = fs.device_mut().erase_count(0);

        fs.update_content(0x200, 0x4000, 5120).unwrap();
        assert_eq!(fs.device_mut().erase_count(0), erases);

        fs.update_content(0x200, 0x4000, 6000).unwrap();
        assert_eq!(fs.device_mut().erase_count(0), erases + 1);

        let slot = fs.read_slot(0x200).unwrap();
        assert_eq!((slot.head, slot.length), (0x4000, 6000));
        assert!(slot.is_live());
        assert_eq!(fs.device_mut().as_bytes()[0], 0xF0);
    }

    #[test]
    fn test_list_restarts_and_skips_deleted() {
        let mut fs = fresh();
        let mut names = ["one", "two", "three"].map(|n| File::new(n, "txt").unwrap());
        for file in names.iter_mut() {
            fs.create_file(file, date()).unwrap();
        }
        fs.delete_file(&names[1]).unwrap();

        let listed: Vec<_> = fs.list_files().map(|f| f.unwrap()).collect();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name(), "one");
        assert_eq!(listed[1].name(), "three");
        assert_eq!(fs.list_files().count(), 2);
    }

    #[test]
    fn test_file_state() {
        let mut fs = fresh();
        let mut file = File::new("a", "b").unwrap();
        fs.create_file(&mut file, date()).unwrap();
        let state = fs.file_state(&file).unwrap();
        assert_eq!(state.created, date());
        assert!(state.is_live());
    }
}
