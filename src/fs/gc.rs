//! Garbage collection.
//!
//! Reclaims slots that are soft-deleted or were created but never written,
//! frees their chains, and writes back each metadata sector that changed.
//! Sector 0 is visited last so the bitmap it carries reflects every chain
//! freed along the way.

use log::{debug, info};
use serde::Serialize;

use super::bitmap::Bitmap;
use super::layout::Slot;
use super::{FlashFs, FsError};
use crate::cfg::fs_cfg::{ERASED, SENTINEL, SLOT_SIZE, VACANCY_OPEN};
use crate::mem::ex_flash::FlashDevice;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub slots_reclaimed: u32,
    pub sectors_freed: u32,
    pub sectors_rewritten: u32,
}

impl<D: FlashDevice> FlashFs<D> {
    pub fn run_gc(&mut self) -> Result<GcReport, FsError> {
        self.collect(None)
    }

    /// Collect everything except the slot at `protect`
    pub(crate) fn collect(&mut self, protect: Option<u32>) -> Result<GcReport, FsError> {
        let geo = self.geometry;
        let mut bitmap: Bitmap = self.load_bitmap()?;
        let mut report = GcReport::default();

        for k in (0..geo.metadata_sectors).rev() {
            let mut content = self.read_sector(k)?;
            let base = geo.sector_addr(k);
            let mut changed = false;

            for i in 0..geo.slots_in(k) {
                let address = geo.slot_addr(k, i);
                let offset = (address - base) as usize;
                let slot = Slot::decode(&content[offset..offset + SLOT_SIZE]);
                if slot.is_blank() || protect == Some(address) {
                    continue;
                }
                if slot.is_live() && !slot.is_empty() {
                    continue;
                }

                if slot.head != SENTINEL {
                    for sector in self.free_chain(slot.head)? {
                        bitmap.set_free(sector);
                        report.sectors_freed += 1;
                    }
                }
                debug!("Reclaiming slot 0x{address:08X}");
                content[offset..offset + SLOT_SIZE].fill(ERASED);
                report.slots_reclaimed += 1;
                changed = true;
            }

            if changed {
                content[geo.sector_size as usize - 1] = VACANCY_OPEN;
            }
            if k == 0 && bitmap.is_dirty() {
                content[..geo.bitmap_size as usize].copy_from_slice(bitmap.bytes());
                changed = true;
            }
            if changed {
                self.rewrite_sector(k, &content)?;
                report.sectors_rewritten += 1;
            }
        }

        info!(
            "✓ GC reclaimed {} slots, freed {} sectors, rewrote {} metadata sectors",
            report.slots_reclaimed, report.sectors_freed, report.sectors_rewritten
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::fs_cfg::{FsConfig, VACANCY_FULL};
    use crate::fs::{CreationDate, File, FormatMode};
    use crate::mem::ram_flash::RamFlash;

    fn fresh() -> FlashFs<RamFlash> {
        let flash = RamFlash::w25q32().with_strict_programming();
        let mut fs = FlashFs::new(flash, FsConfig::default()).unwrap();
        fs.format(FormatMode::Quick).unwrap();
        fs
    }

    fn create(fs: &mut FlashFs<RamFlash>, name: &str) -> File {
        let mut file = File::new(name, "dat").unwrap();
        fs.create_file(&mut file, CreationDate::new(2021, 3, 4).unwrap())
            .unwrap();
        file
    }

    #[test]
    fn test_gc_on_clean_store_is_noop() {
        let mut fs = fresh();
        let mut file = create(&mut fs, "keep");
        fs.write_file(&mut file, b"data").unwrap();
        let erases = fs.device_mut().total_erases();
        assert_eq!(fs.run_gc().unwrap(), GcReport::default());
        assert_eq!(fs.device_mut().total_erases(), erases);
    }

    #[test]
    fn test_gc_reclaims_deleted_and_empty() {
        let mut fs = fresh();
        let mut gone = create(&mut fs, "gone");
        fs.write_file(&mut gone, &[9; 5000]).unwrap();
        let _never = create(&mut fs, "never");
        let mut kept = create(&mut fs, "kept");
        fs.write_file(&mut kept, b"still here").unwrap();
        fs.delete_file(&gone).unwrap();

        let report = fs.run_gc().unwrap();
        assert_eq!(report.slots_reclaimed, 2);
        assert_eq!(report.sectors_freed, 2);
        assert_eq!(report.sectors_rewritten, 1);

        assert!(fs.is_sector_free(4).unwrap());
        assert!(fs.is_sector_free(5).unwrap());
        assert!(!fs.is_sector_free(6).unwrap());
        assert!(fs.device_mut().as_bytes()[0x4000..0x6000].iter().all(|&b| b == 0xFF));
        assert!(fs.device_mut().as_bytes()[0x200..0x230].iter().all(|&b| b == 0xFF));

        let kept = fs.open_file("kept", "dat").unwrap();
        let mut buf = [0u8; 10];
        fs.read_file(&kept, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"still here");
        assert_eq!(fs.list_files().count(), 1);
    }

    #[test]
    fn test_gc_reopens_full_sector() {
        let mut fs = fresh();
        let mut files = alloc::vec::Vec::new();
        for _ in 0..149 {
            files.push(create(&mut fs, "f"));
        }
        assert_eq!(fs.device_mut().as_bytes()[0xFFF], VACANCY_FULL);
        fs.delete_file(&files[10]).unwrap();

        fs.run_gc().unwrap();
        assert_eq!(fs.device_mut().as_bytes()[0xFFF], VACANCY_OPEN);
        let reused = create(&mut fs, "g");
        assert_eq!(reused.slot(), Some(0x200));
    }

    #[test]
    fn test_gc_protects_slot() {
        let mut fs = fresh();
        let file = create(&mut fs, "busy");
        let address = file.slot().unwrap();
        let report = fs.collect(Some(address)).unwrap();
        assert_eq!(report.slots_reclaimed, 0);
        assert!(fs.read_slot(address).unwrap().is_allocated());
    }

    #[test]
    fn test_gc_metadata_sector_survives() {
        let mut fs = fresh();
        let mut files = alloc::vec::Vec::new();
        for _ in 0..160 {
            files.push(create(&mut fs, "m"));
        }
        let mut last = files.pop().unwrap();
        fs.write_file(&mut last, b"x").unwrap();
        fs.delete_file(&last).unwrap();
        let report = fs.run_gc().unwrap();
        // never-written slots are garbage too
        assert_eq!(report.sectors_rewritten, 2);
        assert_eq!(report.slots_reclaimed, 160);
        assert!(fs.is_formatted().unwrap());
        assert!(fs.is_sector_free(4).unwrap());
    }
}
