//! Cluster chains: one cluster per data sector, `S - 4` payload bytes
//! followed by the little-endian address of the next cluster, all-ones on
//! the last one.

use alloc::vec::Vec;

use log::{debug, info, trace, warn};

use super::layout::File;
use super::{FlashFs, FsError};
use crate::cfg::fs_cfg::{LINK_SIZE, SENTINEL};
use crate::mem::ex_flash::FlashDevice;

impl<D: FlashDevice> FlashFs<D> {
    /// Replace the content of `file` with `data`.
    ///
    /// The old chain is released before the new one is allocated, so a
    /// rewrite of the same size never needs extra space. The slot is reset
    /// to empty together with that release; if the new allocation then
    /// fails the file is left empty rather than naming freed sectors.
    pub fn write_file(&mut self, file: &mut File, data: &[u8]) -> Result<(), FsError> {
        let slot = self.live_slot(file)?;
        let address = file.raw_slot();

        if slot.head != SENTINEL {
            self.detach_chain(address, slot.head)?;
            file.set_content(SENTINEL, SENTINEL);
        }

        let count = self.geometry.clusters_for(data.len() as u32).max(1);
        let clusters = self.allocate_chain(count, Some(address))?;
        self.write_chain(&clusters, data)?;

        let head = clusters[0];
        let length = data.len() as u32;
        self.update_content(address, head, length)?;
        file.set_content(head, length);
        info!(
            "Wrote {length} bytes to {}.{} ({count} clusters)",
            file.name(),
            file.ext()
        );
        Ok(())
    }

    /// Copy `buffer.len()` bytes starting at `offset` out of `file`.
    ///
    /// The whole range must lie inside the file. Uses the handle's length,
    /// so bytes appended but not yet finished are readable. The handle must
    /// still match its slot.
    pub fn read_file(
        &mut self,
        file: &File,
        offset: u32,
        buffer: &mut [u8],
    ) -> Result<usize, FsError> {
        let slot = self.live_slot(file)?;
        if file.head().unwrap_or(SENTINEL) != slot.head {
            return Err(FsError::FileUnallocated);
        }
        let length = file.len();
        if offset >= length || offset as u64 + buffer.len() as u64 > length as u64 {
            return Err(FsError::OutOfRange);
        }
        let head = file.head().ok_or(FsError::OutOfRange)?;

        let area = self.geometry.data_area();
        let mut cluster = self.walk(head, offset / area)?;
        let mut within = offset % area;
        let mut done = 0;
        while done < buffer.len() {
            if within == area {
                cluster = self.next_cluster(cluster)?;
                within = 0;
            }
            let take = ((area - within) as usize).min(buffer.len() - done);
            self.read(cluster + within, &mut buffer[done..done + take])?;
            done += take;
            within += take as u32;
        }
        trace!("Read {done} bytes at offset {offset} from {}.{}", file.name(), file.ext());
        Ok(done)
    }

    /// Claim `count` free data sectors and return their addresses
    pub(crate) fn allocate_chain(
        &mut self,
        count: u32,
        protect: Option<u32>,
    ) -> Result<Vec<u32>, FsError> {
        let sectors = self
            .with_gc_retry(protect, |fs| fs.find_free_sectors(count))?
            .ok_or_else(|| {
                warn!("Need {count} free sectors, not available");
                FsError::SectorSpaceExhausted
            })?;
        for &sector in &sectors {
            if !self.mark_used(sector)? {
                warn!("Sector {sector} already in use");
                return Err(FsError::BrokenChain {
                    address: self.geometry.sector_addr(sector),
                });
            }
        }
        debug!("Allocated {count} clusters from sector {:?}", sectors.first());
        Ok(sectors
            .into_iter()
            .map(|sector| self.geometry.sector_addr(sector))
            .collect())
    }

    /// Free the chain at `head` and reset the slot at `address` to empty.
    /// The slot never names sectors the bitmap already calls free.
    fn detach_chain(&mut self, address: u32, head: u32) -> Result<(), FsError> {
        let freed = self.free_chain(head)?;
        if self.geometry.sector_of(address) == 0 {
            return self.release_sectors(&freed, Some(address));
        }
        self.update_content(address, SENTINEL, SENTINEL)?;
        self.release_sectors(&freed, None)
    }

    /// Fill freshly claimed `clusters` with `data` and link them up
    pub(crate) fn write_chain(&mut self, clusters: &[u32], data: &[u8]) -> Result<(), FsError> {
        let area = self.geometry.data_area() as usize;
        for (i, &cluster) in clusters.iter().enumerate() {
            self.ensure_erased(cluster)?;
            let start = (i * area).min(data.len());
            let end = (start + area).min(data.len());
            self.program(cluster, &data[start..end])?;
            if let Some(next) = clusters.get(i + 1) {
                self.link(cluster, *next)?;
            }
        }
        Ok(())
    }

    pub(crate) fn link(&mut self, cluster: u32, next: u32) -> Result<(), FsError> {
        self.program(self.geometry.link_addr(cluster), &next.to_le_bytes())
    }

    /// Forward pointer of `cluster`, checked to be a data cluster
    pub(crate) fn next_cluster(&mut self, cluster: u32) -> Result<u32, FsError> {
        let mut link = [0u8; LINK_SIZE];
        self.read(self.geometry.link_addr(cluster), &mut link)?;
        let next = u32::from_le_bytes(link);
        if !self.geometry.is_cluster(next) {
            warn!("Cluster 0x{cluster:08X} links to 0x{next:08X}");
            return Err(FsError::BrokenChain { address: cluster });
        }
        Ok(next)
    }

    /// Cluster number `hops` along the chain starting at `head`
    pub(crate) fn walk(&mut self, head: u32, hops: u32) -> Result<u32, FsError> {
        if !self.geometry.is_cluster(head) {
            return Err(FsError::BrokenChain { address: head });
        }
        let mut cluster = head;
        for _ in 0..hops {
            cluster = self.next_cluster(cluster)?;
        }
        Ok(cluster)
    }

    /// Erase every cluster of the chain at `head` and return their sector
    /// numbers. The bitmap is left to the caller. Stops early at a link
    /// that leaves the data area.
    pub(crate) fn free_chain(&mut self, head: u32) -> Result<Vec<u32>, FsError> {
        let mut freed = Vec::new();
        let mut cluster = head;
        while cluster != SENTINEL && (freed.len() as u32) < self.geometry.data_sectors() {
            if !self.geometry.is_cluster(cluster) {
                warn!("Chain from 0x{head:08X} broken at 0x{cluster:08X}");
                break;
            }
            let mut link = [0u8; LINK_SIZE];
            self.read(self.geometry.link_addr(cluster), &mut link)?;
            self.device.erase_sector(cluster)?;
            freed.push(self.geometry.sector_of(cluster));
            cluster = u32::from_le_bytes(link);
        }
        debug!("Freed {} clusters from 0x{head:08X}", freed.len());
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::fs_cfg::FsConfig;
    use crate::fs::{CreationDate, FormatMode};
    use crate::mem::ram_flash::RamFlash;
    use alloc::vec;

    fn fresh() -> FlashFs<RamFlash> {
        let flash = RamFlash::w25q32().with_strict_programming();
        let mut fs = FlashFs::new(flash, FsConfig::default()).unwrap();
        fs.format(FormatMode::Quick).unwrap();
        fs
    }

    fn created(fs: &mut FlashFs<RamFlash>, name: &str) -> File {
        let mut file = File::new(name, "bin").unwrap();
        fs.create_file(&mut file, CreationDate::new(2023, 1, 2).unwrap())
            .unwrap();
        file
    }

    #[test]
    fn test_chain_layout() {
        let mut fs = fresh();
        let mut file = created(&mut fs, "aa");
        fs.write_file(&mut file, &[0xAA; 5120]).unwrap();
        assert_eq!(file.head(), Some(0x4000));
        assert_eq!(file.len(), 5120);

        let bytes = fs.device_mut().as_bytes();
        assert!(bytes[0x4000..0x4FFC].iter().all(|&b| b == 0xAA));
        assert_eq!(&bytes[0x4FFC..0x5000], &0x5000u32.to_le_bytes());
        assert!(bytes[0x5000..0x5404].iter().all(|&b| b == 0xAA));
        assert!(bytes[0x5404..0x6000].iter().all(|&b| b == 0xFF));
        assert_eq!(bytes[0], 0xC0);
    }

    #[test]
    fn test_zero_byte_write_takes_a_cluster() {
        let mut fs = fresh();
        let mut file = created(&mut fs, "empty");
        fs.write_file(&mut file, &[]).unwrap();
        assert_eq!(file.head(), Some(0x4000));
        assert_eq!(file.len(), 0);
        assert!(!fs.is_sector_free(4).unwrap());
        let mut buf = [0u8; 1];
        assert_eq!(fs.read_file(&file, 0, &mut buf), Err(FsError::OutOfRange));
    }

    #[test]
    fn test_read_across_clusters() {
        let mut fs = fresh();
        let mut file = created(&mut fs, "seq");
        let data: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
        fs.write_file(&mut file, &data).unwrap();

        let mut buf = vec![0u8; 200];
        assert_eq!(fs.read_file(&file, 4000, &mut buf).unwrap(), 200);
        assert_eq!(&buf[..], &data[4000..4200]);

        let mut tail = vec![0u8; 9000 - 8184];
        fs.read_file(&file, 8184, &mut tail).unwrap();
        assert_eq!(&tail[..], &data[8184..]);

        let mut all = vec![0u8; 9000];
        fs.read_file(&file, 0, &mut all).unwrap();
        assert_eq!(all, data);
    }

    #[test]
    fn test_read_bounds() {
        let mut fs = fresh();
        let mut file = created(&mut fs, "b");
        fs.write_file(&mut file, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(fs.read_file(&file, 3, &mut buf), Err(FsError::OutOfRange));
        assert_eq!(fs.read_file(&file, 4, &mut buf[..0]), Err(FsError::OutOfRange));
        assert_eq!(fs.read_file(&file, 2, &mut buf), Ok(2));
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn test_broken_link_detected() {
        let mut fs = fresh();
        let mut file = created(&mut fs, "b");
        fs.write_file(&mut file, &[0x55; 5000]).unwrap();
        fs.device_mut().poke(0x4FFC, &0x1000u32.to_le_bytes());
        let mut buf = [0u8; 10];
        assert_eq!(
            fs.read_file(&file, 4990, &mut buf),
            Err(FsError::BrokenChain { address: 0x4000 })
        );
        assert_eq!(fs.free_chain(0x4000).unwrap(), vec![4]);
    }

    #[test]
    fn test_overwrite_releases_old_chain() {
        let mut fs = fresh();
        let mut file = created(&mut fs, "ow");
        fs.write_file(&mut file, &[1; 9000]).unwrap();
        assert_eq!(fs.usage().unwrap().free_sectors, 1017);

        fs.write_file(&mut file, &[2; 100]).unwrap();
        assert_eq!(file.head(), Some(0x4000));
        assert_eq!(file.len(), 100);
        assert_eq!(fs.usage().unwrap().free_sectors, 1019);

        let reopened = fs.open_file("ow", "bin").unwrap();
        assert_eq!(reopened.len(), 100);
        let mut buf = [0u8; 100];
        fs.read_file(&reopened, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[test]
    fn test_write_to_uncreated_file() {
        let mut fs = fresh();
        let mut file = File::new("nope", "").unwrap();
        assert_eq!(fs.write_file(&mut file, &[1]), Err(FsError::FileUnallocated));
    }
}
