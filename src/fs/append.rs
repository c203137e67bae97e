use log::{debug, info, warn};

use super::layout::File;
use super::{FlashFs, FsError};
use crate::cfg::fs_cfg::LINK_SIZE;
use crate::mem::ex_flash::FlashDevice;

impl<D: FlashDevice> FlashFs<D> {
    /// Add `data` to the end of `file`.
    ///
    /// Content goes to flash immediately but the new length is only kept in
    /// the handle; call [`FlashFs::append_finish`] to store it in the slot.
    /// Until then a reopened handle still sees the old length.
    ///
    /// A handle whose file has since been rewritten through another handle
    /// is stale and gets `FileUnallocated`. If the region past the stored
    /// length is no longer blank, as after an unfinished append through
    /// another handle, nothing is written and `CannotAppend` is returned.
    pub fn append_file(&mut self, file: &mut File, data: &[u8]) -> Result<(), FsError> {
        let slot = self.live_slot(file)?;
        let head = file.head().ok_or(FsError::CannotAppend)?;
        if slot.head != head {
            return Err(FsError::FileUnallocated);
        }
        if data.is_empty() {
            return Ok(());
        }

        let area = self.geometry.data_area();
        let length = file.len();
        let last_index = if length == 0 { 0 } else { (length - 1) / area };
        let used = length - last_index * area;
        let room = (area - used) as usize;
        let last = self.walk(head, last_index)?;

        let (now, overflow) = data.split_at(room.min(data.len()));
        // an unfinished append through another handle leaves this tail programmed
        let link_free = overflow.is_empty()
            || self.is_blank(self.geometry.link_addr(last), LINK_SIZE as u32)?;
        if !link_free || !self.is_blank(last + used, now.len() as u32)? {
            warn!(
                "Tail of {}.{} past length {length} already written",
                file.name(),
                file.ext()
            );
            return Err(FsError::CannotAppend);
        }

        if overflow.is_empty() {
            self.program(last + used, now)?;
        } else {
            let count = self.geometry.clusters_for(overflow.len() as u32);
            let clusters = self.allocate_chain(count, Some(file.raw_slot()))?;
            self.program(last + used, now)?;
            self.link(last, clusters[0])?;
            self.write_chain(&clusters, overflow)?;
            debug!("Append extended chain by {count} clusters");
        }

        file.grow(data.len() as u32);
        debug!(
            "Appended {} bytes to {}.{}, length now {}",
            data.len(),
            file.name(),
            file.ext(),
            file.len()
        );
        Ok(())
    }

    /// Persist the length accumulated by [`FlashFs::append_file`]
    pub fn append_finish(&mut self, file: &mut File) -> Result<(), FsError> {
        let slot = self.live_slot(file)?;
        let head = file.head().ok_or(FsError::CannotAppend)?;
        if slot.head != head {
            return Err(FsError::FileUnallocated);
        }
        self.update_content(file.raw_slot(), head, file.raw_length())?;
        info!("{}.{} length {}", file.name(), file.ext(), file.len());
        Ok(())
    }
}
