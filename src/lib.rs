// Host builds (`cargo test`) link std; firmware builds stay no_std with a
// global allocator provided by the application (esp-alloc on target).
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cfg;
pub mod fs;
pub mod mem;

pub use cfg::fs_cfg::FsConfig;
pub use fs::{
    CreationDate, DirIter, File, FileState, FlashFs, FormatMode, FsError, GcReport, Geometry,
    SharedFs, Usage,
};
pub use mem::ex_flash::{FlashDevice, FlashError, W25Q};
pub use mem::ram_flash::RamFlash;
pub use mem::storage::NorFlashDevice;
