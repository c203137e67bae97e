use core::fmt;

use crate::mem::ex_flash::FlashError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Device layer failure
    Flash(FlashError),
    /// Directory full even after garbage collection
    SlotSpaceExhausted,
    /// Not enough free data sectors even after garbage collection
    SectorSpaceExhausted,
    /// Handle has no directory slot, or its slot was reclaimed
    FileUnallocated,
    /// Append on a file that was never written, or whose tail is already
    /// programmed by an unfinished append
    CannotAppend,
    NotFound,
    /// Read past the end of the file
    OutOfRange,
    NameTooLong,
    InvalidName,
    InvalidDate,
    /// Device/config combination the layout cannot describe
    InvalidGeometry,
    /// Metadata sectors are not marked used in the allocation bitmap
    NotFormatted,
    /// A forward pointer leads outside the data area
    BrokenChain { address: u32 },
}

impl From<FlashError> for FsError {
    fn from(err: FlashError) -> Self {
        FsError::Flash(err)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash(e) => write!(f, "Flash error: {e}"),
            Self::SlotSpaceExhausted => write!(f, "No free directory slot"),
            Self::SectorSpaceExhausted => write!(f, "No free data sectors"),
            Self::FileUnallocated => write!(f, "File has no directory slot"),
            Self::CannotAppend => write!(f, "File cannot be appended to"),
            Self::NotFound => write!(f, "File not found"),
            Self::OutOfRange => write!(f, "Read beyond end of file"),
            Self::NameTooLong => write!(f, "Name too long"),
            Self::InvalidName => write!(f, "Invalid name"),
            Self::InvalidDate => write!(f, "Invalid creation date"),
            Self::InvalidGeometry => write!(f, "Unsupported flash geometry"),
            Self::NotFormatted => write!(f, "Flash not formatted"),
            Self::BrokenChain { address } => {
                write!(f, "Broken cluster chain at 0x{address:08X}")
            }
        }
    }
}
