use core::error::Error;
use core::fmt::{self, Display, Formatter};

/// Failure of a single sector transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector lies past the end of the device.
    SectorOutOfBounds,
    /// The buffer is not exactly one sector long.
    BufferInvalid,
    /// The device failed to read the sector.
    ReadError,
    /// The device failed to write the sector.
    WriteError,
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockError::SectorOutOfBounds => "sector out of bounds",
            BlockError::BufferInvalid => "buffer is not one sector long",
            BlockError::ReadError => "error reading from the block device",
            BlockError::WriteError => "error writing to the block device",
        })
    }
}

impl Error for BlockError {}
