use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Error type for backing-file operations
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// The file system failed to read the file
    ReadError,
    /// The file system failed to write the file
    WriteError,
    /// Fewer bytes were written than requested (e.g. the file is deny-write)
    ShortWrite,
}

impl Debug for FileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            FileError::ReadError => write!(f, "ReadError"),
            FileError::WriteError => write!(f, "WriteError"),
            FileError::ShortWrite => write!(f, "ShortWrite"),
        }
    }
}

impl Display for FileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            FileError::ReadError => write!(f, "Error reading from the backing file"),
            FileError::WriteError => write!(f, "Error writing to the backing file"),
            FileError::ShortWrite => write!(f, "Backing file accepted fewer bytes than written"),
        }
    }
}

impl Error for FileError {}

/// An open file that pages can be loaded from and written back to.
///
/// Offsets are absolute; implementations must not move any shared file position.
pub trait BackingFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many were read.
    /// Reading past the end of the file is not an error; it returns fewer bytes.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError>;

    /// Writes `buf` at `offset`, returning how many bytes were written.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FileError>;
}
