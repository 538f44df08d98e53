use crate::block::BlockError;
use crate::fs::FileError;
use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Broad classes of failure. The first three reach the fault boundary and are per-process:
/// the caller terminates the faulting process, never the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    /// No frame could be found after the bounded retries, the swap device is full, or the page
    /// tables had no room for a mapping.
    ResourceExhausted,
    /// The address is not part of the process's address space, or the access is not allowed.
    InvalidAccess,
    /// A file or block device failed while loading or writing back a page.
    IoFailure,
    /// A registration overlaps a page that already exists. Returned to the loader, not raised
    /// by faults.
    Conflict,
    /// The page moved while it was being pinned. [`pin`](super::pin) retries on it and never
    /// returns it.
    Stale,
}

/// Error type for virtual memory operations
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Every frame stayed pinned or recently used across all allocation attempts
    OutOfFrames,
    /// No free slot is left on the swap device
    SwapFull,
    /// The address is unregistered and not a plausible stack access
    InvalidAddress(usize),
    /// A write to a page registered read-only
    ReadOnly(usize),
    /// A page is already registered at this address
    AlreadyRegistered(usize),
    /// The page lost its frame before the frame could be locked
    NotResident,
    /// The hardware page table refused the mapping, for lack of page-table memory
    InstallFailed(usize),
    /// The swap device failed
    Block(BlockError),
    /// The backing file failed
    File(FileError),
}

impl VmError {
    pub fn kind(&self) -> VmErrorKind {
        match self {
            VmError::OutOfFrames | VmError::SwapFull | VmError::InstallFailed(_) => {
                VmErrorKind::ResourceExhausted
            }
            VmError::InvalidAddress(_) | VmError::ReadOnly(_) => VmErrorKind::InvalidAccess,
            VmError::Block(_) | VmError::File(_) => VmErrorKind::IoFailure,
            VmError::AlreadyRegistered(_) => VmErrorKind::Conflict,
            VmError::NotResident => VmErrorKind::Stale,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(error: BlockError) -> Self {
        VmError::Block(error)
    }
}

impl From<FileError> for VmError {
    fn from(error: FileError) -> Self {
        VmError::File(error)
    }
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "OutOfFrames"),
            VmError::SwapFull => write!(f, "SwapFull"),
            VmError::InvalidAddress(addr) => write!(f, "InvalidAddress({addr:#x})"),
            VmError::ReadOnly(addr) => write!(f, "ReadOnly({addr:#x})"),
            VmError::AlreadyRegistered(addr) => write!(f, "AlreadyRegistered({addr:#x})"),
            VmError::NotResident => write!(f, "NotResident"),
            VmError::InstallFailed(addr) => write!(f, "InstallFailed({addr:#x})"),
            VmError::Block(error) => write!(f, "Block({error:?})"),
            VmError::File(error) => write!(f, "File({error:?})"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "no frame could be freed"),
            VmError::SwapFull => write!(f, "swap device is full"),
            VmError::InvalidAddress(addr) => write!(f, "invalid user address {addr:#x}"),
            VmError::ReadOnly(addr) => write!(f, "write to read-only page at {addr:#x}"),
            VmError::AlreadyRegistered(addr) => {
                write!(f, "page at {addr:#x} is already registered")
            }
            VmError::NotResident => write!(f, "page is no longer resident"),
            VmError::InstallFailed(addr) => write!(f, "could not map page at {addr:#x}"),
            VmError::Block(error) => write!(f, "swap I/O failed: {error}"),
            VmError::File(error) => write!(f, "file I/O failed: {error}"),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VmError::Block(error) => Some(error),
            VmError::File(error) => Some(error),
            _ => None,
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;
