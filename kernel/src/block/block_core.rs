use super::block_error::BlockError;
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kidneyos_shared::sizes::SECTOR_SIZE;
use log::info;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Roles a block device can play.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers.
///
/// Drivers only ever see buffers of exactly `BLOCK_SECTOR_SIZE` bytes and in-range sectors;
/// [`Block`] checks both before calling in.
pub trait BlockOp: Send + Sync {
    /// Read a block sector
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
pub struct Block {
    /// Tha name of the block device
    block_name: String,

    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,

    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: AtomicU32,
    /// The write count
    write_count: AtomicU32,
}

impl Block {
    pub fn new(
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        Block {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        // Never scribble over another operating system's data.
        if self.block_type == BlockType::Foreign {
            return Err(BlockError::WriteError);
        }

        self.driver.write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

/// Maintain a list of blocks
#[derive(Default)]
pub struct BlockManager {
    /// All the block devices, in registration order
    all_blocks: Vec<Arc<Block>>,
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block device with the given `name`. The block device's `size` in sectors and its
    /// `block_type` must be provided, as well as the `driver` to access the block.
    ///
    /// Returns the registered device.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Arc<Block> {
        let block = Arc::new(Block::new(block_type, block_name, block_size, driver));
        self.all_blocks.push(block.clone());

        info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size,
        );

        block
    }

    /// Get the first block device registered for `block_type`.
    pub fn by_type(&self, block_type: BlockType) -> Option<Arc<Block>> {
        self.all_blocks
            .iter()
            .find(|b| b.block_type == block_type)
            .cloned()
    }
}
