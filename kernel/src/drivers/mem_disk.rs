use crate::block::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::vec;
use alloc::vec::Vec;

/// A block device driver backed by kernel memory. Serves as a RAM disk, e.g. a swap area
/// when no spare disk partition exists.
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sector_count * BLOCK_SECTOR_SIZE]),
        }
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.lock().len() / BLOCK_SECTOR_SIZE
    }

    fn byte_range(&self, sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for MemDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let sectors = self.sectors.lock();
        let src = sectors
            .get(self.byte_range(sector))
            .ok_or(BlockError::SectorOutOfBounds)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.byte_range(sector);
        let mut sectors = self.sectors.lock();
        let dst = sectors
            .get_mut(range)
            .ok_or(BlockError::SectorOutOfBounds)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}
