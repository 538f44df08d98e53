//! Page-sized slots on the swap device.

use super::error::{VmError, VmResult};
use crate::block::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::sync::Arc;
use kidneyos_shared::{bitmap::Bitmap, mem::PAGE_FRAME_SIZE};
use log::{debug, info};

/// Number of device sectors backing one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// A page-sized region of the swap device, identified by its first sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(BlockSector);

impl SwapSlot {
    pub fn first_sector(&self) -> BlockSector {
        self.0
    }

    /// Slot number, counting from the start of the device.
    pub fn index(&self) -> usize {
        self.0 as usize / SECTORS_PER_PAGE
    }

    fn sectors(&self) -> impl Iterator<Item = BlockSector> {
        // Cannot truncate: SECTORS_PER_PAGE is 8.
        #[allow(clippy::cast_possible_truncation)]
        let count = SECTORS_PER_PAGE as BlockSector;
        self.0..self.0 + count
    }
}

/// Allocates swap slots and moves pages between frames and the swap device.
///
/// The sector bitmap is the only shared state and is guarded by one lock; device I/O happens
/// outside it, so transfers to distinct slots proceed in parallel.
pub struct SwapStore {
    device: Arc<Block>,
    used_sectors: Mutex<Bitmap>,
}

impl SwapStore {
    pub fn new(device: Arc<Block>) -> Self {
        assert_eq!(
            PAGE_FRAME_SIZE % BLOCK_SECTOR_SIZE,
            0,
            "sector size must evenly divide the page size"
        );
        let sectors = device.get_size() as usize;
        info!(
            "Swap: \"{}\" holds {} pages",
            device.get_name(),
            sectors / SECTORS_PER_PAGE
        );
        Self {
            device,
            used_sectors: Mutex::new(Bitmap::new(sectors)),
        }
    }

    /// Total number of slots on the device.
    pub fn capacity(&self) -> usize {
        self.device.get_size() as usize / SECTORS_PER_PAGE
    }

    pub fn slots_in_use(&self) -> usize {
        self.used_sectors.lock().count_ones() / SECTORS_PER_PAGE
    }

    pub fn device(&self) -> &Arc<Block> {
        &self.device
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        let start = slot.first_sector() as usize;
        self.used_sectors.lock().all(start, SECTORS_PER_PAGE, true)
    }

    /// Reserves a free slot.
    pub fn allocate_slot(&self) -> VmResult<SwapSlot> {
        let start = self
            .used_sectors
            .lock()
            .scan_and_flip(0, SECTORS_PER_PAGE, false, SECTORS_PER_PAGE)
            .ok_or(VmError::SwapFull)?;
        // The bitmap has one bit per device sector, so `start` fits in a sector number.
        #[allow(clippy::cast_possible_truncation)]
        let first_sector = start as BlockSector;
        Ok(SwapSlot(first_sector))
    }

    /// Returns `slot` to the free pool without touching the device.
    pub fn free(&self, slot: SwapSlot) {
        let start = slot.first_sector() as usize;
        let mut used = self.used_sectors.lock();
        assert!(
            used.all(start, SECTORS_PER_PAGE, true),
            "freeing swap slot {} which is not in use",
            slot.index()
        );
        used.set_multiple(start, SECTORS_PER_PAGE, false);
    }

    /// Writes one page into `slot`, a sector at a time.
    pub fn write(&self, slot: SwapSlot, page: &[u8]) -> VmResult<()> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        for (sector, chunk) in slot.sectors().zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            self.device.write(sector, chunk)?;
        }
        Ok(())
    }

    /// Reads one page out of `slot`, a sector at a time. The slot stays allocated.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8]) -> VmResult<()> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        for (sector, chunk) in slot.sectors().zip(page.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
            self.device.read(sector, chunk)?;
        }
        Ok(())
    }

    /// Copies `page` into a freshly allocated slot. The slot is released again if the write
    /// fails.
    pub fn swap_out(&self, page: &[u8]) -> VmResult<SwapSlot> {
        let slot = self.allocate_slot()?;
        if let Err(error) = self.write(slot, page) {
            self.free(slot);
            return Err(error);
        }
        debug!("Swap: wrote slot {}", slot.index());
        Ok(slot)
    }

    /// Copies `slot` into `page` and frees the slot. On a read error the slot is kept so the
    /// contents are not lost.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> VmResult<()> {
        self.read(slot, page)?;
        self.free(slot);
        debug!("Swap: read back slot {}", slot.index());
        Ok(())
    }
}
