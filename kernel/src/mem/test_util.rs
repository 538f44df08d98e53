//! Fakes shared by the memory subsystem tests.

use super::swap::SECTORS_PER_PAGE;
use super::{PageRegistry, SwapStore, VmConfig, VmSystem};
use crate::block::{Block, BlockError, BlockOp, BlockSector, BlockType};
use crate::drivers::MemDisk;
use crate::fs::{BackingFile, FileError};
use crate::paging::PageManager;
use crate::sync::Mutex;
use crate::timer::Timer;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Timer that records requested sleeps instead of blocking.
#[derive(Default)]
pub struct SleepCounter {
    sleeps: AtomicUsize,
    total_ms: AtomicU64,
}

impl SleepCounter {
    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms.load(Ordering::SeqCst))
    }
}

impl Timer for SleepCounter {
    fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        #[allow(clippy::cast_possible_truncation)]
        self.total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

/// Switches that make a [`FlakyDisk`] fail.
#[derive(Default)]
pub struct DiskFaults {
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

/// A RAM disk whose reads and writes can be made to fail.
pub struct FlakyDisk {
    disk: MemDisk,
    faults: Arc<DiskFaults>,
}

impl BlockOp for FlakyDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        self.disk.read(sector, buf)
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        self.disk.write(sector, buf)
    }
}

fn swap_device(slots: usize, driver: Box<dyn BlockOp>) -> Arc<Block> {
    #[allow(clippy::cast_possible_truncation)]
    let sectors = (slots * SECTORS_PER_PAGE) as BlockSector;
    Arc::new(Block::new(BlockType::Swap, "swap0", sectors, driver))
}

pub fn swap_store(slots: usize) -> Arc<SwapStore> {
    let disk = MemDisk::new(slots * SECTORS_PER_PAGE);
    Arc::new(SwapStore::new(swap_device(slots, Box::new(disk))))
}

pub fn flaky_swap_store(slots: usize) -> (Arc<SwapStore>, Arc<DiskFaults>) {
    let faults = Arc::new(DiskFaults::default());
    let disk = FlakyDisk {
        disk: MemDisk::new(slots * SECTORS_PER_PAGE),
        faults: faults.clone(),
    };
    (
        Arc::new(SwapStore::new(swap_device(slots, Box::new(disk)))),
        faults,
    )
}

/// A file held in memory, with switchable failures and I/O counters.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Accept only this many bytes per write, to model a deny-write file.
    pub write_limit: Mutex<Option<usize>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            ..Self::default()
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FileError::ReadError);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FileError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FileError::WriteError);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let count = self.write_limit.lock().map_or(buf.len(), |limit| limit.min(buf.len()));
        let mut data = self.data.lock();
        let start = offset as usize;
        if data.len() < start + count {
            data.resize(start + count, 0);
        }
        data[start..start + count].copy_from_slice(&buf[..count]);
        Ok(count)
    }
}

/// A memory system with `frames` frames and `swap_slots` pages of swap, plus the timer it
/// sleeps on.
pub fn vm_system(frames: usize, swap_slots: usize) -> (VmSystem, Arc<SleepCounter>) {
    init_logging();
    let timer = Arc::new(SleepCounter::default());
    let swap = swap_store(swap_slots);
    let vm = VmSystem::with_swap(VmConfig::default(), frames, swap, timer.clone());
    (vm, timer)
}

/// A fresh address space on `vm`, along with its page tables.
pub fn address_space(vm: &VmSystem) -> (Arc<PageRegistry>, Arc<PageManager>) {
    let tables = Arc::new(PageManager::new());
    (vm.new_address_space(tables.clone()), tables)
}
