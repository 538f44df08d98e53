//! Demand paging for user address spaces.
//!
//! [`VmSystem`] owns the resources shared by every process: the [`FrameTable`] of user frames
//! and the [`SwapStore`]. Each process gets a [`PageRegistry`] describing its pages; faults and
//! system-call copies go through [`pin`], which brings a page in on demand and evicts another
//! page with a second-chance clock when frames run out.

pub mod error;
pub mod fault;
pub mod frame_table;
pub mod page;
pub mod swap;
pub mod user;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{VmError, VmErrorKind, VmResult};
pub use fault::{handle_page_fault, pin, resolve_fault, PageFaultErrorCode, PinnedPage};
pub use frame_table::{FrameGuard, FrameId, FrameOwner, FrameTable};
pub use page::{FileBacking, Page, PageRegistry, PageSource, PageState};
pub use swap::{SwapSlot, SwapStore};

use crate::block::{Block, BlockManager, BlockType};
use crate::paging::AddressSpace;
use crate::timer::Timer;
use alloc::sync::Arc;
use core::time::Duration;
use kidneyos_shared::mem::{MAX_STACK_SIZE, STACK_SLOP};
use log::info;

/// Tunables of the memory subsystem.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Sweeps over the frame table before an allocation gives up.
    pub frame_alloc_attempts: usize,
    /// Pause between two sweeps.
    pub frame_retry_delay: Duration,
    /// Largest size the user stack may grow to, measured down from the top of user memory.
    pub max_stack_size: usize,
    /// How far below the stack pointer an access may land and still grow the stack.
    pub stack_slop: usize,
    /// Physical address of the first user frame.
    pub phys_base: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frame_alloc_attempts: 3,
            frame_retry_delay: Duration::from_millis(1000),
            max_stack_size: MAX_STACK_SIZE,
            stack_slop: STACK_SLOP,
            phys_base: 0x0010_0000,
        }
    }
}

/// The frames and swap space shared by all user processes.
pub struct VmSystem {
    frames: Arc<FrameTable>,
    swap: Arc<SwapStore>,
    config: VmConfig,
}

impl VmSystem {
    /// Sets up `frame_count` user frames, swapping to `swap_device`.
    pub fn new(
        config: VmConfig,
        frame_count: usize,
        swap_device: Arc<Block>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        Self::with_swap(
            config,
            frame_count,
            Arc::new(SwapStore::new(swap_device)),
            timer,
        )
    }

    /// Like [`VmSystem::new`], swapping to the first device registered in the swap role.
    /// Returns `None` if there is no such device.
    pub fn from_block_manager(
        config: VmConfig,
        frame_count: usize,
        blocks: &BlockManager,
        timer: Arc<dyn Timer>,
    ) -> Option<Self> {
        let swap_device = blocks.by_type(BlockType::Swap)?;
        Some(Self::new(config, frame_count, swap_device, timer))
    }

    pub fn with_swap(
        config: VmConfig,
        frame_count: usize,
        swap: Arc<SwapStore>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        let frames = Arc::new(FrameTable::new(
            frame_count,
            config.phys_base,
            config.frame_alloc_attempts,
            config.frame_retry_delay,
            timer,
        ));
        info!(
            "Virtual memory ready: {} frames, {} swap slots",
            frames.len(),
            swap.capacity()
        );
        Self {
            frames,
            swap,
            config,
        }
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn swap(&self) -> &Arc<SwapStore> {
        &self.swap
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// An empty page registry for a new process whose page tables are `address_space`.
    pub fn new_address_space(&self, address_space: Arc<dyn AddressSpace>) -> Arc<PageRegistry> {
        PageRegistry::new(
            address_space,
            self.frames.clone(),
            self.swap.clone(),
            self.config.max_stack_size,
            self.config.stack_slop,
        )
    }
}
