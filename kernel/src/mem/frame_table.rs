//! The global table of user page frames and the clock sweep that reclaims them.

use super::error::{VmError, VmResult};
use crate::sync::{Mutex, MutexGuard};
use crate::timer::Timer;
use alloc::{boxed::Box, sync::Arc, vec};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, info, trace, warn};

/// Index of a frame in the [`FrameTable`].
pub type FrameId = usize;

/// The page currently occupying a frame, as seen from the frame table.
///
/// The table never holds a strong reference to a page: the owner is a back-reference which
/// can only be followed while the page still exists.
pub trait FrameOwner: Send + Sync {
    /// Identity of the owning page, stable for the page's whole lifetime.
    fn id(&self) -> usize;

    /// Tests and clears the accessed bit of the owning page's mapping.
    fn recently_accessed(&self) -> bool;

    /// Moves the owning page's contents out of the frame so the frame can be given away.
    ///
    /// Called with the frame locked. Returns `Ok(false)` if the page is busy and the frame
    /// must be skipped. An owner whose page no longer exists returns `Ok(true)`.
    fn page_out(&self, frame: FrameId, contents: &[u8]) -> VmResult<bool>;
}

struct FrameSlot {
    owner: Option<Box<dyn FrameOwner>>,
    contents: Box<[u8]>,
}

struct Frame {
    base: usize,
    slot: Mutex<FrameSlot>,
}

/// Exclusive access to one frame: holding it pins the frame.
///
/// Dropping the guard unlocks the frame but keeps it assigned to its owner. Use
/// [`FrameTable::release`] to give the frame back to the free pool.
pub struct FrameGuard<'a> {
    index: FrameId,
    base: usize,
    slot: MutexGuard<'a, FrameSlot>,
}

impl FrameGuard<'_> {
    pub fn index(&self) -> FrameId {
        self.index
    }

    /// Physical address of the first byte of the frame.
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn contents(&self) -> &[u8] {
        &self.slot.contents
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.slot.contents
    }

    pub fn owner_id(&self) -> Option<usize> {
        self.slot.owner.as_ref().map(|owner| owner.id())
    }

    /// Unpins the frame, leaving it assigned.
    pub fn unlock(self) {}
}

impl fmt::Debug for FrameGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGuard")
            .field("index", &self.index)
            .field("base", &format_args!("{:#x}", self.base))
            .field("owner", &self.owner_id())
            .finish()
    }
}

/// Every user-pageable frame in the system.
///
/// Each frame carries its own lock. Allocation and the clock hand are serialized by a
/// separate scan lock, and the sweep only ever try-locks frames and pages, so a thread that
/// holds a page and waits for its frame can never deadlock against the sweep.
pub struct FrameTable {
    frames: Box<[Frame]>,
    /// Serializes allocation; holds the clock hand.
    hand: Mutex<FrameId>,
    in_use: AtomicUsize,
    attempts: usize,
    retry_delay: Duration,
    timer: Arc<dyn Timer>,
}

impl FrameTable {
    /// Creates `frame_count` frames whose physical addresses start at `phys_base`.
    ///
    /// An allocation that finds nothing to evict is retried `attempts` times in total,
    /// sleeping `retry_delay` on `timer` between attempts.
    pub fn new(
        frame_count: usize,
        phys_base: usize,
        attempts: usize,
        retry_delay: Duration,
        timer: Arc<dyn Timer>,
    ) -> Self {
        assert_eq!(phys_base % PAGE_FRAME_SIZE, 0, "frames must be page aligned");
        assert!(attempts > 0, "at least one allocation attempt is required");

        let frames = (0..frame_count)
            .map(|index| Frame {
                base: phys_base + index * PAGE_FRAME_SIZE,
                slot: Mutex::new(FrameSlot {
                    owner: None,
                    contents: vec![0; PAGE_FRAME_SIZE].into_boxed_slice(),
                }),
            })
            .collect();

        info!(
            "Frame table: {} user frames at {:#x}..{:#x}",
            frame_count,
            phys_base,
            phys_base + frame_count * PAGE_FRAME_SIZE
        );

        Self {
            frames,
            hand: Mutex::new(0),
            in_use: AtomicUsize::new(0),
            attempts,
            retry_delay,
            timer,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames assigned to a page.
    pub fn frames_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Physical address of frame `index`.
    pub fn frame_base(&self, index: FrameId) -> usize {
        self.frames[index].base
    }

    /// Returns a locked frame now owned by `owner`, evicting another page if no frame is
    /// free. The previous contents of the frame are unspecified.
    pub fn acquire(&self, owner: Box<dyn FrameOwner>) -> VmResult<FrameGuard<'_>> {
        let mut owner = owner;
        for attempt in 1..=self.attempts {
            match self.try_acquire(owner) {
                Ok(guard) => return Ok(guard),
                Err(returned) => owner = returned,
            }
            if attempt < self.attempts {
                warn!(
                    "No frame could be freed (attempt {attempt}/{}), retrying in {:?}",
                    self.attempts, self.retry_delay
                );
                self.timer.sleep(self.retry_delay);
            }
        }

        warn!("Out of frames after {} attempts", self.attempts);
        Err(VmError::OutOfFrames)
    }

    /// One pass over the table: a free frame if there is one, otherwise a clock victim.
    /// Hands `owner` back if neither exists.
    fn try_acquire(
        &self,
        owner: Box<dyn FrameOwner>,
    ) -> Result<FrameGuard<'_>, Box<dyn FrameOwner>> {
        let mut hand = self.hand.lock();

        if let Some(mut guard) = self.find_free() {
            guard.slot.owner = Some(owner);
            self.in_use.fetch_add(1, Ordering::Relaxed);
            trace!("Assigned free frame {}", guard.index);
            return Ok(guard);
        }

        match self.find_victim(&mut *hand) {
            Some(mut guard) => {
                if guard.slot.owner.is_none() {
                    self.in_use.fetch_add(1, Ordering::Relaxed);
                }
                guard.slot.owner = Some(owner);
                Ok(guard)
            }
            None => Err(owner),
        }
    }

    fn find_free(&self) -> Option<FrameGuard<'_>> {
        (0..self.frames.len())
            .filter_map(|index| self.try_lock_index(index))
            .find(|guard| guard.slot.owner.is_none())
    }

    /// Second-chance clock sweep, bounded to two revolutions.
    ///
    /// Locked frames are pinned and skipped. A recently accessed page has its bit cleared and
    /// survives this revolution; any other page is paged out and its frame returned.
    fn find_victim(&self, hand: &mut FrameId) -> Option<FrameGuard<'_>> {
        let len = self.frames.len();
        if len == 0 {
            return None;
        }

        for _ in 0..2 * len {
            let index = *hand;
            *hand = (index + 1) % len;

            let Some(guard) = self.try_lock_index(index) else {
                continue;
            };

            let slot = &*guard.slot;
            let Some(owner) = slot.owner.as_ref() else {
                // Released since the free scan.
                return Some(guard);
            };

            if owner.recently_accessed() {
                continue;
            }

            match owner.page_out(index, &slot.contents) {
                Ok(true) => {
                    debug!("Evicted frame {index}");
                    return Some(guard);
                }
                Ok(false) => trace!("Frame {index} owner busy, skipping"),
                Err(error) => warn!("Could not evict frame {index}: {error}"),
            }
        }

        None
    }

    fn try_lock_index(&self, index: FrameId) -> Option<FrameGuard<'_>> {
        let frame = &self.frames[index];
        frame.slot.try_lock().map(|slot| FrameGuard {
            index,
            base: frame.base,
            slot,
        })
    }

    /// Locks frame `index` if it is still owned by the page identified by `owner_id`.
    ///
    /// Blocks while another thread holds the frame. Fails with [`VmError::NotResident`] if
    /// the frame was reassigned in the meantime.
    pub fn lock(&self, index: FrameId, owner_id: usize) -> VmResult<FrameGuard<'_>> {
        let frame = &self.frames[index];
        let guard = FrameGuard {
            index,
            base: frame.base,
            slot: frame.slot.lock(),
        };
        if guard.owner_id() == Some(owner_id) {
            Ok(guard)
        } else {
            Err(VmError::NotResident)
        }
    }

    /// Returns a locked frame to the free pool.
    pub fn release(&self, mut guard: FrameGuard<'_>) {
        if guard.slot.owner.take().is_some() {
            self.in_use.fetch_sub(1, Ordering::Relaxed);
        }
        trace!("Released frame {}", guard.index);
    }
}
