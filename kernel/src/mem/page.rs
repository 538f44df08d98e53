//! Per-process table of user pages and where each page's contents currently live.

use super::error::{VmError, VmResult};
use super::frame_table::{FrameGuard, FrameId, FrameOwner, FrameTable};
use super::swap::{SwapSlot, SwapStore};
use crate::fs::{BackingFile, FileError};
use crate::paging::AddressSpace;
use crate::sync::{Mutex, MutexGuard};
use alloc::{
    boxed::Box,
    collections::{btree_map::Entry, BTreeMap},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::{
    is_user_address, page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE,
};
use log::{debug, info, trace, warn};

/// The file region a page is loaded from.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    /// Byte offset of the page's first byte within the file.
    pub offset: u64,
    /// Bytes to read from the file; the rest of the page is zero.
    pub read_length: usize,
    /// Write dirty contents back to the file instead of swapping them (shared mappings).
    pub writeback: bool,
}

impl FileBacking {
    fn write_back(&self, contents: &[u8]) -> VmResult<()> {
        let written = self
            .file
            .write_at(&contents[..self.read_length], self.offset)?;
        if written != self.read_length {
            return Err(FileError::ShortWrite.into());
        }
        Ok(())
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_length", &self.read_length)
            .field("writeback", &self.writeback)
            .finish_non_exhaustive()
    }
}

/// Where the contents of a page live.
#[derive(Clone, Debug)]
pub enum PageSource {
    /// In memory, in the given frame.
    Resident(FrameId),
    /// In a file; bytes past the read length are zero.
    FileBacked(FileBacking),
    /// In a slot on the swap device.
    Swapped(SwapSlot),
    /// Nowhere yet: the page reads as zeros.
    ZeroFill,
}

pub struct PageState {
    source: PageSource,
    /// The file this page came from, kept while the page is resident or swapped.
    origin: Option<FileBacking>,
    writable: bool,
    /// Contents differ from the origin file (or have no origin at all).
    dirty: bool,
    /// Deregistered; a fault that looked the page up earlier must not bring it back.
    removed: bool,
}

impl PageState {
    pub fn source(&self) -> &PageSource {
        &self.source
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn frame(&self) -> Option<FrameId> {
        match self.source {
            PageSource::Resident(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

/// One page of a process's address space.
pub struct Page {
    addr: usize,
    state: Mutex<PageState>,
}

impl Page {
    /// Page-aligned user address of the page.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Identity handed to the frame table; equal to the frame owner's id.
    pub fn id(&self) -> usize {
        self as *const Self as usize
    }

    pub fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    pub fn is_resident(&self) -> bool {
        self.state.lock().frame().is_some()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("addr", &format_args!("{:#x}", self.addr))
            .finish_non_exhaustive()
    }
}

/// Back-reference from a frame to the page occupying it.
struct PageOwner {
    registry: Weak<PageRegistry>,
    page: Weak<Page>,
    addr: usize,
}

impl FrameOwner for PageOwner {
    fn id(&self) -> usize {
        self.page.as_ptr() as usize
    }

    fn recently_accessed(&self) -> bool {
        let (Some(registry), Some(page)) = (self.registry.upgrade(), self.page.upgrade()) else {
            return false;
        };
        let address_space = &registry.address_space;
        let accessed = address_space.is_accessed(page.addr);
        if accessed {
            address_space.set_accessed(page.addr, false);
        }
        accessed
    }

    fn page_out(&self, frame: FrameId, contents: &[u8]) -> VmResult<bool> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(true);
        };
        let Some(page) = self.page.upgrade() else {
            // The page went away without releasing the frame; the mapping must not outlive it.
            let address_space = &registry.address_space;
            if address_space.translate(self.addr) == Some(registry.frames.frame_base(frame)) {
                address_space.clear(self.addr);
            }
            return Ok(true);
        };
        // Lock order is page then frame; the frame is already held, so never wait here.
        let Some(mut state) = page.state.try_lock() else {
            return Ok(false);
        };
        registry.evict(&page, &mut state, frame, contents)?;
        Ok(true)
    }
}

/// All pages registered for one process, keyed by page address.
///
/// Every page has its own lock, which is held across a whole fault. The map lock only guards
/// insertion, removal and lookup and is never held while taking a page lock.
pub struct PageRegistry {
    me: Weak<PageRegistry>,
    pages: Mutex<BTreeMap<usize, Arc<Page>>>,
    address_space: Arc<dyn AddressSpace>,
    frames: Arc<FrameTable>,
    swap: Arc<SwapStore>,
    stack_pointer: AtomicUsize,
    max_stack_size: usize,
    stack_slop: usize,
}

impl PageRegistry {
    pub fn new(
        address_space: Arc<dyn AddressSpace>,
        frames: Arc<FrameTable>,
        swap: Arc<SwapStore>,
        max_stack_size: usize,
        stack_slop: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pages: Mutex::new(BTreeMap::new()),
            address_space,
            frames,
            swap,
            stack_pointer: AtomicUsize::new(OFFSET),
            max_stack_size,
            stack_slop,
        })
    }

    pub fn address_space(&self) -> &dyn AddressSpace {
        &*self.address_space
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Records the user stack pointer at the most recent entry into the kernel.
    pub fn set_stack_pointer(&self, esp: usize) {
        self.stack_pointer.store(esp, Ordering::Relaxed);
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Adds a non-resident page at the page-aligned user address `addr`.
    pub fn register(&self, addr: usize, source: PageSource, writable: bool) -> VmResult<Arc<Page>> {
        if !is_user_address(addr) || page_offset(addr) != 0 {
            return Err(VmError::InvalidAddress(addr));
        }
        let origin = match &source {
            PageSource::Resident(_) => panic!("page at {addr:#x} registered as resident"),
            PageSource::FileBacked(backing) if backing.read_length > PAGE_FRAME_SIZE => {
                return Err(VmError::InvalidAddress(addr));
            }
            PageSource::FileBacked(backing) => Some(backing.clone()),
            PageSource::Swapped(_) | PageSource::ZeroFill => None,
        };
        let page = Arc::new(Page {
            addr,
            state: Mutex::new(PageState {
                source,
                origin,
                writable,
                dirty: false,
                removed: false,
            }),
        });

        match self.pages.lock().entry(addr) {
            Entry::Occupied(_) => Err(VmError::AlreadyRegistered(addr)),
            Entry::Vacant(entry) => {
                trace!("Registered page {addr:#x}");
                Ok(entry.insert(page).clone())
            }
        }
    }

    /// The registered page containing `addr`, if any.
    pub fn get(&self, addr: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&page_round_down(addr)).cloned()
    }

    /// The page containing `addr`, registering a zero-filled stack page if `addr` is an
    /// unregistered address the stack may plausibly grow into.
    pub fn lookup(&self, addr: usize) -> Option<Arc<Page>> {
        if !is_user_address(addr) {
            return None;
        }
        if let Some(page) = self.get(addr) {
            return Some(page);
        }
        if !self.is_stack_access(addr) {
            return None;
        }

        let page_addr = page_round_down(addr);
        match self.register(page_addr, PageSource::ZeroFill, true) {
            Ok(page) => {
                debug!("Grew stack to {page_addr:#x}");
                Some(page)
            }
            // Another thread grew the stack first.
            Err(VmError::AlreadyRegistered(_)) => self.get(addr),
            Err(_) => None,
        }
    }

    /// Within the stack region and no more than `stack_slop` bytes below the stack pointer,
    /// which covers PUSH and PUSHA faulting before they move it.
    fn is_stack_access(&self, addr: usize) -> bool {
        addr >= OFFSET - self.max_stack_size
            && addr.saturating_add(self.stack_slop) >= self.stack_pointer()
    }

    pub(super) fn owner_for(&self, page: &Arc<Page>) -> Box<dyn FrameOwner> {
        Box::new(PageOwner {
            registry: self.me.clone(),
            page: Arc::downgrade(page),
            addr: page.addr,
        })
    }

    /// Fills `frame` with the page's contents and marks the page resident in it.
    ///
    /// On failure the page is left as it was and the caller still owns `frame`.
    pub fn materialize(
        &self,
        page: &Page,
        state: &mut PageState,
        frame: &mut FrameGuard<'_>,
    ) -> VmResult<()> {
        let contents = frame.contents_mut();
        match &state.source {
            PageSource::Resident(_) => return Ok(()),
            PageSource::FileBacked(backing) => {
                let read = backing
                    .file
                    .read_at(&mut contents[..backing.read_length], backing.offset)?;
                if read < backing.read_length {
                    debug!(
                        "Short read for page {:#x}: {read} of {} bytes",
                        page.addr, backing.read_length
                    );
                }
                contents[read..].fill(0);
            }
            PageSource::Swapped(slot) => {
                self.swap.swap_in(*slot, contents)?;
                // The swap copy is gone, so the frame holds the only copy.
                state.dirty = true;
            }
            PageSource::ZeroFill => contents.fill(0),
        }

        trace!("Page {:#x} now in frame {}", page.addr, frame.index());
        state.source = PageSource::Resident(frame.index());
        Ok(())
    }

    /// Moves a resident page out of `frame`, whose contents are `contents`.
    ///
    /// Both the page and the frame are locked by the caller. The mapping is removed first so
    /// no write can slip in behind the copy; it is put back if the page cannot be moved.
    pub fn evict(
        &self,
        page: &Page,
        state: &mut PageState,
        frame: FrameId,
        contents: &[u8],
    ) -> VmResult<()> {
        if state.frame() != Some(frame) {
            // Already moved out; the frame only kept a stale owner.
            return Ok(());
        }

        let hw_dirty = self.address_space.is_dirty(page.addr);
        self.address_space.clear(page.addr);
        let dirty = state.dirty || hw_dirty;

        let moved = match &state.origin {
            Some(backing) if backing.writeback => {
                let written = if dirty {
                    backing.write_back(contents)
                } else {
                    Ok(())
                };
                written.map(|()| (PageSource::FileBacked(backing.clone()), false))
            }
            Some(backing) if !dirty => Ok((PageSource::FileBacked(backing.clone()), false)),
            None if !dirty => Ok((PageSource::ZeroFill, false)),
            _ => self
                .swap
                .swap_out(contents)
                .map(|slot| (PageSource::Swapped(slot), true)),
        };

        match moved {
            Ok((source, dirty)) => {
                debug!("Paged out {:#x} to {source:?}", page.addr);
                state.source = source;
                state.dirty = dirty;
                Ok(())
            }
            Err(error) => {
                self.remap(page.addr, frame, state.writable, hw_dirty);
                Err(error)
            }
        }
    }

    fn remap(&self, addr: usize, frame: FrameId, writable: bool, dirty: bool) {
        if !self
            .address_space
            .install(addr, self.frames.frame_base(frame), writable)
        {
            warn!("Could not restore mapping for {addr:#x}");
            return;
        }
        if dirty {
            self.address_space.set_dirty(addr, true);
        }
    }

    /// Removes the page at `addr`, freeing its frame or swap slot. Dirty shared file pages
    /// are written back first.
    pub fn deregister(&self, addr: usize) -> VmResult<()> {
        let page = self
            .pages
            .lock()
            .remove(&page_round_down(addr))
            .ok_or(VmError::InvalidAddress(addr))?;
        self.discard(&page)
    }

    fn discard(&self, page: &Page) -> VmResult<()> {
        let mut state = page.state.lock();
        let result = match state.source {
            PageSource::Resident(frame) => match self.frames.lock(frame, page.id()) {
                Ok(guard) => {
                    let hw_dirty = self.address_space.is_dirty(page.addr);
                    self.address_space.clear(page.addr);
                    let result = match &state.origin {
                        Some(backing) if backing.writeback && (state.dirty || hw_dirty) => {
                            backing.write_back(guard.contents())
                        }
                        _ => Ok(()),
                    };
                    self.frames.release(guard);
                    result
                }
                // The frame was taken without the page lock; that cannot happen.
                Err(error) => Err(error),
            },
            PageSource::Swapped(slot) => {
                self.swap.free(slot);
                Ok(())
            }
            PageSource::FileBacked(_) | PageSource::ZeroFill => Ok(()),
        };
        state.source = PageSource::ZeroFill;
        state.removed = true;

        if let Err(error) = &result {
            warn!("Dropping page {:#x}: {error}", page.addr);
        }
        result
    }

    /// Removes every page, as when the process exits. Failures are logged and do not stop
    /// the teardown.
    pub fn teardown(&self) {
        let pages: Vec<_> = core::mem::take(&mut *self.pages.lock())
            .into_values()
            .collect();
        let count = pages.len();
        for page in pages {
            let _ = self.discard(&page);
        }
        info!("Released {count} pages");
    }
}
