use crate::sync::Mutex;
use alloc::{boxed::Box, collections::BTreeMap};
use kidneyos_shared::{
    mem::{is_user_address, page_offset, PAGE_FRAME_SIZE},
    paging::{PageDirectory, PageDirectoryEntry, PageTable, PageTableEntry, VirtualAddress},
};

/// The hardware page-table primitives the virtual memory subsystem drives, for one address
/// space. All addresses are user virtual addresses; `vaddr` need not be page aligned.
pub trait AddressSpace: Send + Sync {
    /// Maps the page containing `vaddr` to the frame at physical address `frame_base`.
    /// Returns `false` if page-table memory could not be allocated or `vaddr` is not a user
    /// address.
    #[must_use]
    fn install(&self, vaddr: usize, frame_base: usize, writable: bool) -> bool;

    /// Removes the mapping for the page containing `vaddr`, if any. Later accesses fault.
    fn clear(&self, vaddr: usize);

    /// Physical address of the frame mapped at `vaddr`.
    fn translate(&self, vaddr: usize) -> Option<usize>;

    fn is_dirty(&self, vaddr: usize) -> bool;
    fn set_dirty(&self, vaddr: usize, dirty: bool);

    fn is_accessed(&self, vaddr: usize) -> bool;
    fn set_accessed(&self, vaddr: usize, accessed: bool);
}

/// Why an emulated access through [`PageManager::touch`] faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    NotPresent,
    ReadOnly,
}

struct Tables {
    directory: Box<PageDirectory>,
    tables: BTreeMap<usize, Box<PageTable>>,
}

/// A two-level x86 page directory for one user address space.
///
/// Page tables are created on first use and freed once their last mapping is cleared.
pub struct PageManager {
    inner: Mutex<Tables>,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables {
                directory: Box::default(),
                tables: BTreeMap::new(),
            }),
        }
    }

    fn indices(vaddr: usize) -> (usize, usize) {
        let addr = VirtualAddress::from(vaddr);
        (
            usize::from(addr.page_directory_index().value()),
            usize::from(addr.page_table_index().value()),
        )
    }

    fn with_entry<R>(&self, vaddr: usize, f: impl FnOnce(&mut PageTableEntry) -> R) -> Option<R> {
        if !is_user_address(vaddr) {
            return None;
        }
        let (pd_index, pt_index) = Self::indices(vaddr);
        let mut inner = self.inner.lock();
        if !inner.directory[pd_index].present() {
            return None;
        }
        let entry = &mut inner.tables.get_mut(&pd_index)?[pt_index];
        entry.present().then(|| f(entry))
    }

    /// Emulates the MMU performing an access at `vaddr`: sets the accessed bit (and the dirty
    /// bit for writes) and returns the physical address, or reports the fault the CPU would
    /// raise.
    pub fn touch(&self, vaddr: usize, write: bool) -> Result<usize, AccessFault> {
        self.with_entry(vaddr, |entry| {
            if write && !entry.read_write() {
                return Err(AccessFault::ReadOnly);
            }
            *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
            Ok(entry.frame_base() + page_offset(vaddr))
        })
        .unwrap_or(Err(AccessFault::NotPresent))
    }

    /// Number of pages currently mapped.
    pub fn mapped_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .tables
            .values()
            .map(|table| table.iter().filter(|entry| entry.present()).count())
            .sum()
    }

    pub fn is_writable(&self, vaddr: usize) -> Option<bool> {
        self.with_entry(vaddr, |entry| entry.read_write())
    }
}

impl AddressSpace for PageManager {
    fn install(&self, vaddr: usize, frame_base: usize, writable: bool) -> bool {
        if !is_user_address(vaddr) || frame_base % PAGE_FRAME_SIZE != 0 {
            return false;
        }
        let (pd_index, pt_index) = Self::indices(vaddr);
        let mut inner = self.inner.lock();
        inner.directory[pd_index] = PageDirectoryEntry::DEFAULT
            .with_present(true)
            .with_read_write(true)
            .with_user_supervisor(true);
        let table = inner.tables.entry(pd_index).or_default();
        table[pt_index] = PageTableEntry::user_page(frame_base, writable);
        true
    }

    fn clear(&self, vaddr: usize) {
        if !is_user_address(vaddr) {
            return;
        }
        let (pd_index, pt_index) = Self::indices(vaddr);
        let mut inner = self.inner.lock();
        let Some(table) = inner.tables.get_mut(&pd_index) else {
            return;
        };
        table[pt_index] = PageTableEntry::DEFAULT;
        if table.is_empty() {
            inner.tables.remove(&pd_index);
            inner.directory[pd_index] = PageDirectoryEntry::DEFAULT;
        }
    }

    fn translate(&self, vaddr: usize) -> Option<usize> {
        self.with_entry(vaddr, |entry| entry.frame_base() + page_offset(vaddr))
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.with_entry(vaddr, |entry| entry.dirty()).unwrap_or(false)
    }

    fn set_dirty(&self, vaddr: usize, dirty: bool) {
        self.with_entry(vaddr, |entry| *entry = entry.with_dirty(dirty));
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.with_entry(vaddr, |entry| entry.accessed()).unwrap_or(false)
    }

    fn set_accessed(&self, vaddr: usize, accessed: bool) {
        self.with_entry(vaddr, |entry| *entry = entry.with_accessed(accessed));
    }
}
