//! Page fault resolution and page pinning.

use super::error::{VmError, VmResult};
use super::frame_table::FrameGuard;
use super::page::{Page, PageRegistry};
use alloc::sync::Arc;
use bitbybit::bitfield;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{trace, warn};

/// The error code the CPU pushes for a page fault.
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// Set for a protection violation, clear for a non-present page.
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    write: bool,
    /// The fault was raised in user mode.
    #[bit(2, rw)]
    user: bool,
}

/// A resident, mapped page whose frame is locked, so it cannot be evicted.
///
/// Dropping it unpins the page.
pub struct PinnedPage<'a> {
    registry: &'a PageRegistry,
    page: Arc<Page>,
    frame: FrameGuard<'a>,
    writable: bool,
}

impl PinnedPage<'_> {
    pub fn addr(&self) -> usize {
        self.page.addr()
    }

    /// Physical address of the frame holding the page.
    pub fn frame_base(&self) -> usize {
        self.frame.base()
    }

    pub fn contents(&self) -> &[u8] {
        self.frame.contents()
    }

    /// Copies bytes out of the page starting at `offset`, as a user read would.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_FRAME_SIZE);
        buf.copy_from_slice(&self.frame.contents()[offset..offset + buf.len()]);
        self.registry.address_space().set_accessed(self.addr(), true);
    }

    /// Copies `data` into the page starting at `offset`, as a user write would.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> VmResult<()> {
        assert!(offset + data.len() <= PAGE_FRAME_SIZE);
        if !self.writable {
            return Err(VmError::ReadOnly(self.addr() + offset));
        }
        self.frame.contents_mut()[offset..offset + data.len()].copy_from_slice(data);
        let address_space = self.registry.address_space();
        address_space.set_accessed(self.addr(), true);
        address_space.set_dirty(self.addr(), true);
        Ok(())
    }

    pub fn unpin(self) {}
}

/// Makes the page containing `addr` resident and mapped, and keeps it that way until the
/// returned handle is dropped.
///
/// Fails if `addr` is not a registered page or a plausible stack access, if a write is
/// requested on a read-only page, or if no frame can be found.
pub fn pin(registry: &PageRegistry, addr: usize, will_write: bool) -> VmResult<PinnedPage<'_>> {
    loop {
        let page = registry
            .lookup(addr)
            .ok_or(VmError::InvalidAddress(addr))?;
        match pin_page(registry, page, will_write) {
            // Evicted or deregistered after the lookup.
            Err(VmError::NotResident) => trace!("Page {addr:#x} moved while pinning, retrying"),
            result => return result,
        }
    }
}

fn pin_page(
    registry: &PageRegistry,
    page: Arc<Page>,
    will_write: bool,
) -> VmResult<PinnedPage<'_>> {
    let mut state = page.lock();
    if state.is_removed() {
        return Err(VmError::NotResident);
    }
    if will_write && !state.writable() {
        return Err(VmError::ReadOnly(page.addr()));
    }

    let frame = match state.frame() {
        Some(frame) => registry.frames().lock(frame, page.id())?,
        None => {
            let mut frame = registry.frames().acquire(registry.owner_for(&page))?;
            if let Err(error) = registry.materialize(&page, &mut state, &mut frame) {
                registry.frames().release(frame);
                return Err(error);
            }
            frame
        }
    };

    let writable = state.writable();
    let address_space = registry.address_space();
    // Remapping an already mapped page would wipe its accessed and dirty bits.
    let mapped = address_space.translate(page.addr()) == Some(frame.base());
    if !mapped && !address_space.install(page.addr(), frame.base(), writable) {
        // Stays resident; the next fault retries the mapping.
        return Err(VmError::InstallFailed(page.addr()));
    }
    drop(state);

    Ok(PinnedPage {
        registry,
        page,
        frame,
        writable,
    })
}

/// Makes the page containing `addr` resident and mapped so the faulting access can be
/// restarted.
pub fn resolve_fault(registry: &PageRegistry, addr: usize, write: bool) -> VmResult<()> {
    pin(registry, addr, write).map(PinnedPage::unpin)
}

/// Entry point from the page fault interrupt. `esp` is the user stack pointer saved on entry
/// to the kernel. An error means the faulting process must be terminated.
pub fn handle_page_fault(
    registry: &PageRegistry,
    fault_addr: usize,
    error_code: PageFaultErrorCode,
    esp: usize,
) -> VmResult<()> {
    if error_code.user() {
        registry.set_stack_pointer(esp);
    }
    resolve_fault(registry, fault_addr, error_code.write()).inspect_err(|error| {
        warn!(
            "Unresolvable page fault at {fault_addr:#x} (error code {:#b}): {error}",
            error_code.raw_value()
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page::PageSource;
    use crate::mem::test_util::{address_space, vm_system};
    use crate::paging::{AccessFault, AddressSpace, PageManager};
    use core::sync::atomic::{AtomicBool, Ordering};
    use kidneyos_shared::mem::OFFSET;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const DATA: usize = 0x0810_0000;

    #[test]
    fn fault_maps_page_for_the_mmu() {
        let (vm, _) = vm_system(2, 2);
        let (registry, tables) = address_space(&vm);
        registry.register(DATA, PageSource::ZeroFill, true).unwrap();

        assert_eq!(tables.touch(DATA, false), Err(AccessFault::NotPresent));
        resolve_fault(&registry, DATA + 8, false).unwrap();
        let frame_base = vm.frames().frame_base(0);
        assert_eq!(tables.touch(DATA + 8, true), Ok(frame_base + 8));
        assert!(tables.is_dirty(DATA));
    }

    #[test]
    fn write_to_read_only_page_fails() {
        let (vm, _) = vm_system(1, 1);
        let (registry, tables) = address_space(&vm);
        registry.register(DATA, PageSource::ZeroFill, false).unwrap();

        assert_eq!(
            resolve_fault(&registry, DATA, true),
            Err(VmError::ReadOnly(DATA))
        );
        // A read maps it read-only; the write then faults in the MMU.
        resolve_fault(&registry, DATA, false).unwrap();
        assert_eq!(tables.touch(DATA, true), Err(AccessFault::ReadOnly));

        let mut page = pin(&registry, DATA, false).unwrap();
        assert_eq!(page.write(0, &[1]), Err(VmError::ReadOnly(DATA)));
    }

    #[test]
    fn unregistered_address_is_invalid() {
        let (vm, _) = vm_system(1, 1);
        let (registry, _) = address_space(&vm);
        assert_eq!(
            resolve_fault(&registry, DATA, false),
            Err(VmError::InvalidAddress(DATA))
        );
        assert_eq!(
            resolve_fault(&registry, OFFSET + 4, false),
            Err(VmError::InvalidAddress(OFFSET + 4))
        );
        assert_eq!(vm.frames().frames_in_use(), 0);
    }

    #[test]
    fn user_fault_grows_stack_below_esp() {
        let (vm, _) = vm_system(2, 1);
        let (registry, tables) = address_space(&vm);
        let esp = OFFSET - 3 * PAGE_FRAME_SIZE + 16;
        let push = PageFaultErrorCode::DEFAULT
            .with_write(true)
            .with_user(true);

        // PUSHA touches 32 bytes below esp before moving it.
        handle_page_fault(&registry, esp - 32, push, esp).unwrap();
        assert_eq!(registry.stack_pointer(), esp);
        assert!(tables.translate(esp - 32).is_some());

        assert_eq!(
            handle_page_fault(&registry, esp - 2 * PAGE_FRAME_SIZE, push, esp),
            Err(VmError::InvalidAddress(esp - 2 * PAGE_FRAME_SIZE))
        );
    }

    #[test]
    fn deregistered_page_is_never_faulted_back_in() {
        let (vm, _) = vm_system(1, 1);
        let (first, first_tables) = address_space(&vm);
        first.register(DATA, PageSource::ZeroFill, true).unwrap();

        // A fault that found the page just before it was deregistered.
        let page = first.get(DATA).unwrap();
        first.deregister(DATA).unwrap();
        assert!(matches!(pin_page(&first, page, true), Err(VmError::NotResident)));
        assert!(matches!(pin(&first, DATA, true), Err(VmError::InvalidAddress(DATA))));
        assert_eq!(vm.frames().frames_in_use(), 0);
        assert_eq!(first_tables.translate(DATA), None);

        let (second, _) = address_space(&vm);
        second.register(DATA, PageSource::ZeroFill, true).unwrap();
        let mut pinned = pin(&second, DATA, true).unwrap();
        pinned.write(0, b"secret").unwrap();
        assert_eq!(pinned.frame_base(), vm.frames().frame_base(0));
        assert_eq!(first_tables.translate(DATA), None);
    }

    #[test]
    fn out_of_frames_when_everything_is_pinned() {
        let (vm, timer) = vm_system(1, 1);
        let (registry, _) = address_space(&vm);
        registry.register(DATA, PageSource::ZeroFill, true).unwrap();
        registry
            .register(DATA + PAGE_FRAME_SIZE, PageSource::ZeroFill, true)
            .unwrap();

        let pinned = pin(&registry, DATA, true).unwrap();
        assert_eq!(
            resolve_fault(&registry, DATA + PAGE_FRAME_SIZE, false),
            Err(VmError::OutOfFrames)
        );
        assert_eq!(timer.sleeps(), 2);
        assert!(!registry.get(DATA + PAGE_FRAME_SIZE).unwrap().is_resident());

        pinned.unpin();
        resolve_fault(&registry, DATA + PAGE_FRAME_SIZE, false).unwrap();
    }

    /// Page tables that can be told to refuse new mappings.
    struct RefusingTables {
        tables: PageManager,
        refuse: AtomicBool,
    }

    impl AddressSpace for RefusingTables {
        fn install(&self, vaddr: usize, frame_base: usize, writable: bool) -> bool {
            !self.refuse.load(Ordering::SeqCst) && self.tables.install(vaddr, frame_base, writable)
        }
        fn clear(&self, vaddr: usize) {
            self.tables.clear(vaddr);
        }
        fn translate(&self, vaddr: usize) -> Option<usize> {
            self.tables.translate(vaddr)
        }
        fn is_dirty(&self, vaddr: usize) -> bool {
            self.tables.is_dirty(vaddr)
        }
        fn set_dirty(&self, vaddr: usize, dirty: bool) {
            self.tables.set_dirty(vaddr, dirty);
        }
        fn is_accessed(&self, vaddr: usize) -> bool {
            self.tables.is_accessed(vaddr)
        }
        fn set_accessed(&self, vaddr: usize, accessed: bool) {
            self.tables.set_accessed(vaddr, accessed);
        }
    }

    #[test]
    fn failed_install_leaves_page_resident() {
        let (vm, _) = vm_system(1, 1);
        let tables = Arc::new(RefusingTables {
            tables: PageManager::new(),
            refuse: AtomicBool::new(true),
        });
        let registry = vm.new_address_space(tables.clone());
        registry.register(DATA, PageSource::ZeroFill, true).unwrap();

        assert_eq!(
            resolve_fault(&registry, DATA, false),
            Err(VmError::InstallFailed(DATA))
        );
        assert!(registry.get(DATA).unwrap().is_resident());
        assert_eq!(tables.translate(DATA), None);

        tables.refuse.store(false, Ordering::SeqCst);
        resolve_fault(&registry, DATA, false).unwrap();
        assert_eq!(tables.translate(DATA), Some(vm.frames().frame_base(0)));
        assert_eq!(vm.frames().frames_in_use(), 1);
    }

    #[test]
    fn concurrent_faults_keep_every_page_intact() {
        const THREADS: usize = 4;
        const PAGES_PER_THREAD: usize = 4;
        const ROUNDS: usize = 200;

        // One spare frame beyond what the other threads can hold pinned.
        let (vm, _) = vm_system(THREADS + 1, THREADS * PAGES_PER_THREAD);
        let (registry, _) = address_space(&vm);
        for i in 0..THREADS * PAGES_PER_THREAD {
            registry
                .register(DATA + i * PAGE_FRAME_SIZE, PageSource::ZeroFill, true)
                .unwrap();
        }

        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let registry = &registry;
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(thread as u64);
                    let mut expected = [0u8; PAGES_PER_THREAD];
                    for round in 0..ROUNDS {
                        let slot = rng.gen_range(0..PAGES_PER_THREAD);
                        let addr = DATA + (slot * THREADS + thread) * PAGE_FRAME_SIZE;
                        let mut page = pin(registry, addr, true).unwrap();

                        let mut current = [0u8; 1];
                        page.read(PAGE_FRAME_SIZE - 1, &mut current);
                        assert_eq!(current[0], expected[slot], "page {addr:#x} lost a write");

                        expected[slot] = (round % 251) as u8 + 1;
                        page.write(PAGE_FRAME_SIZE - 1, &[expected[slot]]).unwrap();
                    }
                });
            }
        });

        assert_eq!(vm.frames().frames_in_use(), THREADS + 1);
        registry.teardown();
        assert_eq!(vm.frames().frames_in_use(), 0);
        assert_eq!(vm.swap().slots_in_use(), 0);
    }
}
