use crate::fs::BackingFile;
use crate::mem::{pin, FileBacking, PageRegistry, PageSource, PinnedPage, VmError, VmResult};
use alloc::sync::Arc;
use kidneyos_shared::mem::{page_offset, OFFSET, PAGE_FRAME_SIZE};
use log::debug;

/// Registers the pages of one loadable segment without reading anything yet.
///
/// The segment starts at page-aligned user address `upage` and page-aligned file `offset`.
/// Its first `read_bytes` bytes come from `file` and the following `zero_bytes` bytes are
/// zero; together they must cover whole pages, or nothing is registered. Pages are private:
/// modified pages go to swap, never back to the file.
pub fn load_segment(
    registry: &PageRegistry,
    file: &Arc<dyn BackingFile>,
    offset: u64,
    upage: usize,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) -> VmResult<()> {
    let Some(size) = read_bytes.checked_add(zero_bytes) else {
        return Err(VmError::InvalidAddress(upage));
    };
    // Page 0 stays unmapped so null pointers fault.
    if upage < PAGE_FRAME_SIZE
        || page_offset(upage) != 0
        || size % PAGE_FRAME_SIZE != 0
        || offset % PAGE_FRAME_SIZE as u64 != 0
    {
        return Err(VmError::InvalidAddress(upage));
    }

    let pages = size / PAGE_FRAME_SIZE;
    let mut remaining = read_bytes;
    for i in 0..pages {
        let page_read_bytes = remaining.min(PAGE_FRAME_SIZE);
        let source = if page_read_bytes > 0 {
            PageSource::FileBacked(FileBacking {
                file: file.clone(),
                offset: offset + (i * PAGE_FRAME_SIZE) as u64,
                read_length: page_read_bytes,
                writeback: false,
            })
        } else {
            PageSource::ZeroFill
        };
        registry.register(upage + i * PAGE_FRAME_SIZE, source, writable)?;
        remaining -= page_read_bytes;
    }

    debug!("Loaded segment at {upage:#x}: {pages} pages, {read_bytes} bytes from {offset:#x}");
    Ok(())
}

/// Creates the initial stack page just below the kernel boundary.
///
/// `fill` gets the pinned page to lay out the program's arguments and returns the initial
/// stack pointer, which is recorded and returned.
pub fn setup_stack(
    registry: &PageRegistry,
    fill: impl FnOnce(&mut PinnedPage<'_>) -> VmResult<usize>,
) -> VmResult<usize> {
    let stack_page = OFFSET - PAGE_FRAME_SIZE;
    registry.register(stack_page, PageSource::ZeroFill, true)?;

    let mut page = pin(registry, stack_page, true)?;
    let esp = fill(&mut page)?;
    page.unpin();

    registry.set_stack_pointer(esp);
    Ok(esp)
}

/// Maps `length` bytes of `file` at page-aligned user address `addr`. Modified pages are
/// written back to the file. Returns the number of pages mapped.
///
/// Nothing is mapped if any page of the range is already in use.
pub fn map_file(
    registry: &PageRegistry,
    file: &Arc<dyn BackingFile>,
    length: usize,
    addr: usize,
) -> VmResult<usize> {
    if length == 0 || addr < PAGE_FRAME_SIZE || page_offset(addr) != 0 {
        return Err(VmError::InvalidAddress(addr));
    }

    let pages = length.div_ceil(PAGE_FRAME_SIZE);
    for i in 0..pages {
        let mapped = i * PAGE_FRAME_SIZE;
        let source = PageSource::FileBacked(FileBacking {
            file: file.clone(),
            offset: mapped as u64,
            read_length: (length - mapped).min(PAGE_FRAME_SIZE),
            writeback: true,
        });
        if let Err(error) = registry.register(addr + mapped, source, true) {
            for j in 0..i {
                registry.deregister(addr + j * PAGE_FRAME_SIZE)?;
            }
            return Err(error);
        }
    }

    debug!("Mapped {pages} file pages at {addr:#x}");
    Ok(pages)
}

/// Removes `pages` pages mapped by [`map_file`] at `addr`, writing modified pages back.
///
/// Every page is removed even if an earlier one fails; the first error is returned.
pub fn unmap(registry: &PageRegistry, addr: usize, pages: usize) -> VmResult<()> {
    let mut result = Ok(());
    for i in 0..pages {
        let page_result = registry.deregister(addr + i * PAGE_FRAME_SIZE);
        if result.is_ok() {
            result = page_result;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::test_util::{address_space, vm_system, MemFile};
    use crate::mem::user::{copy_in, copy_out};
    use crate::paging::AddressSpace;
    use alloc::vec;
    use alloc::vec::Vec;

    const CODE: usize = 0x0804_8000;

    fn file(data: Vec<u8>) -> (Arc<MemFile>, Arc<dyn BackingFile>) {
        let file = MemFile::new(data);
        let backing: Arc<dyn BackingFile> = file.clone();
        (file, backing)
    }

    #[test]
    fn segment_pages_are_file_backed_then_zero() {
        let (vm, _) = vm_system(4, 4);
        let (registry, _) = address_space(&vm);
        let data: Vec<u8> = (0..3 * PAGE_FRAME_SIZE).map(|i| (i % 200) as u8 + 1).collect();
        let (mem_file, backing) = file(data.clone());

        // Starts one page into the file; 1.5 pages of data, then 1.5 pages of bss.
        let read_bytes = PAGE_FRAME_SIZE + PAGE_FRAME_SIZE / 2;
        load_segment(
            &registry,
            &backing,
            PAGE_FRAME_SIZE as u64,
            CODE,
            read_bytes,
            3 * PAGE_FRAME_SIZE - read_bytes,
            true,
        )
        .unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(mem_file.reads(), 0);

        let kinds: Vec<_> = (0..3)
            .map(|i| match registry.get(CODE + i * PAGE_FRAME_SIZE).unwrap().lock().source() {
                PageSource::FileBacked(backing) => Some((backing.offset, backing.read_length)),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            [
                Some((PAGE_FRAME_SIZE as u64, PAGE_FRAME_SIZE)),
                Some((2 * PAGE_FRAME_SIZE as u64, PAGE_FRAME_SIZE / 2)),
                None
            ]
        );

        let mut loaded = vec![0; 3 * PAGE_FRAME_SIZE];
        copy_in(&registry, &mut loaded, CODE).unwrap();
        assert_eq!(loaded[..read_bytes], data[PAGE_FRAME_SIZE..PAGE_FRAME_SIZE + read_bytes]);
        assert!(loaded[read_bytes..].iter().all(|&b| b == 0));
    }

    #[test]
    fn overlapping_segment_fails() {
        let (vm, _) = vm_system(1, 1);
        let (registry, _) = address_space(&vm);
        let (_, backing) = file(vec![0; PAGE_FRAME_SIZE]);
        load_segment(&registry, &backing, 0, CODE, 10, PAGE_FRAME_SIZE - 10, false).unwrap();
        assert_eq!(
            load_segment(&registry, &backing, 0, CODE, 0, PAGE_FRAME_SIZE, false),
            Err(VmError::AlreadyRegistered(CODE))
        );
        assert_eq!(
            load_segment(&registry, &backing, 0, 0, 0, PAGE_FRAME_SIZE, false),
            Err(VmError::InvalidAddress(0))
        );
    }

    #[test]
    fn malformed_segment_is_rejected() {
        let (vm, _) = vm_system(1, 1);
        let (registry, _) = address_space(&vm);
        let (_, backing) = file(vec![0; 2 * PAGE_FRAME_SIZE]);
        let page = PAGE_FRAME_SIZE;

        // Not a whole number of pages.
        assert_eq!(
            load_segment(&registry, &backing, 0, CODE, 10, page, false),
            Err(VmError::InvalidAddress(CODE))
        );
        // File offset not page aligned.
        assert_eq!(
            load_segment(&registry, &backing, 12, CODE, 10, page - 10, false),
            Err(VmError::InvalidAddress(CODE))
        );
        assert_eq!(
            load_segment(&registry, &backing, 0, CODE, usize::MAX, page, false),
            Err(VmError::InvalidAddress(CODE))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn stack_is_filled_while_pinned() {
        let (vm, _) = vm_system(2, 1);
        let (registry, tables) = address_space(&vm);
        let esp = setup_stack(&registry, |page| {
            page.write(PAGE_FRAME_SIZE - 4, b"arg\0")?;
            Ok(OFFSET - 4)
        })
        .unwrap();

        assert_eq!(esp, OFFSET - 4);
        assert_eq!(registry.stack_pointer(), OFFSET - 4);
        assert!(tables.translate(OFFSET - 4).is_some());
        let mut arg = [0u8; 4];
        copy_in(&registry, &mut arg, OFFSET - 4).unwrap();
        assert_eq!(&arg, b"arg\0");

        // The stack can now grow down from there.
        assert!(registry.lookup(OFFSET - PAGE_FRAME_SIZE - 8).is_none());
        registry.set_stack_pointer(OFFSET - PAGE_FRAME_SIZE);
        assert!(registry.lookup(OFFSET - PAGE_FRAME_SIZE - 8).is_some());
    }

    #[test]
    fn failing_fill_keeps_the_stack_pointer() {
        let (vm, _) = vm_system(1, 1);
        let (registry, _) = address_space(&vm);
        let before = registry.stack_pointer();
        assert_eq!(
            setup_stack(&registry, |_| Err(VmError::OutOfFrames)),
            Err(VmError::OutOfFrames)
        );
        assert_eq!(registry.stack_pointer(), before);
    }

    #[test]
    fn mapped_file_is_written_back_on_unmap() {
        let (vm, _) = vm_system(2, 1);
        let (registry, _) = address_space(&vm);
        let (mem_file, backing) = file(vec![b'.'; PAGE_FRAME_SIZE + 100]);
        let map = 0x1000_0000;

        assert_eq!(map_file(&registry, &backing, PAGE_FRAME_SIZE + 100, map).unwrap(), 2);
        copy_out(&registry, map + PAGE_FRAME_SIZE + 10, b"xyz").unwrap();

        unmap(&registry, map, 2).unwrap();
        assert!(registry.is_empty());
        let contents = mem_file.contents();
        assert_eq!(contents.len(), PAGE_FRAME_SIZE + 100);
        assert_eq!(&contents[PAGE_FRAME_SIZE + 10..PAGE_FRAME_SIZE + 13], b"xyz");
        // The clean first page was never written.
        assert_eq!(mem_file.writes(), 1);
    }

    #[test]
    fn map_over_existing_page_maps_nothing() {
        let (vm, _) = vm_system(1, 1);
        let (registry, _) = address_space(&vm);
        let (_, backing) = file(vec![0; 3 * PAGE_FRAME_SIZE]);
        let map = 0x1000_0000;
        registry
            .register(map + 2 * PAGE_FRAME_SIZE, PageSource::ZeroFill, true)
            .unwrap();

        assert_eq!(
            map_file(&registry, &backing, 3 * PAGE_FRAME_SIZE, map),
            Err(VmError::AlreadyRegistered(map + 2 * PAGE_FRAME_SIZE))
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(
            map_file(&registry, &backing, 0, map),
            Err(VmError::InvalidAddress(map))
        );
    }
}
