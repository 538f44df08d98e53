//! Copying between kernel buffers and user memory for system calls.
//!
//! Each user page is pinned while it is copied, so a page cannot be evicted halfway through a
//! copy and faults never happen while kernel locks are held.

use super::error::{VmError, VmResult};
use super::fault::pin;
use super::page::PageRegistry;
use alloc::{vec, vec::Vec};
use kidneyos_shared::mem::{page_offset, PAGE_FRAME_SIZE};

/// Splits `len` bytes starting at user address `start` into per-page pieces of
/// `(address, position in buffer, length)`.
fn chunks(start: usize, len: usize) -> VmResult<impl Iterator<Item = (usize, usize, usize)>> {
    if start.checked_add(len).is_none() {
        return Err(VmError::InvalidAddress(start));
    }
    let mut done = 0;
    Ok(core::iter::from_fn(move || {
        if done == len {
            return None;
        }
        let addr = start + done;
        let count = (PAGE_FRAME_SIZE - page_offset(addr)).min(len - done);
        let chunk = (addr, done, count);
        done += count;
        Some(chunk)
    }))
}

/// Copies `dst.len()` bytes from user address `user_src` into `dst`.
pub fn copy_in(registry: &PageRegistry, dst: &mut [u8], user_src: usize) -> VmResult<()> {
    for (addr, position, count) in chunks(user_src, dst.len())? {
        let page = pin(registry, addr, false)?;
        page.read(page_offset(addr), &mut dst[position..position + count]);
    }
    Ok(())
}

/// Copies `src` to user address `user_dst`.
pub fn copy_out(registry: &PageRegistry, user_dst: usize, src: &[u8]) -> VmResult<()> {
    for (addr, position, count) in chunks(user_dst, src.len())? {
        let mut page = pin(registry, addr, true)?;
        page.write(page_offset(addr), &src[position..position + count])?;
    }
    Ok(())
}

/// Reads a NUL-terminated string of at most `max_len` bytes (terminator excluded) from user
/// address `user_src`. The terminator is not included in the result.
pub fn copy_in_string(
    registry: &PageRegistry,
    user_src: usize,
    max_len: usize,
) -> VmResult<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut addr = user_src;
    loop {
        let offset = page_offset(addr);
        let mut tail = vec![0; PAGE_FRAME_SIZE - offset];
        pin(registry, addr, false)?.read(offset, &mut tail);

        match tail.iter().position(|&b| b == 0) {
            Some(end) if bytes.len() + end <= max_len => {
                bytes.extend_from_slice(&tail[..end]);
                return Ok(bytes);
            }
            None if bytes.len() + tail.len() <= max_len => {
                bytes.extend_from_slice(&tail);
                addr = addr
                    .checked_add(tail.len())
                    .ok_or(VmError::InvalidAddress(addr))?;
            }
            _ => return Err(VmError::InvalidAddress(user_src)),
        }
    }
}
