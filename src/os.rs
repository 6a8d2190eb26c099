//! Page-mapping primitive.
//!
//! Every region the allocators carve up comes from here: anonymous,
//! zero-initialized, read/write pages. The system allocator is never
//! involved.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::AllocError;

/// Runtime page size, queried once and cached.
pub(crate) fn page_size() -> usize {
  static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

  let cached = PAGE_SIZE.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }

  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
  PAGE_SIZE.store(size, Ordering::Relaxed);
  size
}

fn last_errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Maps `len` bytes of anonymous zero-initialized read/write memory.
/// `len` must be a non-zero page multiple.
pub(crate) fn map(len: usize) -> Result<*mut u8, AllocError> {
  debug_assert!(len != 0 && len % page_size() == 0, "map length {len} is not a page multiple");

  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    let errno = last_errno();
    tracing::debug!(bytes = len, errno, "mmap failed");
    return Err(AllocError::MapFailed { bytes: len, errno });
  }

  tracing::debug!(bytes = len, "mapped region");
  Ok(ptr as *mut u8)
}

/// Unmaps a region previously returned by [`map`].
///
/// # Safety
/// `ptr`/`len` must describe exactly one live mapping from [`map`], and no
/// pointer into the region may be used afterwards.
pub(crate) unsafe fn unmap(ptr: *mut u8, len: usize) -> Result<(), AllocError> {
  let result = unsafe { libc::munmap(ptr.cast(), len) };

  if result != 0 {
    return Err(AllocError::UnmapFailed { errno: last_errno() });
  }

  tracing::debug!(bytes = len, "unmapped region");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_nonzero_power_of_two() {
    let size = page_size();
    assert!(size.is_power_of_two());
    // Second call hits the cache and agrees.
    assert_eq!(size, page_size());
  }

  #[test]
  fn align_up_rounds() {
    assert_eq!(align_up(0, 4096), 0);
    assert_eq!(align_up(1, 4096), 4096);
    assert_eq!(align_up(4096, 4096), 4096);
    assert_eq!(align_up(4097, 4096), 8192);
  }

  #[test]
  fn map_returns_zeroed_writable_pages() {
    let len = page_size();
    let ptr = map(len).unwrap();

    unsafe {
      for i in 0..len {
        assert_eq!(*ptr.add(i), 0);
      }
      ptr.write_bytes(0xAB, len);
      assert_eq!(*ptr.add(len - 1), 0xAB);
      unmap(ptr, len).unwrap();
    }
  }
}
