//! Monotone bump arena over a single mapped region.
//!
//! One atomic offset, advanced by CAS. Allocation never touches a lock and
//! never pads; reclamation is bulk-only via [`Arena::reset`].

use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::AllocError;
use crate::os;

/// A linear allocator over one contiguous region of mapped memory.
///
/// `alloc` and `calloc` are lock-free and safe to call from any number of
/// threads. `reset` and `clear` take `&mut self`: the caller must have
/// quiesced all concurrent use before invoking them.
///
/// There is no per-object free. The caller is responsible for requesting
/// sizes that preserve whatever alignment it needs; the arena adds no
/// padding.
pub struct Arena {
  base: *mut u8,
  capacity: usize,
  used: AtomicUsize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  /// Maps a region of `bytes` rounded up to the next page boundary.
  pub fn new(bytes: usize) -> Result<Self, AllocError> {
    if bytes == 0 {
      return Err(AllocError::InvalidLayout);
    }

    let capacity = os::align_up(bytes, os::page_size());
    let base = os::map(capacity)?;

    Ok(Self {
      base,
      capacity,
      used: AtomicUsize::new(0),
    })
  }

  /// Bumps the arena by `length` bytes and returns the start of the range,
  /// or null when `length == 0`, the region has been cleared, or fewer than
  /// `length` bytes remain.
  pub fn alloc(&self, length: usize) -> *mut u8 {
    if length == 0 || self.base.is_null() {
      return null_mut();
    }

    loop {
      let current = self.used.load(Ordering::Acquire);

      if length > self.capacity - current {
        return null_mut();
      }

      if self
        .used
        .compare_exchange_weak(
          current,
          current + length,
          Ordering::Relaxed,
          Ordering::Relaxed,
        )
        .is_ok()
      {
        return unsafe { self.base.add(current) };
      }
    }
  }

  /// [`alloc`](Self::alloc), then zeroes the returned range.
  ///
  /// The region is zero at map time, so this only matters after a `reset`
  /// handed the bytes out once already; it is performed unconditionally.
  pub fn calloc(&self, length: usize) -> *mut u8 {
    let ptr = self.alloc(length);

    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, length) };
    }

    ptr
  }

  /// Forgets every allocation and rewinds the bump offset to zero.
  ///
  /// All previously returned pointers become invalid; the caller must ensure
  /// nobody holds them.
  pub fn reset(&mut self) {
    *self.used.get_mut() = 0;
  }

  /// Unmaps the region and leaves the arena empty with zero capacity.
  pub fn clear(&mut self) -> Result<(), AllocError> {
    if !self.base.is_null() {
      let result = unsafe { os::unmap(self.base, self.capacity) };
      self.base = null_mut();
      result?;
    }

    self.capacity = 0;
    *self.used.get_mut() = 0;
    Ok(())
  }

  /// Bytes handed out since the last reset. May be stale under concurrent
  /// allocation, but never decreases between resets.
  pub fn used(&self) -> usize {
    self.used.load(Ordering::Acquire)
  }

  /// Region length in bytes (a page multiple).
  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    if self.base.is_null() {
      return;
    }

    if let Err(err) = unsafe { os::unmap(self.base, self.capacity) } {
      tracing::warn!(%err, "munmap failed while dropping arena");
    }
  }
}
