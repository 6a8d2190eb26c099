//! Fixed-size block pool with an intrusive free list.
//!
//! One mapped region partitioned into equal power-of-two blocks. Free blocks
//! form a singly linked list threaded through their own first word: each
//! free block stores the address of the next free block as a plain integer,
//! and pointers are rematerialized from the region base so no free block is
//! ever aliased as a live object.

use core::ptr::{self, null_mut};

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::os;

/// Intrusive free-list head. Addresses are stored as integers; 0 is the
/// empty list.
struct FreeList {
  head: usize,
  len: usize,
}

/// A pool of `block_count` equal-sized blocks carved from one region.
///
/// All alloc/free paths are serialized by an internal mutex and are safe to
/// call from any number of threads. `reset` is the exception: the caller
/// must have quiesced all concurrent use and must not hold any outstanding
/// block across it.
pub struct Pool {
  base: *mut u8,
  capacity: usize,
  block_size: usize,
  block_count: usize,
  state: Mutex<FreeList>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
  /// Maps a region holding `block_count` blocks of `block_size` bytes.
  ///
  /// `block_size` is rounded up to the next power of two and to at least one
  /// machine word so a free block can hold the next-link. The region length
  /// is `block_size * block_count` rounded up to a page boundary.
  pub fn new(block_size: usize, block_count: usize) -> Result<Self, AllocError> {
    let block_size = block_size.max(size_of::<usize>()).next_power_of_two();

    let total = block_size
      .checked_mul(block_count)
      .ok_or(AllocError::InvalidLayout)?;
    if total == 0 {
      return Err(AllocError::InvalidLayout);
    }

    let capacity = os::align_up(total, os::page_size());
    let base = os::map(capacity)?;

    let pool = Self {
      base,
      capacity,
      block_size,
      block_count,
      state: Mutex::new(FreeList { head: 0, len: 0 }),
    };
    pool.build_free_list(&mut pool.state.lock());

    Ok(pool)
  }

  /// Links every block into the free list, block 0 first.
  fn build_free_list(&self, list: &mut FreeList) {
    list.head = 0;

    for i in (0..self.block_count).rev() {
      let block = unsafe { self.base.add(i * self.block_size) };
      unsafe { (block as *mut usize).write(list.head) };
      list.head = block as usize;
    }

    list.len = self.block_count;
  }

  /// Rebuilds a pointer into the region from a stored integer address,
  /// deriving provenance from `base`.
  #[inline]
  fn block_at(&self, addr: usize) -> *mut u8 {
    unsafe { self.base.add(addr - self.base as usize) }
  }

  /// Pops one block, or null when the pool is exhausted.
  pub fn alloc(&self) -> *mut u8 {
    let mut list = self.state.lock();

    if list.head == 0 {
      return null_mut();
    }

    let block = self.block_at(list.head);
    list.head = unsafe { *(block as *const usize) };
    list.len -= 1;

    block
  }

  /// Pops up to `out.len()` blocks into `out` under a single lock
  /// acquisition. Returns how many were popped; the remainder of `out` is
  /// untouched.
  pub fn alloc_batched(&self, out: &mut [*mut u8]) -> usize {
    let mut list = self.state.lock();

    let mut popped = 0;
    while popped < out.len() && list.head != 0 {
      let block = self.block_at(list.head);
      list.head = unsafe { *(block as *const usize) };
      list.len -= 1;
      out[popped] = block;
      popped += 1;
    }

    popped
  }

  /// [`alloc`](Self::alloc), then zeroes the whole block. The zeroing runs
  /// outside the mutex; only the caller can see the block.
  pub fn calloc(&self) -> *mut u8 {
    let ptr = self.alloc();

    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, self.block_size) };
    }

    ptr
  }

  /// Returns a block to the free list. Null is a no-op.
  ///
  /// # Safety
  /// `ptr` must have been returned by this pool's alloc path, must not be
  /// freed twice, and must not be used after this call. Foreign or doubly
  /// freed pointers abort in debug builds and corrupt the pool in release
  /// builds.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    debug_assert!(self.owns(ptr), "pointer {ptr:p} does not belong to this pool");

    let mut list = self.state.lock();
    unsafe { (ptr as *mut usize).write(list.head) };
    list.head = ptr as usize;
    list.len += 1;
  }

  /// Returns every owned, non-null pointer in `ptrs` under a single lock
  /// acquisition. Null entries are skipped; entries that fail the ownership
  /// check are skipped and abort in debug builds.
  ///
  /// # Safety
  /// Same contract as [`free`](Self::free) for each owned entry.
  pub unsafe fn free_batched(&self, ptrs: &[*mut u8]) {
    let mut list = self.state.lock();

    for &ptr in ptrs {
      if ptr.is_null() {
        continue;
      }

      debug_assert!(self.owns(ptr), "pointer {ptr:p} does not belong to this pool");
      if !self.owns(ptr) {
        continue;
      }

      unsafe { (ptr as *mut usize).write(list.head) };
      list.head = ptr as usize;
      list.len += 1;
    }
  }

  /// Rebuilds the initial free list, restoring every block.
  ///
  /// # Safety
  /// Caller must ensure no thread is inside any operation on this pool and
  /// that no block handed out before the reset is used or freed afterwards.
  pub unsafe fn reset(&self) {
    self.build_free_list(&mut self.state.lock());
  }

  /// True iff `ptr` is non-null, inside the block range, and block-aligned.
  pub fn owns(&self, ptr: *const u8) -> bool {
    if ptr.is_null() {
      return false;
    }

    let addr = ptr as usize;
    let base = self.base as usize;
    let end = base + self.block_size * self.block_count;

    addr >= base && addr < end && (addr - base) % self.block_size == 0
  }

  /// Free bytes currently on the list: `free_count * block_size`. Under
  /// concurrent churn this is a snapshot at some serialization point.
  pub fn free_space(&self) -> usize {
    self.state.lock().len * self.block_size
  }

  /// Region length in bytes (a page multiple, ≥ `block_size * block_count`).
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Sanitized block size: a power of two, at least one machine word.
  pub fn block_size(&self) -> usize {
    self.block_size
  }

  pub fn block_count(&self) -> usize {
    self.block_count
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    if let Err(err) = unsafe { os::unmap(self.base, self.capacity) } {
      tracing::warn!(%err, "munmap failed while dropping pool");
    }
  }
}
