//! Size-classed slab front end with per-thread caches.
//!
//! Ten fixed size classes, each backed by a shared [`Pool`]. The four
//! smallest classes are hot: allocations are served from a per-thread cache
//! of pointers and only touch the shared pool in batches of half a cache.
//! A per-slab epoch, bumped on reset, invalidates every thread's cached
//! pointers without walking threads.

use core::cell::{Cell, UnsafeCell};
use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::pool::Pool;

// =============================================================================
// Configuration
// =============================================================================

/// (size class, default block count), ascending by class.
const SIZE_CLASS_CONFIG: [(usize, usize); 10] = [
  (8, 512),
  (16, 512),
  (32, 256),
  (64, 256),
  (128, 128),
  (256, 128),
  (512, 64),
  (1024, 64),
  (2048, 32),
  (4096, 32),
];

const NUM_SIZE_CLASSES: usize = SIZE_CLASS_CONFIG.len();

/// Classes at index below this are served through the thread cache.
const NUM_CACHED_CLASSES: usize = 4;

/// Pointers cached per class per entry.
const CACHE_DEPTH: usize = 128;

/// Distinct slabs one thread caches for; further slabs evict an entry.
const MAX_CACHED_SLABS: usize = 4;

/// Pointers moved between cache and pool per refill or flush.
const REFILL_BATCH: usize = CACHE_DEPTH / 2;

const fn classes_ascend() -> bool {
  let mut i = 1;
  while i < NUM_SIZE_CLASSES {
    if SIZE_CLASS_CONFIG[i].0 <= SIZE_CLASS_CONFIG[i - 1].0 {
      return false;
    }
    i += 1;
  }
  true
}

const _: () = assert!(NUM_CACHED_CLASSES <= NUM_SIZE_CLASSES);
const _: () = assert!(CACHE_DEPTH % 2 == 0);
const _: () = assert!(MAX_CACHED_SLABS >= 1);
const _: () = assert!(classes_ascend());

/// Smallest class index fitting `size`, or None for 0, the sentinel
/// max-value, or anything above the largest class.
fn size_to_index(size: usize) -> Option<usize> {
  if size == 0 || size == usize::MAX {
    return None;
  }

  SIZE_CLASS_CONFIG.iter().position(|&(class, _)| size <= class)
}

// =============================================================================
// Per-thread cache
// =============================================================================

/// Bounded LIFO of cached block pointers for one size class.
struct ClassCache {
  slots: [*mut u8; CACHE_DEPTH],
  len: usize,
}

impl ClassCache {
  const fn new() -> Self {
    Self {
      slots: [null_mut(); CACHE_DEPTH],
      len: 0,
    }
  }

  fn pop(&mut self) -> *mut u8 {
    if self.len == 0 {
      return null_mut();
    }

    self.len -= 1;
    self.slots[self.len]
  }

  fn push(&mut self, ptr: *mut u8) {
    debug_assert!(self.len < CACHE_DEPTH, "class cache overflow");
    self.slots[self.len] = ptr;
    self.len += 1;
  }

  fn is_full(&self) -> bool {
    self.len == CACHE_DEPTH
  }
}

/// One per-thread cache slot, bound to a single slab at a time.
///
/// `owner` is read cross-thread by slab destructors scanning for their own
/// entries, hence atomic. Everything else is touched either by the owning
/// thread or, under the table registry lock, by a destructor or eviction
/// that the quiescence contract has serialized against the owning thread.
struct CacheEntry {
  /// Id of the owning slab; 0 = vacant.
  owner: AtomicU64,
  /// Base of the owner's pool array. Valid while `owner` names a live slab.
  pools: Cell<*const Pool>,
  /// Owner epoch observed when the entry was last validated.
  epoch: Cell<usize>,
  classes: UnsafeCell<[ClassCache; NUM_CACHED_CLASSES]>,
}

impl CacheEntry {
  const fn new() -> Self {
    Self {
      owner: AtomicU64::new(0),
      pools: Cell::new(ptr::null()),
      epoch: Cell::new(0),
      classes: UnsafeCell::new([const { ClassCache::new() }; NUM_CACHED_CLASSES]),
    }
  }

  /// Drops every cached pointer without returning it to any pool.
  ///
  /// # Safety
  /// No other reference into `classes` may be live.
  unsafe fn invalidate_all(&self) {
    let classes = unsafe { &mut *self.classes.get() };
    for cache in classes {
      cache.len = 0;
    }
  }

  /// Returns every cached pointer to the owner's pools and empties the
  /// caches.
  ///
  /// # Safety
  /// `pools` must point at the owner's live pool array, and no other
  /// reference into `classes` may be live.
  unsafe fn flush(&self) {
    let pools = self.pools.get();
    if pools.is_null() {
      return;
    }

    let classes = unsafe { &mut *self.classes.get() };
    for (index, cache) in classes.iter_mut().enumerate() {
      if cache.len == 0 {
        continue;
      }

      let pool = unsafe { &*pools.add(index) };
      unsafe { pool.free_batched(&cache.slots[..cache.len]) };
      cache.len = 0;
    }
  }

  /// Rebinds the entry to `slab` with empty caches.
  ///
  /// # Safety
  /// Same aliasing requirement as [`invalidate_all`](Self::invalidate_all).
  unsafe fn claim(&self, slab: &Slab) {
    unsafe { self.invalidate_all() };
    self.pools.set(slab.pools.as_ptr());
    self.epoch.set(slab.epoch.load(Ordering::Acquire));
    self.owner.store(slab.id, Ordering::Release);
  }

  /// Marks the entry vacant. Cached pointers must already be flushed or
  /// invalidated.
  fn release(&self) {
    self.pools.set(ptr::null());
    self.owner.store(0, Ordering::Release);
  }
}

/// Fixed table of cache entries, one table per thread.
struct CacheTable {
  entries: [CacheEntry; MAX_CACHED_SLABS],
}

impl CacheTable {
  const fn new() -> Self {
    Self {
      entries: [const { CacheEntry::new() }; MAX_CACHED_SLABS],
    }
  }

  /// Entry already bound to `id`, if any. Only the owning thread stores
  /// non-zero ids into its own table, so a hit needs no lock.
  fn lookup(&self, id: u64) -> Option<&CacheEntry> {
    self
      .entries
      .iter()
      .find(|entry| entry.owner.load(Ordering::Acquire) == id)
  }

  /// Binds an entry to `slab`: the first vacant slot if any, else the last
  /// entry after flushing it to the owner it is about to lose.
  ///
  /// # Safety
  /// Caller must hold the registry lock; this is what keeps the victim's
  /// owner alive across the flush.
  unsafe fn bind(&self, slab: &Slab) -> &CacheEntry {
    if let Some(entry) = self
      .entries
      .iter()
      .find(|entry| entry.owner.load(Ordering::Acquire) == 0)
    {
      unsafe { entry.claim(slab) };
      return entry;
    }

    let victim = &self.entries[MAX_CACHED_SLABS - 1];
    unsafe { victim.flush() };
    unsafe { victim.claim(slab) };
    victim
  }
}

/// Registered table address; tables are heap-pinned for the thread's life.
struct TablePtr(*const CacheTable);

unsafe impl Send for TablePtr {}

/// All live thread tables. Slab destructors walk this to purge their
/// entries; binding and thread exit serialize against that walk here.
static REGISTRY: Mutex<Vec<TablePtr>> = Mutex::new(Vec::new());

struct ThreadCaches {
  table: Box<CacheTable>,
}

impl ThreadCaches {
  fn new() -> Self {
    let table = Box::new(CacheTable::new());
    REGISTRY.lock().push(TablePtr(&*table));
    Self { table }
  }
}

impl Drop for ThreadCaches {
  fn drop(&mut self) {
    let mut registry = REGISTRY.lock();

    // Return the thread's cached pointers to their owners; without this,
    // thread churn would slowly bleed blocks off the free lists.
    for entry in &self.table.entries {
      if entry.owner.load(Ordering::Acquire) != 0 {
        unsafe { entry.flush() };
        entry.release();
      }
    }

    let table: *const CacheTable = &*self.table;
    registry.retain(|registered| !ptr::eq(registered.0, table));
  }
}

thread_local! {
  static CACHES: ThreadCaches = ThreadCaches::new();
}

// =============================================================================
// Slab
// =============================================================================

/// Slab ids start at 1; 0 marks a vacant cache entry. Ids never recur, so a
/// stale entry can never falsely match a newer slab.
static NEXT_SLAB_ID: AtomicU64 = AtomicU64::new(1);

/// A size-classed allocator routing requests to ten shared [`Pool`]s, with
/// the four smallest classes served through per-thread caches.
///
/// `alloc`, `calloc`, and `free` are safe under any concurrency; `reset`
/// requires the caller to quiesce all other use first, and bumps the slab's
/// epoch so every thread's cached pointers die with the old generation.
pub struct Slab {
  /// Boxed so the array address survives moves of the `Slab` value; cache
  /// entries hold this address.
  pools: Box<[Pool; NUM_SIZE_CLASSES]>,
  epoch: AtomicUsize,
  id: u64,
}

impl Slab {
  /// A slab with the default block counts per class.
  pub fn new() -> Result<Self, AllocError> {
    Self::with_scale(1.0)
  }

  /// A slab whose per-class block counts are the defaults scaled by
  /// `scale` and clamped to at least one block.
  pub fn with_scale(scale: f64) -> Result<Self, AllocError> {
    let mut pools = Vec::with_capacity(NUM_SIZE_CLASSES);
    for (size, count) in SIZE_CLASS_CONFIG {
      let scaled = ((count as f64 * scale).ceil() as usize).max(1);
      pools.push(Pool::new(size, scaled)?);
    }

    let pools: Box<[Pool; NUM_SIZE_CLASSES]> = match pools.into_boxed_slice().try_into() {
      Ok(pools) => pools,
      Err(_) => unreachable!(),
    };

    let slab = Self {
      pools,
      epoch: AtomicUsize::new(0),
      id: NEXT_SLAB_ID.fetch_add(1, Ordering::Relaxed),
    };
    tracing::debug!(id = slab.id, scale, "slab created");
    Ok(slab)
  }

  /// Allocates a block of the smallest class fitting `size`, or null when
  /// `size` is 0, the max-value sentinel, above the largest class, or the
  /// class's pool is exhausted.
  pub fn alloc(&self, size: usize) -> *mut u8 {
    let Some(index) = size_to_index(size) else {
      return null_mut();
    };

    if index >= NUM_CACHED_CLASSES {
      return self.pools[index].alloc();
    }

    match CACHES.try_with(|caches| self.cached_alloc(&caches.table, index)) {
      Ok(ptr) => ptr,
      // Thread-local storage is tearing down; go straight to the pool.
      Err(_) => self.pools[index].alloc(),
    }
  }

  /// [`alloc`](Self::alloc), then zeroes the block. The zeroed range is the
  /// class size, not the requested size.
  pub fn calloc(&self, size: usize) -> *mut u8 {
    let Some(index) = size_to_index(size) else {
      return null_mut();
    };

    let ptr = self.alloc(size);
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, SIZE_CLASS_CONFIG[index].0) };
    }

    ptr
  }

  /// Returns a block allocated with the same `size` class. Null pointers
  /// and sentinel / out-of-range sizes are no-ops.
  ///
  /// # Safety
  /// `ptr` must have come from this slab's alloc path with a size routing
  /// to the same class, must not be freed twice, and must not be used after
  /// this call.
  pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
    if ptr.is_null() {
      return;
    }

    let Some(index) = size_to_index(size) else {
      return;
    };

    if index >= NUM_CACHED_CLASSES {
      return unsafe { self.pools[index].free(ptr) };
    }

    let routed = CACHES.try_with(|caches| unsafe { self.cached_free(&caches.table, index, ptr) });
    if routed.is_err() {
      unsafe { self.pools[index].free(ptr) };
    }
  }

  /// Restores every pool's free list, then bumps the epoch so the cached
  /// pointers of every thread are discarded at next use.
  ///
  /// # Safety
  /// Caller must ensure no thread is inside any operation on this slab and
  /// that no pointer handed out before the reset is used afterwards.
  pub unsafe fn reset(&self) {
    for pool in self.pools.iter() {
      unsafe { pool.reset() };
    }

    self.epoch.fetch_add(1, Ordering::Release);
    tracing::debug!(id = self.id, "slab reset");
  }

  pub fn pool_count(&self) -> usize {
    NUM_SIZE_CLASSES
  }

  /// Sum of all pool region lengths.
  pub fn total_capacity(&self) -> usize {
    self.pools.iter().map(Pool::capacity).sum()
  }

  /// Sum of all pool free space. Excludes pointers sitting in thread
  /// caches; those count as allocated until flushed.
  pub fn total_free(&self) -> usize {
    self.pools.iter().map(Pool::free_space).sum()
  }

  /// Block size of pool `index`, or 0 when out of range.
  pub fn pool_block_size(&self, index: usize) -> usize {
    self.pools.get(index).map_or(0, Pool::block_size)
  }

  /// Free space of pool `index`, or 0 when out of range.
  pub fn pool_free_space(&self, index: usize) -> usize {
    self.pools.get(index).map_or(0, Pool::free_space)
  }

  // --- hot path ---

  fn cached_alloc(&self, table: &CacheTable, index: usize) -> *mut u8 {
    let entry = self.entry_for(table);
    self.reconcile_epoch(entry);

    let cache = unsafe { &mut (*entry.classes.get())[index] };
    let ptr = cache.pop();
    if !ptr.is_null() {
      return ptr;
    }

    // Miss: refill half the cache under one pool lock acquisition. A refill
    // of zero leaves the cache empty and the allocation null.
    let filled = self.pools[index].alloc_batched(&mut cache.slots[..REFILL_BATCH]);
    cache.len = filled;
    cache.pop()
  }

  unsafe fn cached_free(&self, table: &CacheTable, index: usize, ptr: *mut u8) {
    let entry = self.entry_for(table);
    self.reconcile_epoch(entry);

    let cache = unsafe { &mut (*entry.classes.get())[index] };
    if cache.is_full() {
      // Flush the older half and slide the newer half down.
      unsafe { self.pools[index].free_batched(&cache.slots[..REFILL_BATCH]) };
      cache.slots.copy_within(REFILL_BATCH.., 0);
      cache.len = REFILL_BATCH;
    }

    cache.push(ptr);
  }

  /// The calling thread's cache entry for this slab, binding one on first
  /// touch.
  fn entry_for<'t>(&self, table: &'t CacheTable) -> &'t CacheEntry {
    if let Some(entry) = table.lookup(self.id) {
      return entry;
    }

    let _registry = REGISTRY.lock();
    unsafe { table.bind(self) }
  }

  /// Discards the entry's cached pointers if they predate the slab's
  /// current epoch. Stale pointers are dropped, never re-freed: the reset
  /// that bumped the epoch already rebuilt the pools' free lists.
  fn reconcile_epoch(&self, entry: &CacheEntry) {
    let current = self.epoch.load(Ordering::Acquire);
    if entry.epoch.get() != current {
      unsafe { entry.invalidate_all() };
      entry.epoch.set(current);
    }
  }
}

impl Drop for Slab {
  fn drop(&mut self) {
    // Give every thread's cached pointers back to our pools before the
    // regions go away, then leave the entries vacant for rebinding.
    let registry = REGISTRY.lock();
    for table in registry.iter() {
      let table = unsafe { &*table.0 };
      for entry in &table.entries {
        if entry.owner.load(Ordering::Acquire) == self.id {
          unsafe { entry.flush() };
          entry.release();
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn size_to_index_routes_by_class() {
    assert_eq!(size_to_index(1), Some(0));
    assert_eq!(size_to_index(8), Some(0));
    assert_eq!(size_to_index(9), Some(1));
    assert_eq!(size_to_index(16), Some(1));
    assert_eq!(size_to_index(4096), Some(9));
    assert_eq!(size_to_index(0), None);
    assert_eq!(size_to_index(4097), None);
    assert_eq!(size_to_index(usize::MAX), None);
  }

  #[test]
  fn pool_geometry_matches_the_class_table() {
    let slab = Slab::new().unwrap();
    assert_eq!(slab.pool_count(), 10);

    for (index, (size, count)) in SIZE_CLASS_CONFIG.iter().enumerate() {
      assert_eq!(slab.pool_block_size(index), *size);
      assert_eq!(slab.pool_free_space(index), size * count);
    }

    assert_eq!(slab.pool_block_size(10), 0);
    assert_eq!(slab.pool_free_space(99), 0);
  }

  #[test]
  fn scale_grows_and_shrinks_block_counts() {
    let half = Slab::with_scale(0.5).unwrap();
    assert_eq!(half.pool_free_space(0), 8 * 256);

    let tiny = Slab::with_scale(0.0001).unwrap();
    for index in 0..tiny.pool_count() {
      assert_eq!(tiny.pool_free_space(index), tiny.pool_block_size(index));
    }

    // Hostile scales degrade to one block per class, never wrap.
    let negative = Slab::with_scale(-3.0).unwrap();
    assert_eq!(negative.pool_free_space(0), 8);
  }

  #[test]
  fn invalid_sizes_return_null() {
    let slab = Slab::new().unwrap();
    assert!(slab.alloc(0).is_null());
    assert!(slab.alloc(4097).is_null());
    assert!(slab.alloc(usize::MAX).is_null());
    assert!(slab.calloc(0).is_null());
    assert!(slab.calloc(usize::MAX).is_null());
  }

  #[test]
  fn hot_allocation_refills_from_the_shared_pool() {
    let slab = Slab::new().unwrap();

    // First touch of a hot class pulls one refill batch into the cache.
    let ptr = slab.alloc(1);
    assert!(!ptr.is_null());
    assert_eq!(slab.pool_free_space(0), (512 - REFILL_BATCH) * 8);

    // The next allocations come from the cache without touching the pool.
    for _ in 0..REFILL_BATCH - 1 {
      assert!(!slab.alloc(8).is_null());
    }
    assert_eq!(slab.pool_free_space(0), (512 - REFILL_BATCH) * 8);

    // Cache drained: the next allocation refills again.
    assert!(!slab.alloc(8).is_null());
    assert_eq!(slab.pool_free_space(0), (512 - 2 * REFILL_BATCH) * 8);
  }

  #[test]
  fn cold_allocation_goes_straight_to_the_pool() {
    let slab = Slab::new().unwrap();

    let before = slab.pool_free_space(5);
    let ptr = slab.alloc(200);
    assert!(!ptr.is_null());
    assert_eq!(slab.pool_free_space(5), before - 256);

    unsafe { slab.free(ptr, 200) };
    assert_eq!(slab.pool_free_space(5), before);
  }

  #[test]
  fn free_with_a_full_cache_flushes_half() {
    let slab = Slab::new().unwrap();

    // Three refills leave 63 pointers cached after 129 allocations.
    let ptrs: Vec<*mut u8> = (0..CACHE_DEPTH + 1).map(|_| slab.alloc(8)).collect();
    assert!(ptrs.iter().all(|p| !p.is_null()));
    assert_eq!(slab.pool_free_space(0), (512 - 3 * REFILL_BATCH) * 8);

    // Freeing all 129 fills the cache once; exactly one half-flush happens.
    for &ptr in &ptrs {
      unsafe { slab.free(ptr, 8) };
    }
    assert_eq!(
      slab.pool_free_space(0),
      (512 - 3 * REFILL_BATCH + REFILL_BATCH) * 8
    );
  }

  #[test]
  fn calloc_zeroes_the_whole_class_block() {
    let slab = Slab::new().unwrap();

    // Dirty a block, cache it, and take it back through calloc.
    let ptr = slab.alloc(10);
    assert!(!ptr.is_null());
    unsafe { ptr.write_bytes(0xFF, 16) };
    unsafe { slab.free(ptr, 10) };

    let zeroed = slab.calloc(10);
    assert_eq!(zeroed, ptr);
    for i in 0..16 {
      assert_eq!(unsafe { *zeroed.add(i) }, 0);
    }
  }

  #[test]
  fn reset_restores_pools_and_invalidates_the_cache() {
    let slab = Slab::new().unwrap();
    let initial = slab.total_free();

    let ptr = slab.alloc(16);
    assert!(!ptr.is_null());
    unsafe { slab.free(ptr, 16) };
    assert!(slab.total_free() < initial);

    unsafe { slab.reset() };
    assert_eq!(slab.total_free(), initial);

    // The cached generation is dead: the next allocation must refill, not
    // replay a stale pointer on top of the rebuilt free list.
    let fresh = slab.alloc(16);
    assert!(!fresh.is_null());
    assert_eq!(slab.pool_free_space(1), (512 - REFILL_BATCH) * 16);
  }

  #[test]
  fn more_slabs_than_cache_slots_evict_the_last_entry() {
    let slabs: Vec<Slab> = (0..MAX_CACHED_SLABS + 1)
      .map(|_| Slab::new().unwrap())
      .collect();
    let initial = slabs[0].total_free();

    // Bind an entry for each of the first four slabs, leaving one pointer
    // cached per slab.
    for slab in &slabs[..MAX_CACHED_SLABS] {
      let ptr = slab.alloc(8);
      assert!(!ptr.is_null());
      unsafe { slab.free(ptr, 8) };
      assert!(slab.total_free() < initial);
    }

    // A fifth slab claims the last entry, flushing its old owner whole.
    let ptr = slabs[MAX_CACHED_SLABS].alloc(8);
    assert!(!ptr.is_null());
    unsafe { slabs[MAX_CACHED_SLABS].free(ptr, 8) };

    assert_eq!(slabs[MAX_CACHED_SLABS - 1].total_free(), initial);
    // Earlier slabs keep their entries and their cached pointers.
    assert!(slabs[0].total_free() < initial);
  }

  #[test]
  fn dropping_a_slab_flushes_and_releases_its_entries() {
    let slab = Slab::new().unwrap();
    let ptr = slab.alloc(8);
    assert!(!ptr.is_null());
    unsafe { slab.free(ptr, 8) };
    drop(slab);

    // The vacated entry is immediately reusable by a new slab.
    let next = Slab::new().unwrap();
    let initial = next.total_free();
    let ptr = next.alloc(8);
    assert!(!ptr.is_null());
    unsafe { next.free(ptr, 8) };
    assert!(next.total_free() < initial);
  }

  #[test]
  fn free_with_invalid_size_is_a_noop() {
    let slab = Slab::new().unwrap();

    let ptr = slab.alloc(32);
    assert!(!ptr.is_null());
    let before = slab.pool_free_space(2);

    unsafe { slab.free(ptr, 0) };
    unsafe { slab.free(ptr, usize::MAX) };
    unsafe { slab.free(ptr, 4097) };
    assert_eq!(slab.pool_free_space(2), before);

    unsafe { slab.free(ptr, 32) };
  }

  #[test]
  fn free_null_is_a_noop() {
    let slab = Slab::new().unwrap();
    unsafe { slab.free(null_mut(), 16) };
  }
}
