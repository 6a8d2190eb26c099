use thiserror::Error;

/// Errors surfaced at construction or teardown of a mapped region.
///
/// Allocation exhaustion is never an error; exhausted allocators return a
/// null pointer and callers branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The OS refused to map the requested region.
  #[error("failed to map {bytes} bytes of anonymous memory (errno {errno})")]
  MapFailed { bytes: usize, errno: i32 },

  /// `munmap` failed; the instance is in an indeterminate state and should
  /// not be reused.
  #[error("failed to unmap region (errno {errno})")]
  UnmapFailed { errno: i32 },

  /// Zero-sized region or a block geometry whose total size overflows.
  #[error("invalid region layout")]
  InvalidLayout,
}
