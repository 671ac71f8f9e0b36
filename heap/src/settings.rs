use thiserror::Error;

use crate::OS_PAGE_SIZE;

/// Count a freshly allocated object starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialCount {
    /// Start at zero and enter the allocating mutator's zero-count buffer.
    /// An object that never gets stored into the heap is reclaimed by the
    /// next collection unless a root still points at it.
    Zero,
    /// Start at one. The allocation reference is owned by the host and
    /// given up with [`HeapProxy::release`](crate::HeapProxy::release).
    One,
}

/// What happens to an object whose count drops to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStrategy {
    /// Free it on the spot and cascade into its children. Ignores roots
    /// that still point at the object, so it is only sound for hosts that
    /// never keep uncounted references to heap objects.
    Eager,
    /// Buffer it for the next collection's zero-count table.
    Deferred,
}

/// Whether stores into non-heap slots (globals, statics) adjust counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonHeapPolicy {
    /// Plain store. Such slots must be reported as roots.
    Uncounted,
    /// Full barrier, same as a heap store.
    Counted,
}

/// Bookkeeping between the counted and the traced space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePolicy {
    /// Counted objects that point into the traced space are remembered and
    /// their traced targets kept alive; dead traced objects release the
    /// counts they hold.
    Remembered,
    /// Neither of the above. Traced objects reachable only from counted
    /// objects may be reclaimed and counted objects held by dead traced
    /// objects leak.
    Baseline,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("space sizes and block size must be > 0")]
    ZeroSize,
    #[error("block_size must match OS page alignment")]
    BlockAlignment,
    #[error("{space} size must be a multiple of block_size")]
    NotBlockMultiple { space: &'static str },
    #[error("refill_batch must be > 0")]
    ZeroBatch,
    #[error("zct_buffer_limit must be > 0")]
    ZeroBufferLimit,
    #[error("failed to map {0} bytes")]
    MapFailed(usize),
}

/// Configuration for the counted space, the optional traced space and the
/// collection policies.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of the reference counted space in bytes. Multiple of `block_size`.
    pub counted_size: usize,
    /// Size of the traced mark-sweep space in bytes. `0` disables it.
    pub traced_size: usize,
    /// Size of a block carved into cells of one size class. Multiple of OS
    /// page size.
    pub block_size: usize,
    /// Cells moved from a global free chain into a mutator's local list at
    /// once.
    pub refill_batch: usize,
    pub initial_count: InitialCount,
    pub delete_strategy: DeleteStrategy,
    pub non_heap_policy: NonHeapPolicy,
    pub bridge_policy: BridgePolicy,
    /// Bytes allocated since the last cycle that trigger a collection.
    pub bytes_before_gc: usize,
    /// Length of a mutator's zero-count buffer that triggers a collection.
    pub zct_buffer_limit: usize,
    /// Sweep the counted space at release for allocated cells whose live
    /// bit is clear. Such cells only exist if an object went unbuffered
    /// when its count dropped to zero.
    pub counted_sweep: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            counted_size: 64 * 1024 * 1024, // 64 MB
            traced_size: 0,
            block_size: 32_768, // 32 KB = 2^15
            refill_batch: 64,
            initial_count: InitialCount::Zero,
            delete_strategy: DeleteStrategy::Deferred,
            non_heap_policy: NonHeapPolicy::Uncounted,
            bridge_policy: BridgePolicy::Remembered,
            bytes_before_gc: 8 * 1024 * 1024, // 8 MB
            zct_buffer_limit: 16_384,
            counted_sweep: false,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.counted_size == 0 || self.block_size == 0 {
            return Err(SettingsError::ZeroSize);
        }
        if !self.block_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err(SettingsError::BlockAlignment);
        }
        if !self.counted_size.is_multiple_of(self.block_size) {
            return Err(SettingsError::NotBlockMultiple { space: "counted" });
        }
        if !self.traced_size.is_multiple_of(self.block_size) {
            return Err(SettingsError::NotBlockMultiple { space: "traced" });
        }
        if self.refill_batch == 0 {
            return Err(SettingsError::ZeroBatch);
        }
        if self.zct_buffer_limit == 0 {
            return Err(SettingsError::ZeroBufferLimit);
        }
        Ok(())
    }

    #[inline(always)]
    pub fn has_traced_space(&self) -> bool {
        self.traced_size > 0
    }
}
