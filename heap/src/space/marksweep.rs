use std::ptr::NonNull;

use super::{FreeListLocal, FreeListSpace, Space, SpaceKind, SpaceUsage};

/// Free-list space reclaimed by tracing. The cell live bit is the mark bit.
#[derive(Debug)]
pub struct MarkSweepSpace {
    cells: FreeListSpace,
}

impl MarkSweepSpace {
    pub fn new(
        size: usize,
        block_size: usize,
        refill_batch: usize,
    ) -> Option<Self> {
        FreeListSpace::new(SpaceKind::Traced, size, block_size, refill_batch)
            .map(|cells| Self { cells })
    }

    #[inline]
    pub fn alloc(
        &self,
        local: &mut FreeListLocal,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Option<NonNull<u8>> {
        self.cells.alloc(local, size, align, offset)
    }

    pub fn flush(&self, local: &mut FreeListLocal) {
        self.cells.flush(local);
    }

    /// Unmarks every cell ahead of a trace.
    pub fn prepare(&self) {
        self.cells.clear_all_live_bits();
    }

    /// Marks `obj`. Returns `true` if it was unmarked.
    #[inline]
    pub fn mark(&self, obj: *const u8) -> bool {
        self.cells.set_live_bit(obj)
    }

    #[inline]
    pub fn is_marked(&self, obj: *const u8) -> bool {
        self.cells.is_live(obj)
    }

    /// Frees every unmarked cell after handing it to `on_dead`.
    pub fn sweep(&self, on_dead: &mut dyn FnMut(*const u8)) -> usize {
        self.cells.sweep_cells(&mut |cell| {
            on_dead(cell);
            false
        })
    }
}

impl Space for MarkSweepSpace {
    fn kind(&self) -> SpaceKind {
        SpaceKind::Traced
    }

    #[inline(always)]
    fn contains(&self, ptr: *const u8) -> bool {
        self.cells.contains(ptr)
    }

    #[inline]
    fn is_allocated(&self, obj: *const u8) -> bool {
        self.cells.is_allocated(obj)
    }

    fn free(&self, obj: *const u8) {
        self.cells.free(obj);
    }

    fn for_each_allocated(&self, f: &mut dyn FnMut(*const u8)) {
        self.cells.for_each_allocated(f);
    }

    fn usage(&self) -> SpaceUsage {
        self.cells.usage()
    }
}
