mod freelist;
mod marksweep;

pub use freelist::{
    FreeListLocal, FreeListSpace, GRANULE, MAX_CELL_SIZE, SIZE_CLASSES,
};
pub use marksweep::MarkSweepSpace;

/// Which reclamation discipline governs a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Cells are freed when their reference count drops to zero.
    Counted,
    /// Cells are freed by mark-sweep.
    Traced,
}

/// Occupancy snapshot of a space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    pub cells: usize,
    pub bytes: usize,
    pub blocks_claimed: usize,
    pub blocks_total: usize,
}

/// Operations every cell space offers to the collector, independent of how
/// its cells get reclaimed.
pub trait Space {
    fn kind(&self) -> SpaceKind;

    fn contains(&self, ptr: *const u8) -> bool;

    /// Whether `obj` is the start of a currently allocated cell.
    fn is_allocated(&self, obj: *const u8) -> bool;

    /// Returns the cell to its free chain. Freeing a free cell is fatal.
    fn free(&self, obj: *const u8);

    fn for_each_allocated(&self, f: &mut dyn FnMut(*const u8));

    fn usage(&self) -> SpaceUsage;
}
