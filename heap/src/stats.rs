/// Counters for a single collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Distinct entries in the zero-count table.
    pub zct_entries: usize,
    /// Table entries kept alive by a root.
    pub resurrected: usize,
    /// Counted cells freed, cascades included.
    pub freed_cells: usize,
    pub freed_bytes: usize,
    /// Zero-count objects handed to the next cycle.
    pub carried: usize,
    pub traced_marked: usize,
    pub traced_swept: usize,
    /// Counted cells the backstop sweep found unreachable.
    pub counted_swept: usize,
}

impl CycleStats {
    fn accumulate(&mut self, other: &CycleStats) {
        self.zct_entries += other.zct_entries;
        self.resurrected += other.resurrected;
        self.freed_cells += other.freed_cells;
        self.freed_bytes += other.freed_bytes;
        self.carried += other.carried;
        self.traced_marked += other.traced_marked;
        self.traced_swept += other.traced_swept;
        self.counted_swept += other.counted_swept;
    }
}

/// Cumulative collection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub cycles: usize,
    pub last: CycleStats,
    pub total: CycleStats,
    /// Cells freed by mutators under the eager strategy.
    pub eager_freed: usize,
}

impl CollectionStats {
    pub(crate) fn record(&mut self, cycle: CycleStats) {
        self.cycles += 1;
        self.total.accumulate(&cycle);
        self.last = cycle;
    }
}
