//! Stop-the-world collection phase machine.
//!
//! A cycle runs the phases of [`CollectionPhase::CYCLE`] strictly in order.
//! Between cycles the heap is [`CollectionPhase::Idle`] and only then may
//! write barriers run.

use std::{collections::HashSet, mem};

use log::{debug, info, trace, warn};
use object::Value;

use crate::{
    BridgePolicy, HeapInner,
    bridge::{self, TracedMarker},
    delete::Cascade,
    rc,
    space::Space,
    stats::{CollectionStats, CycleStats},
    zct::{EntryState, ZeroCountTable},
};

/// Addresses of counted objects directly referenced by a root.
pub(crate) type RootedSet = HashSet<usize, ahash::RandomState>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionPhase {
    /// Mutators running, no collection in progress.
    #[default]
    Idle = 0,
    /// Reset per-cycle bookkeeping.
    Prepare,
    /// Merge the zero-count buffers into the cycle's table.
    PrepareZct,
    /// Resurrect table entries referenced by roots; trace the traced space.
    RootClosure,
    /// Free the remaining table entries and cascade.
    ProcessZct,
    /// Trace from the remembered set.
    CompleteClosure,
    /// Sweep the traced space and reset allocator state.
    Release,
    /// Record statistics and return to idle.
    Finish,
}

impl CollectionPhase {
    pub const CYCLE: [CollectionPhase; 7] = [
        CollectionPhase::Prepare,
        CollectionPhase::PrepareZct,
        CollectionPhase::RootClosure,
        CollectionPhase::ProcessZct,
        CollectionPhase::CompleteClosure,
        CollectionPhase::Release,
        CollectionPhase::Finish,
    ];

    /// The only phase allowed to follow this one.
    pub fn successor(self) -> Self {
        match self {
            Self::Idle => Self::Prepare,
            Self::Prepare => Self::PrepareZct,
            Self::PrepareZct => Self::RootClosure,
            Self::RootClosure => Self::ProcessZct,
            Self::ProcessZct => Self::CompleteClosure,
            Self::CompleteClosure => Self::Release,
            Self::Release => Self::Finish,
            Self::Finish => Self::Idle,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Prepare,
            2 => Self::PrepareZct,
            3 => Self::RootClosure,
            4 => Self::ProcessZct,
            5 => Self::CompleteClosure,
            6 => Self::Release,
            7 => Self::Finish,
            _ => Self::Idle,
        }
    }
}

/// Kinds of non-strong references a host may register. None of them is
/// supported; registered references are dropped at the next
/// [`CollectionPhase::Prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Weak,
    Soft,
    Phantom,
    Finalizable,
}

/// What one mutator hands to a collection.
#[derive(Debug, Default)]
pub struct CycleInput {
    pub roots: Vec<Value>,
    /// Objects whose count dropped to zero, duplicates allowed.
    pub zero_counts: Vec<usize>,
    /// Counted objects that stored a traced pointer.
    pub remembered: Vec<usize>,
    pub references: Vec<(ReferenceKind, Value)>,
}

impl CycleInput {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
            && self.zero_counts.is_empty()
            && self.remembered.is_empty()
            && self.references.is_empty()
    }
}

/// Collector state shared by all cycles, owned by the heap.
#[derive(Debug, Default)]
pub(crate) struct CollectorContext {
    phase: CollectionPhase,
    /// Inputs submitted since the last cycle consumed them.
    pending: Vec<CycleInput>,
    table: ZeroCountTable,
    rooted: RootedSet,
    /// Zero-count objects kept alive this cycle, re-examined next cycle.
    carry: Vec<usize>,
    remembered: Vec<usize>,
    cycle: CycleStats,
    pub stats: CollectionStats,
}

impl CollectorContext {
    pub fn submit(&mut self, input: CycleInput) {
        if !input.is_empty() {
            self.pending.push(input);
        }
    }

    /// Runs `phase`, which must be the successor of the last one run.
    pub fn collection_phase(
        &mut self,
        heap: &HeapInner,
        phase: CollectionPhase,
    ) {
        if phase != self.phase.successor() || phase == CollectionPhase::Idle {
            phase_out_of_order(self.phase, phase);
        }
        heap.set_phase(phase);
        self.phase = phase;
        debug!("collection phase {phase:?}");

        match phase {
            CollectionPhase::Prepare => self.prepare(heap),
            CollectionPhase::PrepareZct => self.prepare_zct(heap),
            CollectionPhase::RootClosure => self.root_closure(heap),
            CollectionPhase::ProcessZct => self.process_zct(heap),
            CollectionPhase::CompleteClosure => self.complete_closure(heap),
            CollectionPhase::Release => self.release(heap),
            CollectionPhase::Finish => {
                self.finish(heap);
                self.phase = CollectionPhase::Idle;
                heap.set_phase(CollectionPhase::Idle);
            }
            CollectionPhase::Idle => unreachable!(),
        }
    }

    fn prepare(&mut self, heap: &HeapInner) {
        self.cycle = CycleStats::default();
        self.table = ZeroCountTable::default();
        self.rooted.clear();

        let references: usize = self
            .pending
            .iter_mut()
            .map(|input| mem::take(&mut input.references).len())
            .sum();
        if references > 0 {
            warn!(
                "cleared {references} weak/soft/phantom/finalizable \
                 references (unsupported)"
            );
        }

        if let Some(traced) = &heap.traced {
            traced.prepare();
        }
        if heap.settings.counted_sweep {
            heap.counted.clear_all_live_bits();
        }
    }

    fn prepare_zct(&mut self, heap: &HeapInner) {
        let mut candidates = mem::take(&mut self.carry);
        for input in &mut self.pending {
            candidates.append(&mut input.zero_counts);
            self.remembered.append(&mut input.remembered);
        }

        self.table = ZeroCountTable::with_capacity(candidates.len());
        for addr in candidates {
            let obj = addr as *const u8;
            // freed eagerly, or counted again since it was buffered
            // SAFETY: count read only for allocated cells
            if !heap.counted.is_allocated(obj)
                || unsafe { rc::is_live_rc(obj) }
            {
                continue;
            }
            if self.table.insert(addr) {
                heap.counted.clear_live_bit(obj);
            }
        }

        self.cycle.zct_entries = self.table.len();
        debug!("zero-count table: {} entries", self.table.len());
    }

    fn root_closure(&mut self, heap: &HeapInner) {
        let mut marker = TracedMarker::new(heap);

        for input in self.pending.drain(..) {
            for root in input.roots {
                if heap.is_counted(root) {
                    let addr = root.as_ptr() as usize;
                    self.rooted.insert(addr);
                    if self.table.resurrect(addr) {
                        heap.counted.set_live_bit(root.as_ptr());
                        self.cycle.resurrected += 1;
                        trace!("resurrected {:p}", root.as_ptr());
                    }
                } else if heap.is_traced(root) {
                    if let Some(marker) = marker.as_mut() {
                        marker.mark(root.as_ptr());
                    }
                }
            }
        }

        if let Some(mut marker) = marker {
            marker.drain();
            self.cycle.traced_marked += marker.marked;
        }
    }

    fn process_zct(&mut self, heap: &HeapInner) {
        let mut cascade = Cascade::new(heap, Some(&self.rooted));

        for addr in self.table.entries_in(EntryState::Pending) {
            let obj = addr as *const u8;
            debug_assert!(heap.counted.is_allocated(obj));
            debug_assert!(!self.rooted.contains(&addr));
            cascade.free(obj);
            self.table.mark_freed(addr);
        }

        self.cycle.freed_cells += cascade.freed_cells;
        self.cycle.freed_bytes += cascade.freed_bytes;
        self.carry.append(&mut cascade.carried);

        for addr in self.table.entries_in(EntryState::Resurrected) {
            // SAFETY: resurrected entries are allocated
            if !unsafe { rc::is_live_rc(addr as *const u8) } {
                self.carry.push(addr);
            }
        }
    }

    fn complete_closure(&mut self, heap: &HeapInner) {
        if heap.settings.bridge_policy != BridgePolicy::Remembered {
            return;
        }
        let Some(mut marker) = TracedMarker::new(heap) else {
            return;
        };

        bridge::refresh_remembered(heap, &mut self.remembered);
        for &addr in &self.remembered {
            marker.scan_counted(addr as *const u8);
        }
        marker.drain();
        self.cycle.traced_marked += marker.marked;
    }

    fn release(&mut self, heap: &HeapInner) {
        let mut cascade = Cascade::new(heap, Some(&self.rooted));

        if let Some(traced) = &heap.traced {
            let release_counts =
                heap.settings.bridge_policy == BridgePolicy::Remembered;
            self.cycle.traced_swept = traced.sweep(&mut |dead| {
                if release_counts {
                    cascade.release_children(dead);
                    cascade.drain();
                }
            });
        }

        if heap.settings.counted_sweep {
            let rooted = &self.rooted;
            let mut swept_bytes = 0;
            let swept = heap.counted.sweep_cells(&mut |cell| {
                // SAFETY: the sweep only offers allocated cells
                if unsafe { rc::is_live_rc(cell) }
                    || rooted.contains(&(cell as usize))
                {
                    heap.counted.set_live_bit(cell);
                    return true;
                }
                swept_bytes += heap.counted.cell_size(cell);
                cascade.release_children(cell);
                cascade.drain();
                false
            });
            if swept > 0 {
                warn!(
                    "counted sweep freed {swept} cells missed by the \
                     zero-count table"
                );
            }
            self.cycle.counted_swept = swept;
            self.cycle.freed_cells += swept;
            self.cycle.freed_bytes += swept_bytes;
        }

        self.cycle.freed_cells += cascade.freed_cells;
        self.cycle.freed_bytes += cascade.freed_bytes;
        self.carry.append(&mut cascade.carried);
    }

    fn finish(&mut self, heap: &HeapInner) {
        self.carry.sort_unstable();
        self.carry.dedup();
        self.cycle.carried = self.carry.len();
        self.stats.record(self.cycle);
        heap.reset_allocation_counter();

        let counted = heap.counted.usage();
        info!(
            "cycle {}: {} zero-count entries, {} resurrected, \
             {} cells ({} bytes) freed, {} carried, {} traced swept; \
             counted space {} cells / {} bytes",
            self.stats.cycles,
            self.cycle.zct_entries,
            self.cycle.resurrected,
            self.cycle.freed_cells,
            self.cycle.freed_bytes,
            self.cycle.carried,
            self.cycle.traced_swept,
            counted.cells,
            counted.bytes,
        );
    }

    /// Whether `obj` is in the current cycle's table, and in which state.
    pub fn table_state(&self, obj: *const u8) -> Option<EntryState> {
        self.table.state(obj as usize)
    }

    pub fn carried(&self) -> &[usize] {
        &self.carry
    }
}

#[cold]
#[inline(never)]
fn phase_out_of_order(
    current: CollectionPhase,
    requested: CollectionPhase,
) -> ! {
    panic!("collection phase out of order: {current:?} -> {requested:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_is_the_successor_chain() {
        let mut phase = CollectionPhase::Idle;
        for expected in CollectionPhase::CYCLE {
            phase = phase.successor();
            assert_eq!(phase, expected);
        }
        assert_eq!(phase.successor(), CollectionPhase::Idle);
    }

    #[test]
    fn raw_round_trip() {
        for phase in CollectionPhase::CYCLE {
            assert_eq!(CollectionPhase::from_u8(phase as u8), phase);
        }
        assert_eq!(CollectionPhase::from_u8(0), CollectionPhase::Idle);
    }

    #[test]
    fn empty_inputs_are_not_kept() {
        let mut context = CollectorContext::default();
        context.submit(CycleInput::default());
        assert!(context.pending.is_empty());
        context.submit(CycleInput {
            zero_counts: vec![0x1000],
            ..Default::default()
        });
        assert_eq!(context.pending.len(), 1);
    }
}
