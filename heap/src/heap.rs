//! Hybrid reference counting heap.
//!
//! Objects live in a counted free-list space, optionally next to a traced
//! mark-sweep space. Counts are maintained by the write barriers on every
//! heap store; objects whose count drops to zero are resolved by a
//! stop-the-world collection that checks them against the roots.
//!
//! This crate is decoupled from any specific VM. Consumers provide:
//! - A [`ScanFn`] to enumerate Value edges of heap objects.
//! - A [`RootProvider`] to supply live roots at collection time.
//! - Optionally a [`StoreDelegate`] for the raw slot accesses.

use std::{
    alloc::Layout,
    collections::HashMap,
    mem,
    ops::Deref,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::{debug, warn};
use object::{Bytes, Header, ObjectType, Tuple, Value};
use parking_lot::Mutex;

use crate::{
    AtomicStore, CollectionPhase, CollectionStats, CycleInput, DeleteStrategy,
    HeapSettings, InitialCount, ReferenceKind, SettingsError, StoreDelegate,
    phase::CollectorContext,
    rc,
    space::{
        FreeListLocal, FreeListSpace, MarkSweepSpace, Space, SpaceKind,
        SpaceUsage,
    },
    sync::{HandOver, SyncState},
    zct::{EntryState, ZeroCountBuffer},
};

// ── Public API types ──────────────────────────────────────────────────

/// Function that enumerates all Value edges of a heap object.
///
/// Given a pointer to a heap object (whose first bytes are an
/// [`object::Header`]), the function must call `visitor` for every [`Value`]
/// field that may be a heap reference.
///
/// # Safety
///
/// `obj` must point to a valid, allocated heap object with a valid [`Header`].
pub type ScanFn =
    unsafe fn(obj: *const u8, visitor: &mut dyn FnMut(&mut Value));

/// Consumers implement this to provide roots.
///
/// Called at safepoints to discover live roots from VM state (stacks,
/// registers, globals). Roots are never counted.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// A counted object whose count disagrees with the heap slots pointing at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountMismatch {
    pub object: usize,
    pub expected: u32,
    pub actual: u32,
}

// ── Trackers / sync ───────────────────────────────────────────────────

/// Global atomic counters.
#[derive(Debug, Default)]
pub struct Trackers {
    /// Bytes handed out since the last cycle, as flushed by mutators.
    pub allocated_since_gc: AtomicUsize,
    pub eager_freed: AtomicUsize,
}

// ── HeapInner ─────────────────────────────────────────────────────────

/// Core shared heap state.
#[derive(Debug)]
pub struct HeapInner {
    pub settings: HeapSettings,
    pub counted: FreeListSpace,
    pub traced: Option<MarkSweepSpace>,
    pub scan_fn: ScanFn,
    pub store: Box<dyn StoreDelegate>,
    pub track: Trackers,
    pub sync: SyncState,
    collector: Mutex<CollectorContext>,
}

impl HeapInner {
    pub fn new(
        settings: HeapSettings,
        scan_fn: ScanFn,
        store: Box<dyn StoreDelegate>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;

        let counted = FreeListSpace::new(
            SpaceKind::Counted,
            settings.counted_size,
            settings.block_size,
            settings.refill_batch,
        )
        .ok_or(SettingsError::MapFailed(settings.counted_size))?;

        let traced = if settings.has_traced_space() {
            let space = MarkSweepSpace::new(
                settings.traced_size,
                settings.block_size,
                settings.refill_batch,
            )
            .ok_or(SettingsError::MapFailed(settings.traced_size))?;
            if settings.bridge_policy == crate::BridgePolicy::Baseline {
                warn!(
                    "baseline bridge: traced objects held only by counted \
                     objects may be reclaimed, counted objects held by dead \
                     traced objects leak"
                );
            }
            Some(space)
        } else {
            None
        };

        debug!("heap created: {settings:?}");

        Ok(Self {
            settings,
            counted,
            traced,
            scan_fn,
            store,
            track: Trackers::default(),
            sync: SyncState::default(),
            collector: Mutex::new(CollectorContext::default()),
        })
    }

    // ── Classification ────────────────────────────────────────────────

    /// Whether `value` references the counted space.
    #[inline(always)]
    pub fn is_counted(&self, value: Value) -> bool {
        value.is_ref() && self.counted.contains(value.as_ptr())
    }

    /// Whether `value` references the traced space.
    #[inline(always)]
    pub fn is_traced(&self, value: Value) -> bool {
        value.is_ref()
            && self
                .traced
                .as_ref()
                .is_some_and(|traced| traced.contains(value.as_ptr()))
    }

    /// Whether `value` references an allocated object of either space.
    pub fn is_allocated(&self, value: Value) -> bool {
        value.is_ref()
            && self
                .spaces()
                .any(|space| space.is_allocated(value.as_ptr()))
    }

    pub fn spaces(&self) -> impl Iterator<Item = &dyn Space> {
        std::iter::once(&self.counted as &dyn Space)
            .chain(self.traced.as_ref().map(|traced| traced as &dyn Space))
    }

    pub fn counted_usage(&self) -> SpaceUsage {
        self.counted.usage()
    }

    pub fn traced_usage(&self) -> Option<SpaceUsage> {
        self.traced.as_ref().map(|traced| traced.usage())
    }

    // ── Phase machine ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn phase(&self) -> CollectionPhase {
        self.sync.state.load(Ordering::Acquire).phase
    }

    pub(crate) fn set_phase(&self, phase: CollectionPhase) {
        self.sync.state.set_phase(phase);
    }

    /// Runs one collection phase.
    ///
    /// For hosts that drive the stop-the-world cycle themselves: all
    /// mutators must be stopped and have [submitted](HeapInner::submit)
    /// their inputs before [`CollectionPhase::Prepare`]. Phases must come in
    /// the order of [`CollectionPhase::CYCLE`]; anything else is fatal.
    pub fn collection_phase(&self, phase: CollectionPhase) {
        self.collector.lock().collection_phase(self, phase);
    }

    /// Hands a mutator's roots and buffers to the next cycle.
    pub fn submit(&self, input: CycleInput) {
        self.collector.lock().submit(input);
    }

    /// Runs a whole cycle. Mutators must be stopped.
    pub fn run_cycle(&self) {
        for phase in CollectionPhase::CYCLE {
            self.collection_phase(phase);
        }
    }

    pub fn stats(&self) -> CollectionStats {
        let mut stats = self.collector.lock().stats;
        stats.eager_freed = self.track.eager_freed.load(Ordering::Relaxed);
        stats
    }

    /// State of `obj` in the table of the current or most recent cycle.
    pub fn zct_state(&self, obj: Value) -> Option<EntryState> {
        self.collector.lock().table_state(obj.as_ptr())
    }

    /// Whether `obj` is waiting in the carry-over for the next cycle.
    pub fn is_carried(&self, obj: Value) -> bool {
        let addr = obj.as_ptr() as usize;
        self.collector.lock().carried().contains(&addr)
    }

    pub(crate) fn reset_allocation_counter(&self) {
        self.track.allocated_since_gc.store(0, Ordering::Relaxed);
    }

    // ── Rendezvous ────────────────────────────────────────────────────

    /// Joins the requested stop with `input`; the coordinator also runs
    /// the cycle. Does nothing if no stop is requested.
    pub fn rendezvous(&self, is_coordinator: bool, input: CycleInput) {
        self.sync.stop_the_world(
            is_coordinator,
            || self.submit(input),
            || self.run_cycle(),
        );
    }

    // ── Diagnostics ───────────────────────────────────────────────────

    /// Recomputes every counted object's count from the heap slots of both
    /// spaces and reports the objects whose stored count differs.
    ///
    /// Only meaningful while no mutator runs. Under [`InitialCount::One`]
    /// unreleased allocation references show up as mismatches, as do
    /// counted non-heap slots.
    pub fn verify_counts(&self) -> Vec<CountMismatch> {
        let mut expected: HashMap<usize, u32, ahash::RandomState> =
            HashMap::default();
        let scan_fn = self.scan_fn;
        for space in self.spaces() {
            space.for_each_allocated(&mut |obj| {
                // SAFETY: allocated objects are initialized
                unsafe {
                    scan_fn(obj, &mut |slot| {
                        if self.is_counted(*slot) {
                            let addr = slot.as_ptr() as usize;
                            *expected.entry(addr).or_default() += 1;
                        }
                    })
                };
            });
        }

        let mut mismatches = Vec::new();
        self.counted.for_each_allocated(&mut |obj| {
            // SAFETY: allocated
            let actual = unsafe { rc::get_rc(obj) };
            let expected = expected.get(&(obj as usize)).copied().unwrap_or(0);
            if actual != expected {
                mismatches.push(CountMismatch {
                    object: obj as usize,
                    expected,
                    actual,
                });
            }
        });
        mismatches
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    /// # Panics
    ///
    /// On invalid settings or if the spaces cannot be mapped.
    #[must_use]
    pub fn new(settings: HeapSettings, scan_fn: ScanFn) -> Self {
        match Self::try_new(settings, scan_fn) {
            Ok(heap) => heap,
            Err(err) => panic!("Invalid Heap Settings: {err}"),
        }
    }

    pub fn try_new(
        settings: HeapSettings,
        scan_fn: ScanFn,
    ) -> Result<Self, SettingsError> {
        Self::with_store(settings, scan_fn, Box::new(AtomicStore))
    }

    pub fn with_store(
        settings: HeapSettings,
        scan_fn: ScanFn,
        store: Box<dyn StoreDelegate>,
    ) -> Result<Self, SettingsError> {
        HeapInner::new(settings, scan_fn, store)
            .map(|inner| Self(Arc::new(inner)))
    }

    #[must_use]
    pub fn proxy(&self) -> HeapProxy {
        HeapProxy::new(self.clone())
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── HeapProxy (per-mutator state) ─────────────────────────────────────

/// Per-mutator allocator and barrier state.
///
/// Holds the thread's free-list caches and zero-count buffer; both merge
/// into the shared heap only at a collection or when the proxy drops.
#[derive(Debug)]
pub struct HeapProxy {
    pub heap: Heap,
    pub(crate) counted_local: FreeListLocal,
    pub(crate) traced_local: FreeListLocal,
    pub(crate) zct: ZeroCountBuffer,
    pub(crate) remember: Vec<usize>,
    references: Vec<(ReferenceKind, Value)>,
    /// Bytes allocated since the last flush into the global tracker.
    pub allocated: usize,
}

impl HeapProxy {
    #[must_use]
    pub fn new(heap: Heap) -> Self {
        let mutators = heap.sync.state.register_mutator().mutators;
        if heap.settings.delete_strategy == DeleteStrategy::Eager
            && mutators > 1
        {
            warn!(
                "eager deletion with {mutators} mutators: frees race with \
                 unscanned roots"
            );
        }

        Self {
            heap,
            counted_local: FreeListLocal::new(),
            traced_local: FreeListLocal::new(),
            zct: ZeroCountBuffer::default(),
            remember: Vec::with_capacity(32),
            references: Vec::new(),
            allocated: 0,
        }
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a counted object of type `ty` with a fresh header.
    ///
    /// The rest of the cell is zeroed. Under [`InitialCount::Zero`] the
    /// object must be stored into the heap or reported as a root before
    /// the next safepoint, or the collection there reclaims it.
    pub fn allocate(
        &mut self,
        ty: ObjectType,
        layout: Layout,
        roots: &mut dyn RootProvider,
    ) -> NonNull<u8> {
        let ptr = self.allocate_cell(SpaceKind::Counted, layout, roots);
        let obj = ptr.as_ptr() as *const u8;
        // SAFETY: fresh zeroed cell, large enough for a header
        unsafe { ptr.cast::<Header>().write(Header::new(ty)) };

        match self.heap.settings.initial_count {
            InitialCount::Zero => {
                // SAFETY: header just written
                unsafe { rc::initialize_header(obj, false) };
                self.zct.push(obj);
            }
            // SAFETY: header just written
            InitialCount::One => unsafe { rc::initialize_header(obj, true) },
        }
        ptr
    }

    /// Allocates an object of type `ty` in the traced space.
    ///
    /// # Panics
    ///
    /// If the heap has no traced space.
    pub fn allocate_traced(
        &mut self,
        ty: ObjectType,
        layout: Layout,
        roots: &mut dyn RootProvider,
    ) -> NonNull<u8> {
        assert!(self.heap.traced.is_some(), "traced space disabled");
        let ptr = self.allocate_cell(SpaceKind::Traced, layout, roots);
        // SAFETY: fresh zeroed cell, large enough for a header
        unsafe { ptr.cast::<Header>().write(Header::new(ty)) };
        ptr
    }

    fn allocate_cell(
        &mut self,
        kind: SpaceKind,
        layout: Layout,
        roots: &mut dyn RootProvider,
    ) -> NonNull<u8> {
        self.safepoint(roots);

        // Fast path: local free list has a cell.
        let ptr = match self.try_allocate(kind, layout) {
            Some(ptr) => ptr,
            None => self.allocate_slow(kind, layout, roots),
        };
        self.allocated += layout.size();
        ptr
    }

    #[inline]
    fn try_allocate(
        &mut self,
        kind: SpaceKind,
        layout: Layout,
    ) -> Option<NonNull<u8>> {
        let size = layout.size().max(size_of::<Header>());
        match kind {
            SpaceKind::Counted => {
                self.heap
                    .counted
                    .alloc(&mut self.counted_local, size, layout.align(), 0)
            }
            SpaceKind::Traced => self.heap.traced.as_ref()?.alloc(
                &mut self.traced_local,
                size,
                layout.align(),
                0,
            ),
        }
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(
        &mut self,
        kind: SpaceKind,
        layout: Layout,
        roots: &mut dyn RootProvider,
    ) -> NonNull<u8> {
        debug!("{kind:?} space exhausted, collecting");
        self.collect(roots);

        if let Some(ptr) = self.try_allocate(kind, layout) {
            return ptr;
        }

        panic!("out of memory");
    }

    /// Allocates a tuple of `len` nil slots.
    pub fn allocate_tuple(
        &mut self,
        len: usize,
        roots: &mut dyn RootProvider,
    ) -> Value {
        let layout = tuple_layout(len);
        let ptr = self.allocate(ObjectType::Tuple, layout, roots);
        // SAFETY: allocated with room for `len` slots
        unsafe { ptr.cast::<Tuple>().as_mut().init(len) };
        Value::from_ptr(ptr.as_ptr())
    }

    /// Allocates a tuple of `len` nil slots in the traced space.
    pub fn allocate_traced_tuple(
        &mut self,
        len: usize,
        roots: &mut dyn RootProvider,
    ) -> Value {
        let layout = tuple_layout(len);
        let ptr = self.allocate_traced(ObjectType::Tuple, layout, roots);
        // SAFETY: allocated with room for `len` slots
        unsafe { ptr.cast::<Tuple>().as_mut().init(len) };
        Value::from_ptr(ptr.as_ptr())
    }

    /// Allocates a counted byte object holding `data`.
    pub fn allocate_bytes(
        &mut self,
        data: &[u8],
        roots: &mut dyn RootProvider,
    ) -> Value {
        let size = Bytes::required_size(data.len());
        let layout = Layout::from_size_align(size, align_of::<Bytes>())
            .unwrap_or_else(|_| {
                panic!("{} bytes exceed the address space", data.len())
            });
        let ptr = self.allocate(ObjectType::Bytes, layout, roots);
        // SAFETY: allocated with room for `data`
        unsafe { ptr.cast::<Bytes>().as_mut().init(data) };
        Value::from_ptr(ptr.as_ptr())
    }

    /// Gives up the allocation reference of an object allocated under
    /// [`InitialCount::One`].
    pub fn release(&mut self, obj: Value) {
        assert!(
            self.heap.settings.initial_count == InitialCount::One,
            "release requires InitialCount::One"
        );
        if self.heap.is_counted(obj) {
            // SAFETY: the allocation reference is part of the count
            unsafe { self.delete(obj.as_ptr()) };
        }
    }

    // ── Tuple field access ────────────────────────────────────────────

    fn tuple(&self, obj: Value) -> &Tuple {
        assert!(
            self.heap.is_allocated(obj),
            "{obj:?} is not an allocated object"
        );
        // SAFETY: allocated objects carry an initialized header
        let tuple = unsafe { obj.as_ref::<Tuple>() };
        assert_eq!(
            tuple.header.object_type(),
            ObjectType::Tuple,
            "{obj:?} is not a tuple"
        );
        tuple
    }

    fn field_slot(&self, obj: Value, index: usize) -> *mut Value {
        let tuple = self.tuple(obj);
        assert!(index < tuple.len(), "index {index} out of bounds for {obj:?}");
        // SAFETY: index checked
        unsafe { tuple.slot(index) }
    }

    pub fn read_field(&self, obj: Value, index: usize) -> Value {
        let slot = self.field_slot(obj, index);
        // SAFETY: slot of an allocated tuple
        unsafe { self.heap.store.load(Some(obj), slot) }
    }

    /// Stores `target` into field `index` of tuple `obj` through the write
    /// barrier.
    pub fn write_field(&mut self, obj: Value, index: usize, target: Value) {
        self.check_target(target);
        let slot = self.field_slot(obj, index);
        // SAFETY: obj is an allocated tuple, slot in bounds, target checked
        unsafe { self.write_barrier(obj, slot, target) };
    }

    /// Compare-and-swap on field `index` of tuple `obj`.
    pub fn compare_and_swap_field(
        &mut self,
        obj: Value,
        index: usize,
        expected: Value,
        target: Value,
    ) -> bool {
        self.check_target(target);
        let slot = self.field_slot(obj, index);
        // SAFETY: as in write_field
        unsafe { self.write_barrier_cas(obj, slot, expected, target) }
    }

    /// Copies `len` fields of `src` starting at `src_index` to `dst`
    /// starting at `dst_index`. The two ranges may overlap.
    pub fn copy_fields(
        &mut self,
        src: Value,
        src_index: usize,
        dst: Value,
        dst_index: usize,
        len: usize,
    ) {
        if len == 0 {
            return;
        }
        let src_slots = self.field_slot(src, src_index);
        self.field_slot(src, src_index + len - 1);
        let dst_slots = self.field_slot(dst, dst_index);
        self.field_slot(dst, dst_index + len - 1);
        // SAFETY: both ranges checked against their tuples
        unsafe { self.write_barrier_copy(src, src_slots, dst, dst_slots, len) };
    }

    fn check_target(&self, target: Value) {
        if target.is_ref() {
            assert!(
                self.heap.is_allocated(target),
                "{target:?} is not an allocated object"
            );
        }
    }

    // ── References ────────────────────────────────────────────────────

    /// Registers a non-strong reference. Unsupported: it is logged and
    /// dropped at the next collection.
    pub fn register_reference(
        &mut self,
        kind: ReferenceKind,
        reference: Value,
    ) {
        self.references.push((kind, reference));
    }

    // ── Safepoint / collection ────────────────────────────────────────

    /// Checks if a collection is required or already in progress.
    #[inline(never)]
    pub fn safepoint(&mut self, roots: &mut dyn RootProvider) {
        if self.heap.sync.state.load(Ordering::Relaxed).stop_requested {
            let input = self.collect_cycle_input(roots);
            self.heap.rendezvous(false, input);
            return;
        }

        let settings = &self.heap.settings;
        let global_alloc =
            self.heap.track.allocated_since_gc.load(Ordering::Relaxed);
        if global_alloc + self.allocated > settings.bytes_before_gc
            || self.zct.len() > settings.zct_buffer_limit
        {
            self.collect(roots);
        }
    }

    /// Runs a collection, or joins the one already requested.
    #[cold]
    pub fn collect(&mut self, roots: &mut dyn RootProvider) {
        self.heap
            .track
            .allocated_since_gc
            .fetch_add(self.allocated, Ordering::Relaxed);
        self.allocated = 0;

        let (is_coord, state) = self.heap.sync.state.request_stop();
        if is_coord {
            debug!(
                "cycle {} requested with {} mutators",
                state.cycle, state.mutators
            );
        }

        let input = self.collect_cycle_input(roots);
        self.heap.rendezvous(is_coord, input);
    }

    /// Snapshot roots and hand over the local buffers.
    pub fn collect_cycle_input(
        &mut self,
        roots: &mut dyn RootProvider,
    ) -> CycleInput {
        let mut root_values = Vec::new();
        roots.visit_roots(&mut |value| {
            root_values.push(*value);
        });
        self.allocated = 0;
        CycleInput {
            roots: root_values,
            ..self.take_buffers()
        }
    }

    fn take_buffers(&mut self) -> CycleInput {
        CycleInput {
            roots: Vec::new(),
            zero_counts: self.zct.take(),
            remembered: mem::take(&mut self.remember),
            references: mem::take(&mut self.references),
        }
    }

    /// Zero-count entries buffered by this mutator since the last cycle.
    pub fn buffered_zero_counts(&self) -> usize {
        self.zct.len()
    }
}

fn tuple_layout(len: usize) -> Layout {
    Layout::from_size_align(Tuple::required_size(len), align_of::<Tuple>())
        .unwrap_or_else(|_| {
            panic!("tuple of {len} slots exceeds the address space")
        })
}

impl Drop for HeapProxy {
    fn drop(&mut self) {
        self.heap.counted.flush(&mut self.counted_local);
        if let Some(traced) = &self.heap.traced {
            traced.flush(&mut self.traced_local);
        }

        // still counted as participant until deregistered
        let mut leftovers = self.take_buffers();
        let heap = &self.heap;
        heap.sync.leave(|step| {
            let input = mem::take(&mut leftovers);
            match step {
                HandOver::Join => heap.rendezvous(false, input),
                HandOver::Submit if !input.is_empty() => heap.submit(input),
                HandOver::Submit => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::scan_object;

    const BLOCK: usize = 4096;

    struct TestRoots {
        roots: Vec<Value>,
    }

    impl RootProvider for TestRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
            for root in &mut self.roots {
                visitor(root);
            }
        }
    }

    fn create_test_env(settings: HeapSettings) -> (Heap, HeapProxy, TestRoots) {
        let heap = Heap::new(settings, scan_object);
        let proxy = heap.proxy();
        (heap, proxy, TestRoots { roots: Vec::new() })
    }

    fn small_settings() -> HeapSettings {
        HeapSettings {
            counted_size: 64 * BLOCK,
            traced_size: 16 * BLOCK,
            block_size: BLOCK,
            refill_batch: 8,
            bytes_before_gc: usize::MAX / 2,
            zct_buffer_limit: usize::MAX / 2,
            ..Default::default()
        }
    }

    fn rc_of(value: Value) -> u32 {
        unsafe { rc::get_rc(value.as_ptr()) }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = HeapSettings {
            block_size: 1000,
            ..Default::default()
        };
        assert_eq!(
            Heap::try_new(settings, scan_object).unwrap_err(),
            SettingsError::BlockAlignment
        );
    }

    #[test]
    fn fresh_objects_start_at_zero_and_are_buffered() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let tuple = proxy.allocate_tuple(3, &mut roots);

        assert!(heap.is_counted(tuple));
        assert!(!heap.is_traced(tuple));
        assert_eq!(rc_of(tuple), 0);
        assert_eq!(proxy.buffered_zero_counts(), 1);
        for i in 0..3 {
            assert_eq!(proxy.read_field(tuple, i), Value::NIL);
        }
    }

    #[test]
    fn initial_count_one_until_released() {
        let settings = HeapSettings {
            initial_count: InitialCount::One,
            ..small_settings()
        };
        let (heap, mut proxy, mut roots) = create_test_env(settings);
        let tuple = proxy.allocate_tuple(1, &mut roots);
        assert_eq!(rc_of(tuple), 1);
        assert_eq!(proxy.buffered_zero_counts(), 0);

        proxy.release(tuple);
        assert_eq!(proxy.buffered_zero_counts(), 1);
        proxy.collect(&mut roots);
        assert!(!heap.is_allocated(tuple));
    }

    #[test]
    fn write_field_counts_the_target() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let parent = proxy.allocate_tuple(2, &mut roots);
        let child = proxy.allocate_tuple(0, &mut roots);

        proxy.write_field(parent, 0, child);
        proxy.write_field(parent, 1, child);
        assert_eq!(rc_of(child), 2);

        proxy.write_field(parent, 0, Value::from_i64(7));
        assert_eq!(rc_of(child), 1);
        assert_eq!(proxy.read_field(parent, 0), Value::from_i64(7));
        let child_addr = child.as_ptr() as usize;
        assert!(heap.verify_counts().iter().all(|m| m.object != child_addr));
    }

    #[test]
    fn unrooted_garbage_is_collected() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let kept = proxy.allocate_tuple(1, &mut roots);
        let dropped = proxy.allocate_tuple(1, &mut roots);
        roots.roots.push(kept);

        proxy.collect(&mut roots);

        assert!(heap.is_allocated(kept));
        assert!(!heap.is_allocated(dropped));
        assert_eq!(heap.zct_state(kept), Some(EntryState::Resurrected));
        assert_eq!(heap.zct_state(dropped), Some(EntryState::Freed));
        assert!(heap.is_carried(kept));

        let stats = heap.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.last.zct_entries, 2);
        assert_eq!(stats.last.resurrected, 1);
        assert_eq!(stats.last.freed_cells, 1);
        assert_eq!(heap.phase(), CollectionPhase::Idle);
    }

    #[test]
    fn carried_objects_die_once_unrooted() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let obj = proxy.allocate_tuple(0, &mut roots);
        roots.roots.push(obj);
        proxy.collect(&mut roots);
        assert!(heap.is_allocated(obj));

        roots.roots.clear();
        proxy.collect(&mut roots);
        assert!(!heap.is_allocated(obj));
    }

    #[test]
    fn stored_objects_leave_the_table() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let parent = proxy.allocate_tuple(1, &mut roots);
        let child = proxy.allocate_tuple(0, &mut roots);
        proxy.write_field(parent, 0, child);
        roots.roots.push(parent);

        proxy.collect(&mut roots);
        assert!(heap.is_allocated(child));
        assert_eq!(heap.zct_state(child), None);
    }

    #[test]
    fn traced_objects_survive_while_reachable() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let traced = proxy.allocate_traced_tuple(1, &mut roots);
        let counted = proxy.allocate_tuple(0, &mut roots);
        assert!(heap.is_traced(traced));

        proxy.write_field(traced, 0, counted);
        assert_eq!(rc_of(counted), 1);
        roots.roots.push(traced);

        proxy.collect(&mut roots);
        assert!(heap.is_allocated(traced));
        assert!(heap.is_allocated(counted));

        // the dead traced object gives up its count
        roots.roots.clear();
        proxy.collect(&mut roots);
        assert!(!heap.is_allocated(traced));
        assert!(!heap.is_allocated(counted));
        assert_eq!(heap.stats().last.traced_swept, 1);
    }

    #[test]
    fn manual_phases_run_a_cycle() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let obj = proxy.allocate_tuple(0, &mut roots);
        let input = proxy.collect_cycle_input(&mut roots);
        assert_eq!(input.zero_counts, vec![obj.as_ptr() as usize]);
        heap.submit(input);

        for phase in CollectionPhase::CYCLE {
            heap.collection_phase(phase);
            if phase != CollectionPhase::Finish {
                assert_eq!(heap.phase(), phase);
            }
        }
        assert_eq!(heap.phase(), CollectionPhase::Idle);
        assert!(!heap.is_allocated(obj));
    }

    #[test]
    #[should_panic(expected = "collection phase out of order")]
    fn skipping_a_phase_is_fatal() {
        let (heap, _proxy, _roots) = create_test_env(small_settings());
        heap.collection_phase(CollectionPhase::Prepare);
        heap.collection_phase(CollectionPhase::RootClosure);
    }

    #[test]
    #[should_panic(expected = "write barrier during collection")]
    fn barrier_outside_idle_is_fatal() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let obj = proxy.allocate_tuple(1, &mut roots);
        heap.collection_phase(CollectionPhase::Prepare);
        proxy.write_field(obj, 0, Value::from_i64(1));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn field_index_is_checked() {
        let (_heap, mut proxy, mut roots) = create_test_env(small_settings());
        let obj = proxy.allocate_tuple(2, &mut roots);
        proxy.write_field(obj, 2, Value::NIL);
    }

    #[test]
    fn bytes_are_not_scanned() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let bytes = proxy.allocate_bytes(b"hello", &mut roots);
        let tuple = proxy.allocate_tuple(1, &mut roots);
        proxy.write_field(tuple, 0, bytes);
        roots.roots.push(tuple);

        proxy.collect(&mut roots);
        assert!(heap.is_allocated(bytes));
        let data = unsafe { bytes.as_ref::<Bytes>().bytes() };
        assert_eq!(data, b"hello");
    }

    #[test]
    fn allocation_triggers_collection() {
        let settings = HeapSettings {
            bytes_before_gc: 1024,
            ..small_settings()
        };
        let (heap, mut proxy, mut roots) = create_test_env(settings);
        for _ in 0..200 {
            proxy.allocate_tuple(2, &mut roots);
        }
        assert!(heap.stats().cycles > 0);
        assert!(heap.counted_usage().cells < 200);
    }

    #[test]
    fn dropped_proxy_hands_over_its_buffer() {
        let (heap, mut proxy, mut roots) = create_test_env(small_settings());
        let obj = proxy.allocate_tuple(0, &mut roots);
        drop(proxy);

        let mut other = heap.proxy();
        other.collect(&mut roots);
        assert!(!heap.is_allocated(obj));
    }
}
