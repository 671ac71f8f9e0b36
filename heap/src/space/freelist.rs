//! Segregated free-list space.
//!
//! The mapped region is split into blocks. A block is claimed by one size
//! class and carved into cells of that size. Free cells of a class are kept
//! in a global chain; mutators take them in batches into a
//! [`FreeListLocal`] and allocate from there without locking.
//!
//! Requests above the largest size class get a large cell: a run of
//! whole blocks of its own. Freed runs are kept in a first-fit list,
//! merged with free neighbours and split on reuse.
//!
//! Side metadata keeps one byte per granule for "allocated" and one for
//! "live". Only the first granule of a cell is ever set.

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use log::{debug, trace};
use parking_lot::Mutex;

use super::{Space, SpaceKind, SpaceUsage};
use crate::system::MappedRegion;

/// Cell alignment and metadata resolution.
pub const GRANULE: usize = 16;

pub const SIZE_CLASSES: [usize; 16] = [
    16, 32, 48, 64, 80, 96, 128, 160, 192, 256, 384, 512, 768, 1024, 1536, 2048,
];

pub const MAX_CELL_SIZE: usize = SIZE_CLASSES[CLASS_COUNT - 1];

const CLASS_COUNT: usize = SIZE_CLASSES.len();
const NO_CLASS: u8 = u8::MAX;
const LARGE_HEAD: u8 = u8::MAX - 1;
const LARGE_TAIL: u8 = u8::MAX - 2;

#[inline]
fn size_class_for(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| class >= size)
}

/// What a block of the region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockUse {
    Unclaimed,
    /// Carved into cells of `SIZE_CLASSES[class]`.
    Class(usize),
    /// First block of a large run of that many blocks, allocated or free.
    Large(usize),
    /// Any later block of a large run.
    LargeTail,
}

/// A free cell stores the link to the next free cell in its first word.
#[repr(C)]
struct FreeCell {
    next: *mut FreeCell,
}

#[derive(Debug)]
struct FreeChain {
    head: *mut FreeCell,
    len: usize,
}

// SAFETY: the chain only links cells of the owning space and is mutex guarded.
unsafe impl Send for FreeChain {}

impl FreeChain {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    ///
    /// `cell` must be a free cell of this chain's class.
    #[inline]
    unsafe fn push(&mut self, cell: *mut FreeCell) {
        // SAFETY: guaranteed by caller
        unsafe { (*cell).next = self.head };
        self.head = cell;
        self.len += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<*mut FreeCell> {
        if self.head.is_null() {
            return None;
        }
        let cell = self.head;
        // SAFETY: chained cells are free and hold a valid link
        self.head = unsafe { (*cell).next };
        self.len -= 1;
        Some(cell)
    }
}

/// Per-mutator cache of free cells, one chain per size class.
#[derive(Debug)]
pub struct FreeListLocal {
    chains: [FreeChain; CLASS_COUNT],
}

// SAFETY: cells in the cache are owned by the mutator holding it.
unsafe impl Send for FreeListLocal {}

impl FreeListLocal {
    pub fn new() -> Self {
        Self {
            chains: [const { FreeChain::new() }; CLASS_COUNT],
        }
    }

    /// Number of cells held across all classes.
    pub fn cached_cells(&self) -> usize {
        self.chains.iter().map(|c| c.len).sum()
    }
}

impl Default for FreeListLocal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct FreeListSpace {
    kind: SpaceKind,
    region: MappedRegion,
    block_size: usize,
    block_count: usize,
    refill_batch: usize,
    /// Size class per block, `NO_CLASS` until claimed.
    block_classes: Box<[AtomicU8]>,
    /// Run length in blocks, set on the first block of each large run.
    large_runs: Box<[AtomicUsize]>,
    fresh_block_cursor: AtomicUsize,
    chains: Box<[Mutex<FreeChain>]>,
    /// Free large runs as (first block, blocks).
    large_free: Mutex<Vec<(usize, usize)>>,
    alloc_bits: Box<[AtomicU8]>,
    live_bits: Box<[AtomicU8]>,
    cells_in_use: AtomicUsize,
    bytes_in_use: AtomicUsize,
}

impl FreeListSpace {
    /// Maps `size` bytes. Returns `None` if the OS refuses the mapping.
    pub fn new(
        kind: SpaceKind,
        size: usize,
        block_size: usize,
        refill_batch: usize,
    ) -> Option<Self> {
        debug_assert!(block_size >= MAX_CELL_SIZE);
        debug_assert!(size.is_multiple_of(block_size));

        let region = MappedRegion::new(size)?;
        let block_count = size / block_size;
        let granules = size / GRANULE;

        let mut block_classes = Vec::with_capacity(block_count);
        block_classes.resize_with(block_count, || AtomicU8::new(NO_CLASS));
        let mut large_runs = Vec::with_capacity(block_count);
        large_runs.resize_with(block_count, || AtomicUsize::new(0));
        let mut chains = Vec::with_capacity(CLASS_COUNT);
        chains.resize_with(CLASS_COUNT, || Mutex::new(FreeChain::new()));
        let mut alloc_bits = Vec::with_capacity(granules);
        alloc_bits.resize_with(granules, || AtomicU8::new(0));
        let mut live_bits = Vec::with_capacity(granules);
        live_bits.resize_with(granules, || AtomicU8::new(0));

        debug!(
            "{kind:?} space: {size} bytes at {:p}, {block_count} blocks of \
             {block_size}",
            region.start()
        );

        Some(Self {
            kind,
            region,
            block_size,
            block_count,
            refill_batch,
            block_classes: block_classes.into_boxed_slice(),
            large_runs: large_runs.into_boxed_slice(),
            fresh_block_cursor: AtomicUsize::new(0),
            chains: chains.into_boxed_slice(),
            large_free: Mutex::new(Vec::new()),
            alloc_bits: alloc_bits.into_boxed_slice(),
            live_bits: live_bits.into_boxed_slice(),
            cells_in_use: AtomicUsize::new(0),
            bytes_in_use: AtomicUsize::new(0),
        })
    }

    // ── Metadata helpers ──────────────────────────────────────────────

    #[inline(always)]
    fn granule_index(&self, obj: *const u8) -> usize {
        self.region.offset_of(obj) / GRANULE
    }

    #[inline(always)]
    fn block_index(&self, obj: *const u8) -> usize {
        self.region.offset_of(obj) / self.block_size
    }

    #[inline(always)]
    fn block_start(&self, block: usize) -> *mut u8 {
        self.region.start().wrapping_add(block * self.block_size)
    }

    #[inline(always)]
    fn block_use(&self, block: usize) -> BlockUse {
        match self.block_classes[block].load(Ordering::Acquire) {
            NO_CLASS => BlockUse::Unclaimed,
            LARGE_HEAD => {
                BlockUse::Large(self.large_runs[block].load(Ordering::Acquire))
            }
            LARGE_TAIL => BlockUse::LargeTail,
            class => BlockUse::Class(class as usize),
        }
    }

    /// Size of the cell starting at `obj`.
    pub fn cell_size(&self, obj: *const u8) -> usize {
        match self.block_use(self.block_index(obj)) {
            BlockUse::Class(class) => SIZE_CLASSES[class],
            BlockUse::Large(blocks) => blocks * self.block_size,
            _ => not_a_cell(obj),
        }
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a zeroed cell of at least `size` bytes such that
    /// `cell + offset` is aligned to `align`.
    ///
    /// Returns `None` when neither the local cache, the global chain nor a
    /// fresh block can supply a cell.
    pub fn alloc(
        &self,
        local: &mut FreeListLocal,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Option<NonNull<u8>> {
        assert!(
            align.is_power_of_two() && align <= GRANULE,
            "unsupported alignment {align}"
        );
        assert!(offset.is_multiple_of(align), "unsupported offset {offset}");
        let Some(class) = size_class_for(size) else {
            return self.alloc_large(size);
        };

        let cell = match local.chains[class].pop() {
            Some(cell) => cell,
            None => {
                if !self.refill(local, class) {
                    return None;
                }
                local.chains[class].pop()?
            }
        };

        self.claim_cell(cell as *mut u8, SIZE_CLASSES[class])
    }

    /// Marks a free cell allocated and live, and zeroes it.
    fn claim_cell(
        &self,
        cell: *mut u8,
        cell_size: usize,
    ) -> Option<NonNull<u8>> {
        let idx = self.granule_index(cell);
        let prev = self.alloc_bits[idx].swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "free list held an allocated cell");
        self.live_bits[idx].store(1, Ordering::Release);

        // SAFETY: the cell lies within the mapping and belongs to us now
        unsafe { ptr::write_bytes(cell, 0, cell_size) };
        self.cells_in_use.fetch_add(1, Ordering::Relaxed);
        self.bytes_in_use.fetch_add(cell_size, Ordering::Relaxed);

        NonNull::new(cell)
    }

    /// Allocates a run of whole blocks, reusing a free run if one is large
    /// enough. Returns `None` when the space has no such run left.
    fn alloc_large(&self, size: usize) -> Option<NonNull<u8>> {
        let blocks = size.div_ceil(self.block_size);
        let head = self
            .reuse_large_run(blocks)
            .or_else(|| self.claim_fresh_run(blocks))?;
        trace!(
            "{:?} large cell of {blocks} blocks at block {head}",
            self.kind
        );
        self.claim_cell(self.block_start(head), blocks * self.block_size)
    }

    fn reuse_large_run(&self, blocks: usize) -> Option<usize> {
        let mut free = self.large_free.lock();
        let pos = free.iter().position(|&(_, len)| len >= blocks)?;
        let (head, len) = free.swap_remove(pos);
        if len > blocks {
            let rest = head + blocks;
            self.mark_large_run(rest, len - blocks);
            free.push((rest, len - blocks));
        }
        self.mark_large_run(head, blocks);
        Some(head)
    }

    fn claim_fresh_run(&self, blocks: usize) -> Option<usize> {
        let head = self
            .fresh_block_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur + blocks <= self.block_count).then_some(cur + blocks)
            })
            .ok()?;
        for tail in head + 1..head + blocks {
            self.block_classes[tail].store(LARGE_TAIL, Ordering::Release);
        }
        self.mark_large_run(head, blocks);
        Some(head)
    }

    #[inline]
    fn mark_large_run(&self, head: usize, blocks: usize) {
        self.large_runs[head].store(blocks, Ordering::Release);
        self.block_classes[head].store(LARGE_HEAD, Ordering::Release);
    }

    /// Returns a large run to the free list, merged with free neighbours.
    fn release_large_run(&self, mut head: usize, mut blocks: usize) {
        let mut free = self.large_free.lock();
        while let Some(pos) = free
            .iter()
            .position(|&(h, len)| h == head + blocks || h + len == head)
        {
            let (h, len) = free.swap_remove(pos);
            // the later head of the two becomes an interior block
            let absorbed = head.max(h);
            self.large_runs[absorbed].store(0, Ordering::Relaxed);
            self.block_classes[absorbed].store(LARGE_TAIL, Ordering::Release);
            head = head.min(h);
            blocks += len;
        }
        self.mark_large_run(head, blocks);
        free.push((head, blocks));
    }

    /// Moves up to `refill_batch` cells of `class` into `local`, carving a
    /// fresh block when the global chain is empty.
    fn refill(&self, local: &mut FreeListLocal, class: usize) -> bool {
        {
            let mut chain = self.chains[class].lock();
            let mut moved = 0;
            while moved < self.refill_batch {
                let Some(cell) = chain.pop() else { break };
                // SAFETY: popped from the chain of the same class
                unsafe { local.chains[class].push(cell) };
                moved += 1;
            }
            if moved > 0 {
                return true;
            }
        }

        let Some(block) = self.claim_fresh_block(class) else {
            return false;
        };

        let cell_size = SIZE_CLASSES[class];
        let start = self.block_start(block);
        let count = self.block_size / cell_size;
        trace!(
            "{:?} block {block} carved into {count} cells of {cell_size}",
            self.kind
        );

        // pushed in reverse so cells come out in address order
        for i in (0..count).rev() {
            let cell = start.wrapping_add(i * cell_size) as *mut FreeCell;
            // SAFETY: fresh block, exclusively claimed
            unsafe { local.chains[class].push(cell) };
        }
        true
    }

    fn claim_fresh_block(&self, class: usize) -> Option<usize> {
        let block = self
            .fresh_block_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur < self.block_count).then_some(cur + 1)
            })
            .ok()?;
        self.block_classes[block].store(class as u8, Ordering::Release);
        Some(block)
    }

    /// Returns every locally cached cell to the global chains.
    pub fn flush(&self, local: &mut FreeListLocal) {
        for (class, local_chain) in local.chains.iter_mut().enumerate() {
            if local_chain.len == 0 {
                continue;
            }
            let mut chain = self.chains[class].lock();
            while let Some(cell) = local_chain.pop() {
                // SAFETY: same class
                unsafe { chain.push(cell) };
            }
        }
    }

    // ── Liveness ──────────────────────────────────────────────────────

    #[inline]
    pub fn is_live(&self, obj: *const u8) -> bool {
        self.live_bits[self.granule_index(obj)].load(Ordering::Acquire) != 0
    }

    /// Sets the live bit. Returns `true` if it was clear.
    #[inline]
    pub fn set_live_bit(&self, obj: *const u8) -> bool {
        self.live_bits[self.granule_index(obj)].swap(1, Ordering::AcqRel) == 0
    }

    #[inline]
    pub fn clear_live_bit(&self, obj: *const u8) {
        self.live_bits[self.granule_index(obj)].store(0, Ordering::Release);
    }

    pub fn clear_all_live_bits(&self) {
        for bit in self.live_bits.iter() {
            bit.store(0, Ordering::Relaxed);
        }
    }

    /// Visits every allocated cell whose live bit is clear. Cells for which
    /// `keep` returns `false` are freed. Returns the number freed.
    ///
    /// `keep` may free other cells of this space; cells already freed when
    /// the sweep reaches them are skipped.
    pub fn sweep_cells(
        &self,
        keep: &mut dyn FnMut(*const u8) -> bool,
    ) -> usize {
        let mut freed = 0;
        self.for_each_cell(&mut |cell| {
            if !self.is_allocated(cell) || self.is_live(cell) {
                return;
            }
            if !keep(cell) && self.is_allocated(cell) {
                self.free(cell);
                freed += 1;
            }
        });
        freed
    }

    /// Visits every cell of every claimed block, allocated or not. A large
    /// run is visited once, at its first block.
    fn for_each_cell(&self, f: &mut dyn FnMut(*const u8)) {
        let claimed = self
            .fresh_block_cursor
            .load(Ordering::Acquire)
            .min(self.block_count);
        let mut block = 0;
        while block < claimed {
            let start = self.block_start(block);
            match self.block_use(block) {
                BlockUse::Class(class) => {
                    let cell_size = SIZE_CLASSES[class];
                    for i in 0..self.block_size / cell_size {
                        f(start.wrapping_add(i * cell_size));
                    }
                }
                BlockUse::Large(blocks) => {
                    f(start);
                    block += blocks;
                    continue;
                }
                BlockUse::Unclaimed | BlockUse::LargeTail => {}
            }
            block += 1;
        }
    }
}

impl Space for FreeListSpace {
    fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline(always)]
    fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    #[inline]
    fn is_allocated(&self, obj: *const u8) -> bool {
        self.region.contains(obj)
            && self.alloc_bits[self.granule_index(obj)]
                .load(Ordering::Acquire)
                != 0
    }

    fn free(&self, obj: *const u8) {
        let idx = self.granule_index(obj);
        if self.alloc_bits[idx].swap(0, Ordering::AcqRel) == 0 {
            double_free(obj);
        }
        self.live_bits[idx].store(0, Ordering::Release);

        let block = self.block_index(obj);
        let offset = obj as usize - self.block_start(block) as usize;
        let cell_size = match self.block_use(block) {
            BlockUse::Class(class) => {
                let cell_size = SIZE_CLASSES[class];
                debug_assert!(
                    offset.is_multiple_of(cell_size),
                    "free of interior pointer"
                );
                let mut chain = self.chains[class].lock();
                // SAFETY: the cell was allocated from this class and is dead
                unsafe { chain.push(obj as *mut FreeCell) };
                cell_size
            }
            BlockUse::Large(blocks) => {
                debug_assert_eq!(offset, 0, "free of interior pointer");
                self.release_large_run(block, blocks);
                blocks * self.block_size
            }
            BlockUse::Unclaimed | BlockUse::LargeTail => not_a_cell(obj),
        };
        self.cells_in_use.fetch_sub(1, Ordering::Relaxed);
        self.bytes_in_use.fetch_sub(cell_size, Ordering::Relaxed);
        trace!("{:?} free {obj:p} ({cell_size} bytes)", self.kind);
    }

    fn for_each_allocated(&self, f: &mut dyn FnMut(*const u8)) {
        self.for_each_cell(&mut |cell| {
            if self.is_allocated(cell) {
                f(cell);
            }
        });
    }

    fn usage(&self) -> SpaceUsage {
        SpaceUsage {
            cells: self.cells_in_use.load(Ordering::Relaxed),
            bytes: self.bytes_in_use.load(Ordering::Relaxed),
            blocks_claimed: self
                .fresh_block_cursor
                .load(Ordering::Relaxed)
                .min(self.block_count),
            blocks_total: self.block_count,
        }
    }
}

#[cold]
#[inline(never)]
fn double_free(obj: *const u8) -> ! {
    panic!("double free of {obj:p}");
}

#[cold]
#[inline(never)]
fn not_a_cell(obj: *const u8) -> ! {
    panic!("{obj:p} is not the start of a cell");
}
