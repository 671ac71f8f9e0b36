//! Cascading deletion of objects whose count dropped to zero.

use std::sync::atomic::Ordering;

use log::trace;

use crate::{
    DeleteStrategy, HeapInner, HeapProxy,
    phase::RootedSet,
    rc::{self, RcDecrement},
    space::Space,
};

/// Frees dead counted objects and, transitively, the children they alone
/// kept alive. Runs on an explicit worklist so chain length is unbounded.
pub(crate) struct Cascade<'a> {
    heap: &'a HeapInner,
    /// Objects directly referenced by a root. They are never freed here,
    /// even when their count drops to zero; they end up in `carried`.
    rooted: Option<&'a RootedSet>,
    worklist: Vec<*const u8>,
    pub carried: Vec<usize>,
    pub freed_cells: usize,
    pub freed_bytes: usize,
}

impl<'a> Cascade<'a> {
    pub fn new(heap: &'a HeapInner, rooted: Option<&'a RootedSet>) -> Self {
        Self {
            heap,
            rooted,
            worklist: Vec::new(),
            carried: Vec::new(),
            freed_cells: 0,
            freed_bytes: 0,
        }
    }

    /// Frees counted object `obj`, whose count is zero, and cascades.
    pub fn free(&mut self, obj: *const u8) {
        debug_assert!(!unsafe { rc::is_live_rc(obj) });
        self.worklist.push(obj);
        self.drain();
    }

    /// Drops the count `obj` holds on each counted child. Children reaching
    /// zero are queued for freeing; [`Cascade::drain`] frees them.
    pub fn release_children(&mut self, obj: *const u8) {
        let heap = self.heap;
        let rooted = self.rooted;
        let worklist = &mut self.worklist;
        let carried = &mut self.carried;

        // SAFETY: obj is an allocated object that nobody else looks at anymore
        unsafe {
            (heap.scan_fn)(obj, &mut |slot| {
                let child = *slot;
                if !heap.is_counted(child) {
                    return;
                }
                let child = child.as_ptr();
                if rc::dec_rc(child) == RcDecrement::Positive {
                    return;
                }
                if rooted.is_some_and(|r| r.contains(&(child as usize))) {
                    trace!("rooted child {child:p} reached zero, carried over");
                    carried.push(child as usize);
                } else {
                    worklist.push(child);
                }
            })
        };
    }

    /// Frees every queued object.
    pub fn drain(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            self.release_children(obj);
            self.freed_bytes += self.heap.counted.cell_size(obj);
            self.freed_cells += 1;
            self.heap.counted.free(obj);
        }
    }
}

impl HeapProxy {
    /// Drops one reference to counted object `obj`. At zero the object is
    /// freed on the spot or buffered, depending on the delete strategy.
    ///
    /// # Safety
    ///
    /// `obj` must be an allocated object of the counted space whose count
    /// includes the reference being dropped.
    pub(crate) unsafe fn delete(&mut self, obj: *const u8) {
        // SAFETY: guaranteed by caller
        if unsafe { rc::dec_rc(obj) } == RcDecrement::Positive {
            return;
        }
        match self.heap.settings.delete_strategy {
            DeleteStrategy::Deferred => self.zct.push(obj),
            DeleteStrategy::Eager => {
                let mut cascade = Cascade::new(&self.heap, None);
                cascade.free(obj);
                self.heap
                    .track
                    .eager_freed
                    .fetch_add(cascade.freed_cells, Ordering::Relaxed);
            }
        }
    }
}
