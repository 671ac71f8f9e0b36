//! Bookkeeping between the counted space and the traced space.
//!
//! Pointers from traced objects into the counted space are counted by the
//! ordinary barriers, so a counted object is live for the tracer whenever
//! its count is. The other direction is not counted. With
//! [`BridgePolicy::Remembered`](crate::BridgePolicy::Remembered) the barrier
//! records counted objects that store a traced pointer, and the tracer uses
//! their outgoing pointers as extra roots.

use object::{Header, HeaderFlags};

use crate::{
    HeapInner,
    space::{MarkSweepSpace, Space},
};

/// Worklist tracer for the traced space.
pub(crate) struct TracedMarker<'a> {
    heap: &'a HeapInner,
    traced: &'a MarkSweepSpace,
    worklist: Vec<*const u8>,
    pub marked: usize,
}

impl<'a> TracedMarker<'a> {
    /// `None` when the heap has no traced space.
    pub fn new(heap: &'a HeapInner) -> Option<Self> {
        heap.traced.as_ref().map(|traced| Self {
            heap,
            traced,
            worklist: Vec::new(),
            marked: 0,
        })
    }

    #[inline]
    pub fn mark(&mut self, obj: *const u8) {
        if self.traced.is_allocated(obj) && self.traced.mark(obj) {
            self.marked += 1;
            self.worklist.push(obj);
        }
    }

    /// Marks the traced objects a counted object points to.
    pub fn scan_counted(&mut self, obj: *const u8) {
        let heap = self.heap;
        let mut targets = Vec::new();
        // SAFETY: obj is an allocated counted object
        unsafe {
            (heap.scan_fn)(obj, &mut |slot| {
                if heap.is_traced(*slot) {
                    targets.push(slot.as_ptr());
                }
            })
        };
        for target in targets {
            self.mark(target);
        }
    }

    /// Traces everything reachable from the marked objects inside the
    /// traced space. Counted objects are not entered; their count keeps
    /// them alive and the remembered set covers their traced targets.
    pub fn drain(&mut self) {
        let heap = self.heap;
        while let Some(obj) = self.worklist.pop() {
            let mut children = Vec::new();
            // SAFETY: only allocated traced objects are queued
            unsafe {
                (heap.scan_fn)(obj, &mut |slot| {
                    if heap.is_traced(*slot) {
                        children.push(slot.as_ptr());
                    }
                })
            };
            for child in children {
                self.mark(child);
            }
        }
    }
}

/// Drops stale entries and duplicates from the remembered set.
///
/// An entry is stale once its cell was freed, reused by an object that
/// never stored a traced pointer, or once the holder no longer holds one.
/// The last kind loses its flag, so its next traced store remembers it
/// again.
pub(crate) fn refresh_remembered(
    heap: &HeapInner,
    remembered: &mut Vec<usize>,
) {
    remembered.sort_unstable();
    remembered.dedup();
    remembered.retain(|&addr| {
        let obj = addr as *const u8;
        if !heap.counted.is_allocated(obj) {
            return false;
        }
        // SAFETY: allocated cells carry an initialized header
        let header = unsafe { &*(obj as *const Header) };
        if !header.has_flag(HeaderFlags::REMEMBERED) {
            return false;
        }
        let mut holds_traced = false;
        // SAFETY: allocated counted object, mutators are stopped
        unsafe {
            (heap.scan_fn)(obj, &mut |slot| {
                holds_traced |= heap.is_traced(*slot);
            })
        };
        if !holds_traced {
            header.remove_flag(HeaderFlags::REMEMBERED);
        }
        holds_traced
    });
}
