//! Reference counting write barriers.
//!
//! Every store of a [`Value`] into a slot goes through one of the entry
//! points below. Each one increments the new target before the store and
//! decrements the overwritten value after it, so storing a value over
//! itself never lets its count touch zero.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use object::{Header, HeaderFlags, Value};

use crate::{BridgePolicy, CollectionPhase, HeapProxy, NonHeapPolicy, rc};

/// Performs the raw slot accesses on behalf of the barriers.
///
/// `src` is the object owning the slot, `None` for non-heap slots.
pub trait StoreDelegate: Send + Sync + fmt::Debug {
    /// Stores `value` and returns the previous content of the slot.
    ///
    /// # Safety
    ///
    /// `slot` must be valid and 8-byte aligned.
    unsafe fn exchange(
        &self,
        src: Option<Value>,
        slot: *mut Value,
        value: Value,
    ) -> Value;

    /// Stores `value` if the slot still holds `expected`.
    ///
    /// # Safety
    ///
    /// `slot` must be valid and 8-byte aligned.
    unsafe fn compare_exchange(
        &self,
        src: Option<Value>,
        slot: *mut Value,
        expected: Value,
        value: Value,
    ) -> bool;

    /// # Safety
    ///
    /// `slot` must be valid and 8-byte aligned.
    unsafe fn load(&self, src: Option<Value>, slot: *const Value) -> Value;
}

/// Word-sized atomic slot accesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicStore;

impl AtomicStore {
    /// # Safety
    ///
    /// `slot` must be valid and 8-byte aligned.
    #[inline(always)]
    unsafe fn atomic<'a>(slot: *const Value) -> &'a AtomicU64 {
        // SAFETY: Value is a transparent u64; validity guaranteed by caller
        unsafe { AtomicU64::from_ptr(slot as *mut u64) }
    }
}

impl StoreDelegate for AtomicStore {
    #[inline]
    unsafe fn exchange(
        &self,
        _src: Option<Value>,
        slot: *mut Value,
        value: Value,
    ) -> Value {
        // SAFETY: guaranteed by caller
        let old =
            unsafe { Self::atomic(slot) }.swap(value.raw(), Ordering::AcqRel);
        Value::from_raw(old)
    }

    #[inline]
    unsafe fn compare_exchange(
        &self,
        _src: Option<Value>,
        slot: *mut Value,
        expected: Value,
        value: Value,
    ) -> bool {
        // SAFETY: guaranteed by caller
        unsafe { Self::atomic(slot) }
            .compare_exchange(
                expected.raw(),
                value.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    unsafe fn load(&self, _src: Option<Value>, slot: *const Value) -> Value {
        // SAFETY: guaranteed by caller
        Value::from_raw(unsafe { Self::atomic(slot) }.load(Ordering::Acquire))
    }
}

impl HeapProxy {
    #[inline(always)]
    fn check_barrier_phase(&self) {
        let phase = self.heap.phase();
        if phase != CollectionPhase::Idle {
            barrier_during_collection(phase);
        }
    }

    /// Stores `target` into `slot`, a field of heap object `src`.
    ///
    /// # Safety
    ///
    /// `src` must be an allocated object of either space, `slot` one of its
    /// fields, and `target` nil, a non-reference or an allocated object.
    #[inline]
    pub unsafe fn write_barrier(
        &mut self,
        src: Value,
        slot: *mut Value,
        target: Value,
    ) {
        self.check_barrier_phase();

        if self.heap.is_counted(target) {
            // SAFETY: target is allocated per contract
            unsafe { rc::inc_rc(target.as_ptr()) };
        }
        // SAFETY: slot valid per contract
        let old = unsafe { self.heap.store.exchange(Some(src), slot, target) };
        self.remember_bridge_edge(src, target);
        if self.heap.is_counted(old) {
            // SAFETY: the slot's reference was counted
            unsafe { self.delete(old.as_ptr()) };
        }
    }

    /// Stores `target` into a slot outside the heap (a global or static).
    ///
    /// # Safety
    ///
    /// `slot` must be valid and 8-byte aligned, `target` as for
    /// [`HeapProxy::write_barrier`].
    #[inline]
    pub unsafe fn write_barrier_non_heap(
        &mut self,
        slot: *mut Value,
        target: Value,
    ) {
        self.check_barrier_phase();

        match self.heap.settings.non_heap_policy {
            NonHeapPolicy::Uncounted => {
                // SAFETY: slot valid per contract
                unsafe { self.heap.store.exchange(None, slot, target) };
            }
            NonHeapPolicy::Counted => {
                if self.heap.is_counted(target) {
                    // SAFETY: target is allocated per contract
                    unsafe { rc::inc_rc(target.as_ptr()) };
                }
                // SAFETY: slot valid per contract
                let old =
                    unsafe { self.heap.store.exchange(None, slot, target) };
                if self.heap.is_counted(old) {
                    // SAFETY: counted slot under this policy
                    unsafe { self.delete(old.as_ptr()) };
                }
            }
        }
    }

    /// Stores `target` into field `slot` of `src` if it still holds
    /// `expected`. Returns whether the store happened.
    ///
    /// Counts change only when it did. The target is incremented up front
    /// and the increment undone on failure, so a reference is never in a
    /// slot without being counted.
    ///
    /// # Safety
    ///
    /// As for [`HeapProxy::write_barrier`].
    #[inline]
    pub unsafe fn write_barrier_cas(
        &mut self,
        src: Value,
        slot: *mut Value,
        expected: Value,
        target: Value,
    ) -> bool {
        self.check_barrier_phase();

        let counted = self.heap.is_counted(target);
        if counted {
            // SAFETY: target is allocated per contract
            unsafe { rc::inc_rc(target.as_ptr()) };
        }
        // SAFETY: slot valid per contract
        let swapped = unsafe {
            self.heap
                .store
                .compare_exchange(Some(src), slot, expected, target)
        };

        if !swapped {
            if counted {
                let target = target.as_ptr();
                // SAFETY: incremented above
                if unsafe { rc::dec_rc(target) } == rc::RcDecrement::Zero {
                    self.zct.push(target);
                }
            }
            return false;
        }

        self.remember_bridge_edge(src, target);
        if self.heap.is_counted(expected) {
            // SAFETY: the slot's reference was counted
            unsafe { self.delete(expected.as_ptr()) };
        }
        true
    }

    /// Copies `len` slots from `src_slots` (fields of `src`) to `dst_slots`
    /// (fields of `dst`), one barrier per slot. Overlapping ranges copy as
    /// if through a temporary.
    ///
    /// # Safety
    ///
    /// Both ranges must be `len` valid fields of their objects, and `src`
    /// and `dst` as for [`HeapProxy::write_barrier`].
    pub unsafe fn write_barrier_copy(
        &mut self,
        src: Value,
        src_slots: *const Value,
        dst: Value,
        dst_slots: *mut Value,
        len: usize,
    ) {
        self.check_barrier_phase();

        let from = src_slots as usize;
        let to = dst_slots as usize;
        let backwards = to > from && to < from + len * size_of::<Value>();

        for step in 0..len {
            let i = if backwards { len - 1 - step } else { step };
            // SAFETY: i < len, ranges valid per contract
            unsafe {
                let value = self.heap.store.load(Some(src), src_slots.add(i));
                self.write_barrier(dst, dst_slots.add(i), value);
            }
        }
    }

    /// Records `src` in the remembered set if it is a counted object that
    /// now points into the traced space.
    #[inline]
    fn remember_bridge_edge(&mut self, src: Value, target: Value) {
        if self.heap.settings.bridge_policy != BridgePolicy::Remembered
            || !self.heap.is_traced(target)
            || !self.heap.is_counted(src)
        {
            return;
        }

        // SAFETY: src is an allocated counted object
        let header = unsafe { &*(src.as_ptr() as *const Header) };
        if header.has_flag(HeaderFlags::REMEMBERED) {
            return;
        }
        let prev = header.fetch_or_flags(HeaderFlags::REMEMBERED);
        if !prev.contains(HeaderFlags::REMEMBERED) {
            self.record_remembered_set(src);
        }
    }

    #[cold]
    fn record_remembered_set(&mut self, src: Value) {
        self.remember.push(src.as_ptr() as usize);
    }
}

#[cold]
#[inline(never)]
fn barrier_during_collection(phase: CollectionPhase) -> ! {
    panic!("write barrier during collection ({phase:?})");
}
