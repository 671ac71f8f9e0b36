//! Reference count header protocol.
//!
//! The count lives in the header's 32-bit count word:
//!
//! ```text
//! bits 0..2:  colour (reserved for cycle detection, always zero)
//! bits 2..32: count
//! ```
//!
//! Every update is a compare-and-swap retry loop, so increments and
//! decrements from different mutators never get lost.

use std::sync::atomic::Ordering;

use object::Header;

pub const COLOR_BITS: u32 = 2;
pub const COLOR_MASK: u32 = (1 << COLOR_BITS) - 1;
/// Amount added to the count word per reference.
pub const INCREMENT: u32 = 1 << COLOR_BITS;
/// Largest representable count.
pub const RC_LIMIT: u32 = u32::MAX >> COLOR_BITS;
/// Count words below this hold a zero count.
const LIVE_THRESHOLD: u32 = INCREMENT;

/// Outcome of [`dec_rc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcDecrement {
    /// The count reached zero.
    Zero,
    /// References remain.
    Positive,
}

#[inline(always)]
unsafe fn header<'a>(obj: *const u8) -> &'a Header {
    // SAFETY: every object starts with a header
    unsafe { &*(obj as *const Header) }
}

/// Sets the initial count of a freshly allocated object.
///
/// # Safety
///
/// `obj` must point to an object header not yet visible to other threads.
#[inline]
pub unsafe fn initialize_header(obj: *const u8, start_counted: bool) {
    let word = if start_counted { INCREMENT } else { 0 };
    // SAFETY: guaranteed by caller
    unsafe { header(obj) }.rc_word().store(word, Ordering::Release);
}

/// Adds one reference. Returns `true` if the count was zero before.
///
/// # Safety
///
/// `obj` must point to an allocated object.
#[inline]
pub unsafe fn inc_rc(obj: *const u8) -> bool {
    // SAFETY: guaranteed by caller
    let word = unsafe { header(obj) }.rc_word();
    let mut old = word.load(Ordering::Relaxed);
    loop {
        if old >> COLOR_BITS == RC_LIMIT {
            count_overflow(obj);
        }
        match word.compare_exchange_weak(
            old,
            old + INCREMENT,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return old < LIVE_THRESHOLD,
            Err(current) => old = current,
        }
    }
}

/// Drops one reference.
///
/// # Safety
///
/// `obj` must point to an allocated object.
#[inline]
pub unsafe fn dec_rc(obj: *const u8) -> RcDecrement {
    // SAFETY: guaranteed by caller
    let word = unsafe { header(obj) }.rc_word();
    let mut old = word.load(Ordering::Relaxed);
    loop {
        if old < LIVE_THRESHOLD {
            dead_decrement(obj);
        }
        let new = old - INCREMENT;
        match word.compare_exchange_weak(
            old,
            new,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) if new < LIVE_THRESHOLD => return RcDecrement::Zero,
            Ok(_) => return RcDecrement::Positive,
            Err(current) => old = current,
        }
    }
}

/// Current count.
///
/// # Safety
///
/// `obj` must point to an allocated object.
#[inline]
pub unsafe fn get_rc(obj: *const u8) -> u32 {
    // SAFETY: guaranteed by caller
    unsafe { header(obj) }.rc_word().load(Ordering::Acquire) >> COLOR_BITS
}

/// Whether the count is above zero.
///
/// # Safety
///
/// `obj` must point to an allocated object.
#[inline]
pub unsafe fn is_live_rc(obj: *const u8) -> bool {
    // SAFETY: guaranteed by caller
    unsafe { header(obj) }.rc_word().load(Ordering::Acquire) >= LIVE_THRESHOLD
}

#[cold]
#[inline(never)]
fn count_overflow(obj: *const u8) -> ! {
    panic!("reference count overflow at {obj:p}");
}

#[cold]
#[inline(never)]
fn dead_decrement(obj: *const u8) -> ! {
    panic!("decrement of dead object at {obj:p}");
}
