use crate::Value;
use crate::header::{Header, ObjectType};

// ── Tuple ──────────────────────────────────────────────────────────

/// A fixed-length sequence of tagged [`Value`] slots.
///
/// ```text
/// [Header 8B] [length: u64 8B] [slot_0 8B] [slot_1 8B] ...
/// ```
#[repr(C)]
pub struct Tuple {
    pub header: Header,
    length: u64,
}

const _: () = assert!(size_of::<Tuple>() == 16);

impl Tuple {
    /// Total allocation size of a tuple with `len` slots.
    pub const fn required_size(len: usize) -> usize {
        size_of::<Tuple>() + len * size_of::<Value>()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Writes the length and clears every slot to [`Value::NIL`].
    ///
    /// # Safety
    ///
    /// The inline memory after this struct must hold `len` slots.
    pub unsafe fn init(&mut self, len: usize) {
        self.length = len as u64;
        let first = self.first_slot();
        for i in 0..len {
            // SAFETY: within the allocation per contract
            unsafe { first.add(i).write(Value::NIL) };
        }
    }

    #[inline(always)]
    fn first_slot(&self) -> *mut Value {
        // SAFETY: slots start right after the fixed part
        unsafe { (self as *const Tuple).add(1) as *mut Value }
    }

    /// Address of slot `index`, for use with the heap's write barriers.
    ///
    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn slot(&self, index: usize) -> *mut Value {
        debug_assert!(index < self.len());
        // SAFETY: guaranteed by caller
        unsafe { self.first_slot().add(index) }
    }

    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn get(&self, index: usize) -> Value {
        // SAFETY: guaranteed by caller
        unsafe { self.slot(index).read() }
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` valid slots.
    pub unsafe fn slots(&self) -> &[Value] {
        // SAFETY: guaranteed by caller
        unsafe { core::slice::from_raw_parts(self.first_slot(), self.len()) }
    }
}

// ── Bytes ──────────────────────────────────────────────────────────

/// A variable-length byte payload that holds no references.
///
/// ```text
/// [Header 8B] [length: u64 8B] [byte_0] [byte_1] ...
/// ```
#[repr(C)]
pub struct Bytes {
    pub header: Header,
    length: u64,
}

const _: () = assert!(size_of::<Bytes>() == 16);

impl Bytes {
    pub const fn required_size(len: usize) -> usize {
        size_of::<Bytes>() + len
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// # Safety
    ///
    /// The inline memory after this struct must hold `data.len()` bytes.
    pub unsafe fn init(&mut self, data: &[u8]) {
        self.length = data.len() as u64;
        let dst = (self as *mut Bytes).wrapping_add(1) as *mut u8;
        // SAFETY: guaranteed by caller
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len())
        };
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` valid bytes.
    pub unsafe fn bytes(&self) -> &[u8] {
        let ptr = (self as *const Bytes).wrapping_add(1) as *const u8;
        // SAFETY: guaranteed by caller
        unsafe { core::slice::from_raw_parts(ptr, self.len()) }
    }
}

// ── Scanning ───────────────────────────────────────────────────────

/// Enumerates every reference slot of the object at `obj`.
///
/// Matches the heap's scan function signature, so it can be passed to the
/// heap directly.
///
/// # Safety
///
/// `obj` must point to an initialized [`Tuple`] or [`Bytes`].
pub unsafe fn scan_object(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
    // SAFETY: every object starts with a header
    let header = unsafe { &*(obj as *const Header) };
    match header.object_type() {
        ObjectType::Tuple => {
            // SAFETY: type checked above
            let tuple = unsafe { &*(obj as *const Tuple) };
            for i in 0..tuple.len() {
                // SAFETY: i < len
                let slot = unsafe { &mut *tuple.slot(i) };
                if slot.is_ref() {
                    visitor(slot);
                }
            }
        }
        ObjectType::Bytes => {}
    }
}
