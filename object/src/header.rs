use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Object type tag stored in bits 2..7 of the header's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Fixed-length sequence of [`Value`](crate::Value) slots.
    Tuple = 0,
    /// Unscanned byte payload.
    Bytes,
}

impl ObjectType {
    pub const COUNT: usize = Self::Bytes as usize + 1;
}

/// Bookkeeping flags stored atomically in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    /// Object sits in the remembered set of the counted/traced bridge.
    pub const REMEMBERED: Self = Self(1 << 0);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }
}

const HEADER_TAG: u8 = 0b11;

/// The 8-byte header at the start of every heap object.
///
/// ```text
/// byte 0:    [tag:2 = 0b11] [object_type:6]
/// byte 1:    flags (atomic), Remembered
/// bytes 2‥3: reserved (zero)
/// bytes 4‥7: reference count word (atomic)
/// ```
///
/// The count word is owned by the heap's reference counting protocol; this
/// type only hands out the atomic. On little-endian systems, reading these
/// 8 bytes as a `u64` yields a value whose low 2 bits are `0b11`, which
/// [`Value::is_header`](crate::Value::is_header) detects.
#[repr(C)]
pub struct Header {
    tag_and_type: u8,
    flags: AtomicU8,
    _reserved: [u8; 2],
    rc: AtomicU32,
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            tag_and_type: ((object_type as u8) << 2) | HEADER_TAG,
            flags: AtomicU8::new(0),
            _reserved: [0; 2],
            rc: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn object_type(&self) -> ObjectType {
        let raw = self.tag_and_type >> 2;
        debug_assert!((raw as usize) < ObjectType::COUNT);
        // SAFETY: written from a valid ObjectType in `new`
        unsafe { core::mem::transmute::<u8, ObjectType>(raw) }
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_and(!flag.0, Ordering::Relaxed);
    }

    /// Atomically OR flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_or_flags(&self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.flags.fetch_or(flag.0, Ordering::Relaxed))
    }

    // ── reference count word ───────────────────────────────────────

    #[inline(always)]
    pub fn rc_word(&self) -> &AtomicU32 {
        &self.rc
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.object_type())
            .field("flags", &self.flags())
            .field("rc_word", &self.rc.load(Ordering::Relaxed))
            .finish()
    }
}
