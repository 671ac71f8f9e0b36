use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    // posix mmap and munmap
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// posix memory allocation using mmap
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// An anonymous, zero-filled, page-aligned mapping that is released on drop.
#[derive(Debug)]
pub struct MappedRegion {
    start: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain memory; access is coordinated by its owner.
unsafe impl Send for MappedRegion {}
// SAFETY: the region is plain memory; access is coordinated by its owner.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    #[must_use]
    pub fn new(size: usize) -> Option<Self> {
        debug_assert!(size.is_multiple_of(OS_PAGE_SIZE));
        // SAFETY: result is null-checked below
        let ptr = unsafe { unix::anonymous_mmap(size) };
        NonNull::new(ptr).map(|start| Self { start, size })
    }

    #[inline(always)]
    pub fn start(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline(always)]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.start.as_ptr() as usize;
        addr >= start && addr < start + self.size
    }

    /// Byte offset of `ptr` from the start of the region.
    #[inline(always)]
    pub fn offset_of(&self, ptr: *const u8) -> usize {
        debug_assert!(self.contains(ptr));
        ptr as usize - self.start.as_ptr() as usize
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: mapped by `new` with the same size
        unsafe { unix::anonymous_munmap(self.start.as_ptr(), self.size) };
    }
}
