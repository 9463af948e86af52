use std::ptr;

use libc::*;

use crate::util::likely::*;

const HUGE_PAGE_SIZE: usize = 1 << 21;

enum RegionKind {
    Mmap,
    Malloc,
}

/// A raw memory region, huge-page-backed when the system allows it.
pub(crate) struct HugeRegion {
    pub ptr: *mut u8,
    pub len: usize,
    kind: RegionKind,
}

unsafe impl Send for HugeRegion {}
unsafe impl Sync for HugeRegion {}

impl Drop for HugeRegion {
    fn drop(&mut self) {
        // SAFETY: FFI.
        unsafe {
            match self.kind {
                RegionKind::Mmap => assert!(
                    munmap(self.ptr as *mut c_void, self.len) == 0,
                    "munmap failed"
                ),
                RegionKind::Malloc => free(self.ptr as *mut c_void),
            }
        };
    }
}

#[inline]
fn region_mmap(len: usize, flags: i32) -> *mut u8 {
    // SAFETY: FFI.
    let ret = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | flags,
            -1,
            0,
        ) as *mut u8
    };

    if ret != MAP_FAILED as _ {
        ret
    } else {
        ptr::null_mut()
    }
}

#[inline]
fn region_memalign(len: usize, align: usize) -> *mut u8 {
    let mut ptr = ptr::null_mut();
    // SAFETY: FFI.
    let ret = unsafe { posix_memalign(&mut ptr, align, len) };
    if likely(ret == 0) {
        ptr as _
    } else {
        ptr::null_mut()
    }
}

/// Allocate a region of at least `len` bytes, rounded up to huge pages.
///
/// Falls back from huge pages to normal pages to `posix_memalign`, logging
/// each downgrade. Panics only when all three fail.
pub(crate) fn alloc_region(len: usize) -> HugeRegion {
    let len = (len + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

    let ptr = region_mmap(len, MAP_HUGETLB);
    if !ptr.is_null() {
        return HugeRegion {
            ptr,
            len,
            kind: RegionKind::Mmap,
        };
    }

    log::warn!(
        "could not mmap {}MB of huge pages, falling back to normal pages; expect reduced performance",
        len >> 20
    );

    let ptr = region_mmap(len, 0);
    if likely(!ptr.is_null()) {
        return HugeRegion {
            ptr,
            len,
            kind: RegionKind::Mmap,
        };
    }

    log::warn!(
        "could not mmap {}MB of normal pages, falling back to posix_memalign; expect reduced performance",
        len >> 20
    );

    let ptr = region_memalign(len, 1 << 12);
    if likely(!ptr.is_null()) {
        return HugeRegion {
            ptr,
            len,
            kind: RegionKind::Malloc,
        };
    }

    panic!("failed to allocate {}MB memory", len >> 20);
}
