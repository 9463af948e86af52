use std::mem;
use std::ptr::NonNull;
use std::slice;

use crate::pkthdr::PacketHeader;
use crate::transport::MemoryHandle;
use crate::util::buffer::Buffer;

/// A message buffer holding one request or response.
///
/// Layout: an 8-byte packet header immediately followed by application data.
/// Owned `MsgBuf`s sit in registered huge-page memory and return to their
/// allocator on drop; borrowed ones view transport receive-ring memory or
/// another `MsgBuf` and own nothing.
pub struct MsgBuf {
    /// Pointer to the first *application data* byte.
    data: NonNull<u8>,

    /// Valid data bytes in the MsgBuf.
    len: usize,

    /// Max data bytes in the MsgBuf.
    max_len: usize,

    /// Backing buffer.
    buffer: Buffer,
}

unsafe impl Send for MsgBuf {}
unsafe impl Sync for MsgBuf {}

/// Crate-internal methods.
impl MsgBuf {
    /// Create a new MsgBuf on an owned buffer.
    pub(crate) fn owned(buf: Buffer, data_len: usize) -> Self {
        let overall_len = data_len + mem::size_of::<PacketHeader>();
        assert!(
            overall_len <= buf.len(),
            "buffer too small: {} < {}",
            buf.len(),
            overall_len
        );

        Self {
            // SAFETY: within the same allocated buffer, and not null.
            data: unsafe {
                NonNull::new_unchecked(buf.as_ptr().add(mem::size_of::<PacketHeader>()))
            },
            len: data_len,
            max_len: buf.len() - mem::size_of::<PacketHeader>(),
            buffer: buf,
        }
    }

    /// Create a new MsgBuf on a not-owned buffer.
    ///
    /// # Safety
    ///
    /// `hdr` must point to a valid `PacketHeader` right before `len` bytes of
    /// application data, and that memory must outlive the `MsgBuf`.
    pub(crate) unsafe fn borrowed(hdr: NonNull<u8>, len: usize, handle: MemoryHandle) -> Self {
        Self {
            data: NonNull::new_unchecked(hdr.as_ptr().add(mem::size_of::<PacketHeader>())),
            len,
            max_len: len,
            buffer: Buffer::fake(handle),
        }
    }

    /// Create a non-owning view of this MsgBuf.
    pub(crate) fn clone_borrowed(&self) -> Self {
        Self {
            data: self.data,
            len: self.len,
            max_len: self.max_len,
            buffer: Buffer::fake(self.buffer.handle()),
        }
    }

    /// Get a pointer to the packet header.
    #[inline]
    pub(crate) fn pkt_hdr(&self) -> *mut PacketHeader {
        // SAFETY: header & application data live in the same allocation.
        unsafe { self.data.as_ptr().sub(mem::size_of::<PacketHeader>()) as _ }
    }

    /// Get the registered-memory handle of the backing buffer.
    #[inline(always)]
    pub(crate) fn handle(&self) -> MemoryHandle {
        self.buffer.handle()
    }
}

/// Public methods.
impl MsgBuf {
    /// Pointer to the first *application data* byte.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Length of the application data.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if there is no application data.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity for application data.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.max_len
    }

    /// Set the application data length.
    ///
    /// # Panics
    ///
    /// Panic if `len` exceeds the capacity.
    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.max_len,
            "length {} exceeds MsgBuf capacity {}",
            len,
            self.max_len
        );
        self.len = len;
    }

    /// Copy `src` into the buffer and set the length accordingly.
    ///
    /// # Panics
    ///
    /// Panic if `src` is larger than the capacity.
    #[inline]
    pub fn copy_from(&mut self, src: &[u8]) {
        self.set_len(src.len());
        // SAFETY: `src.len() <= max_len` checked by `set_len`; regions cannot
        // overlap since `src` is an immutable borrow.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.as_ptr(), src.len()) };
    }

    /// View the application data as a byte slice.
    ///
    /// # Safety
    ///
    /// Same requirements as [`std::slice::from_raw_parts()`].
    #[inline(always)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.data.as_ptr(), self.len)
    }

    /// View the application data as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// Same requirements as [`std::slice::from_raw_parts_mut()`].
    #[inline(always)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.data.as_ptr(), self.len)
    }
}
