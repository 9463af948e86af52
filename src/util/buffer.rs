use std::ptr::NonNull;
use std::rc::Rc;

use crate::transport::MemoryHandle;
use crate::util::slab::MsgAllocator;

/// A piece of transport-registered memory.
///
/// Real buffers return themselves to their owning allocator when dropped;
/// fake buffers only carry a memory handle and do nothing on drop.
pub(crate) struct Buffer {
    /// Start address of the buffer.
    buf: NonNull<u8>,

    /// Length of the buffer.
    len: usize,

    /// Registered-memory handle covering the buffer.
    handle: MemoryHandle,

    /// Owning allocator, if any.
    owner: Option<Rc<MsgAllocator>>,
}

impl Buffer {
    /// A real buffer that is returned to `owner` when dropped.
    #[inline]
    pub fn real(
        owner: &Rc<MsgAllocator>,
        buf: NonNull<u8>,
        len: usize,
        handle: MemoryHandle,
    ) -> Self {
        Self {
            buf,
            len,
            handle,
            owner: Some(owner.clone()),
        }
    }

    /// A fake buffer that only records a memory handle.
    #[inline]
    pub fn fake(handle: MemoryHandle) -> Self {
        Self {
            buf: NonNull::dangling(),
            len: 0,
            handle,
            owner: None,
        }
    }

    /// Get the start address of the buffer.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Get the length of the buffer.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the registered-memory handle of the buffer.
    #[inline(always)]
    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.free(self.buf, self.len, self.handle);
        }
    }
}
