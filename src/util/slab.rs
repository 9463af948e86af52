use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use crate::transport::{MemoryHandle, Transport};
use crate::util::huge_alloc::*;

/// A free block of some size class.
struct FreeBlock {
    ptr: NonNull<u8>,
    handle: MemoryHandle,
}

struct MsgAllocatorInner {
    /// Per-size-class free lists.
    classes: [Vec<FreeBlock>; MsgAllocator::NUM_CLASSES],

    /// Slab registry, each registered with the transport.
    slabs: Vec<(HugeRegion, MemoryHandle)>,

    /// Bump cursor into the newest slab.
    cur: *mut u8,
    cur_end: *mut u8,
    cur_handle: MemoryHandle,
}

impl MsgAllocatorInner {
    /// Current slab exhausted, so reserve and register a new one.
    #[cold]
    fn reserve_slab<Tp: Transport>(&mut self, tp: &mut Tp) {
        let region = alloc_region(MsgAllocator::SLAB_SIZE);
        // SAFETY: the region is valid for its whole length.
        let handle = unsafe { tp.reg_mem(region.ptr, region.len) };

        self.cur = region.ptr;
        self.cur_end = unsafe { region.ptr.add(region.len) };
        self.cur_handle = handle;
        self.slabs.push((region, handle));
    }

    fn alloc<Tp: Transport>(&mut self, len: usize, tp: &mut Tp) -> (NonNull<u8>, usize, MemoryHandle) {
        let class = MsgAllocator::class_of(len);
        let class_size = MsgAllocator::size_of_class(class);

        if let Some(block) = self.classes[class].pop() {
            return (block.ptr, class_size, block.handle);
        }

        // SAFETY: both pointers are within (or one past) the same slab.
        if self.cur.is_null() || unsafe { self.cur_end.offset_from(self.cur) } < class_size as isize
        {
            self.reserve_slab(tp);
        }

        let ptr = self.cur;
        // SAFETY: just checked to be within the same slab.
        self.cur = unsafe { self.cur.add(class_size) };
        (NonNull::new(ptr).unwrap(), class_size, self.cur_handle)
    }

    fn destroy<Tp: Transport>(&mut self, tp: &mut Tp) {
        for class in self.classes.iter_mut() {
            class.clear();
        }
        self.cur = ptr::null_mut();
        self.cur_end = ptr::null_mut();
        for (region, handle) in self.slabs.drain(..) {
            tp.dereg_mem(handle);
            drop(region);
        }
    }
}

/// Slab-granularity allocator for transport-registered message memory.
///
/// Hands out power-of-two size classes carved from huge-page slabs; freed
/// blocks go to a per-class free list and slabs are never unmapped until
/// [`MsgAllocator::destroy`]. Every slab is registered with the transport
/// when reserved and deregistered at destroy, so the allocator must be
/// destroyed while the transport is still alive.
pub(crate) struct MsgAllocator {
    inner: RefCell<MsgAllocatorInner>,
}

impl MsgAllocator {
    const MIN_CLASS_SIZE: usize = 1 << 6;
    const MAX_CLASS_SIZE: usize = 1 << 20;
    const NUM_CLASSES: usize =
        (Self::MAX_CLASS_SIZE / Self::MIN_CLASS_SIZE).trailing_zeros() as usize + 1;
    const SLAB_SIZE: usize = 1 << 21;

    /// Return the size of a given class.
    #[inline]
    const fn size_of_class(class: usize) -> usize {
        Self::MIN_CLASS_SIZE << class
    }

    /// Return the smallest class that can accommodate a given size.
    #[inline]
    const fn class_of(len: usize) -> usize {
        let len = len.next_power_of_two();
        if len < Self::MIN_CLASS_SIZE {
            0
        } else {
            (len / Self::MIN_CLASS_SIZE).trailing_zeros() as usize
        }
    }

    /// Create a new allocator with no pre-allocation.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(MsgAllocatorInner {
                classes: Default::default(),
                slabs: Vec::new(),
                cur: ptr::null_mut(),
                cur_end: ptr::null_mut(),
                cur_handle: 0,
            }),
        })
    }

    /// Allocate a registered buffer of at least `len` bytes.
    pub fn alloc<Tp: Transport>(
        self: &Rc<Self>,
        len: usize,
        tp: &mut Tp,
    ) -> crate::util::buffer::Buffer {
        assert!(
            len <= Self::MAX_CLASS_SIZE,
            "requested buffer too large (maximum: {}KB)",
            Self::MAX_CLASS_SIZE >> 10
        );
        let (ptr, len, handle) = self.inner.borrow_mut().alloc(len, tp);
        crate::util::buffer::Buffer::real(self, ptr, len, handle)
    }

    /// Return a block to its size-class free list.
    pub fn free(&self, ptr: NonNull<u8>, len: usize, handle: MemoryHandle) {
        let mut inner = self.inner.borrow_mut();
        if inner.slabs.is_empty() {
            // Already destroyed; the block's slab is gone.
            return;
        }
        let class = Self::class_of(len);
        inner.classes[class].push(FreeBlock { ptr, handle });
    }

    /// Deregister and unmap every slab. Must run before the transport dies.
    pub fn destroy<Tp: Transport>(&self, tp: &mut Tp) {
        self.inner.borrow_mut().destroy(tp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_sizing() {
        assert_eq!(MsgAllocator::class_of(1), 0);
        assert_eq!(MsgAllocator::class_of(64), 0);
        assert_eq!(MsgAllocator::class_of(65), 1);
        assert_eq!(MsgAllocator::size_of_class(MsgAllocator::class_of(4096)), 4096);
        assert_eq!(MsgAllocator::size_of_class(MsgAllocator::class_of(4097)), 8192);
    }
}
