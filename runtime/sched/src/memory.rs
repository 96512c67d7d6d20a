//! Page allocation for thread stacks
//!
//! The scheduler only needs whole, page-aligned pages. [`PagePool`] carves
//! them out of a fixed region with `linked_list_allocator`; any other
//! allocator can stand in through [`PageAllocator`].

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use linked_list_allocator::LockedHeap;

pub const PAGE_SIZE: usize = 4096;

const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(layout) => layout,
    Err(_) => panic!("invalid page layout"),
};

/// An owned page of memory
pub struct Page {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: a Page is the unique owner of its memory.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// # Safety
    /// `base` must point to `size` writable bytes that nothing else uses
    /// until the page is handed back to its allocator.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last byte; stacks grow down from here
    pub fn top(&self) -> usize {
        self.base() + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn contains(&self, address: usize) -> bool {
        (self.base()..self.top()).contains(&address)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x}, {:#x})", self.base(), self.size)
    }
}

/// Source of stack pages
pub trait PageAllocator: Send + Sync {
    fn allocate_page(&self) -> Option<Page>;
    fn free_page(&self, page: Page);
}

/// Page allocator over a fixed memory region
pub struct PagePool {
    heap: LockedHeap,
}

impl PagePool {
    pub const fn empty() -> Self {
        Self {
            heap: LockedHeap::empty(),
        }
    }

    /// Hand the region `[base, base + size)` to the pool
    ///
    /// # Safety
    /// The region must be valid, writable, unused by anything else, and
    /// must live as long as the pool. Call at most once.
    pub unsafe fn init(&self, base: *mut u8, size: usize) {
        self.heap.lock().init(base, size);
    }

    pub fn free_bytes(&self) -> usize {
        self.heap.lock().free()
    }

    pub fn used_bytes(&self) -> usize {
        self.heap.lock().used()
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::empty()
    }
}

impl PageAllocator for PagePool {
    fn allocate_page(&self) -> Option<Page> {
        let base = self.heap.lock().allocate_first_fit(PAGE_LAYOUT).ok()?;
        Some(Page {
            base,
            size: PAGE_SIZE,
        })
    }

    fn free_page(&self, page: Page) {
        // SAFETY: pages handed out by this pool come from allocate_first_fit
        // with PAGE_LAYOUT, and a Page cannot be duplicated.
        unsafe { self.heap.lock().deallocate(page.base, PAGE_LAYOUT) };
    }
}

/// Leaked, page-aligned pool for tests
#[cfg(test)]
pub(crate) fn test_pool(pages: usize) -> PagePool {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    let pool = PagePool::empty();
    unsafe {
        let region = std::alloc::alloc_zeroed(layout);
        assert!(!region.is_null());
        pool.init(region, layout.size());
    }
    pool
}
