//! A hosted kernel context over leaked host memory

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, Layout};
use std::sync::Arc;

use keel_kernel::hosted::{install_platform, Platform};
use keel_kernel::KernelContext;
use keel_sched::{PagePool, PAGE_SIZE};

pub fn pool(pages: usize) -> Arc<PagePool> {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    let pool = PagePool::empty();
    unsafe {
        let region = alloc_zeroed(layout);
        assert!(!region.is_null());
        pool.init(region, layout.size());
    }
    Arc::new(pool)
}

pub fn hosted() -> (KernelContext, Platform) {
    let context = KernelContext::new(pool(8));
    let platform = install_platform(&context);
    (context, platform)
}

pub extern "C" fn idle_work() {}
