//! Fiber stack allocation
//!
//! Each worker fiber owns an mmap'd stack with a PROT_NONE guard page at
//! the low end, so overflow faults instead of corrupting a neighbour.

use strand_core::error::{SchedError, SchedResult};

/// Owned stack mapping for one fiber
pub struct Stack {
    base: *mut u8,
    total_size: usize,
    guard_size: usize,
}

// The mapping is owned exclusively by its fiber; the raw pointer is only a
// region handle.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl Stack {
    /// Map a stack of at least `size` usable bytes plus one guard page
    pub fn new(size: usize) -> SchedResult<Stack> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::StackAlloc(last_errno()));
        }

        // Usable region above the guard page becomes read/write
        let rw_base = unsafe { (base as *mut u8).add(page) };
        let ret = unsafe {
            libc::mprotect(
                rw_base as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            let errno = last_errno();
            unsafe { libc::munmap(base, total) };
            return Err(SchedError::StackAlloc(errno));
        }

        Ok(Stack {
            base: base as *mut u8,
            total_size: total,
            guard_size: page,
        })
    }

    /// High end of the stack; execution grows downward from here
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total_size) }
    }

    /// Usable bytes (excludes the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.total_size - self.guard_size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alloc() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);
        assert!(!stack.top().is_null());
    }

    #[test]
    fn test_stack_rounds_to_pages() {
        let stack = Stack::new(1000).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= 1000);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024).unwrap();
        // Touch the top and a spot near the bottom of the usable region
        unsafe {
            let top = stack.top();
            *top.sub(8) = 0xAB;
            *top.sub(stack.size() - 1) = 0xCD;
            assert_eq!(*top.sub(8), 0xAB);
        }
    }
}
