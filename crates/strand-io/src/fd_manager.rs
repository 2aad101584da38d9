//! Process-wide file-descriptor registry
//!
//! Every fd the hook layer touches gets an `FdCtx` recording what the
//! runtime needs to know: socket-ness, the split between the *system*
//! non-blocking flag (forced on for adopted sockets) and the *user's*
//! O_NONBLOCK intent, and the recv/send timeouts.
//!
//! The registry is a sparse array indexed by fd number behind a
//! reader/writer lock; writers only grow the array or install a slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Which timeout a hooked call consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// SO_RCVTIMEO: read-family calls
    Recv,
    /// SO_SNDTIMEO: write-family calls
    Send,
}

/// No timeout configured
pub const TIMEOUT_NONE: u64 = u64::MAX;

/// Per-fd runtime metadata
pub struct FdCtx {
    fd: i32,
    is_init: bool,
    is_socket: bool,
    is_closed: AtomicBool,
    /// The runtime put the fd into non-blocking mode
    sys_nonblock: AtomicBool,
    /// The user asked for O_NONBLOCK via fcntl/ioctl
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: i32) -> FdCtx {
        let mut is_init = false;
        let mut is_socket = false;
        let mut sys_nonblock = false;

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } == 0 {
            is_init = true;
            is_socket = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        // Adopted sockets run non-blocking underneath, whatever the user
        // believes the fd's mode is.
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_init,
            is_socket,
            is_closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
        }
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }
}

/// Sparse fd-indexed table of contexts
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

/// Initial table capacity
const INITIAL_CAPACITY: usize = 64;

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            slots: RwLock::new(vec![None; INITIAL_CAPACITY]),
        }
    }

    /// Look up the context for `fd`, adopting the fd when `auto_create`
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(ctx) = &slots[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            // fd * 3 / 2 truncates to no growth for tiny fds; round up.
            let new_len = std::cmp::max(idx + 1, slots.len() * 3 / 2);
            slots.resize(new_len, None);
        }
        // Double-checked: another thread may have installed it meanwhile
        if let Some(ctx) = &slots[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Drop the slot for `fd`; existing handles observe it as closed
    pub fn del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let idx = fd as usize;
        let mut slots = self.slots.write().unwrap();
        if idx < slots.len() {
            if let Some(ctx) = slots[idx].take() {
                ctx.set_closed();
            }
        }
    }
}

static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();

/// The process-wide registry
pub fn fd_manager() -> &'static FdManager {
    FD_MANAGER.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_socket_adoption_sets_nonblock() {
        let (a, b) = socketpair();
        let mgr = FdManager::new();

        let ctx = mgr.get(a, true).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        // The underlying fd really is non-blocking now
        let flags = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_lookup_without_create() {
        let mgr = FdManager::new();
        assert!(mgr.get(5, false).is_none());
        assert!(mgr.get(-1, true).is_none());
    }

    #[test]
    fn test_del_marks_closed() {
        let (a, b) = socketpair();
        let mgr = FdManager::new();

        let ctx = mgr.get(a, true).unwrap();
        assert!(!ctx.is_closed());
        mgr.del(a);
        assert!(ctx.is_closed());
        assert!(mgr.get(a, false).is_none());

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_timeouts_default_none() {
        let (a, b) = socketpair();
        let mgr = FdManager::new();
        let ctx = mgr.get(a, true).unwrap();

        assert_eq!(ctx.timeout(TimeoutKind::Recv), TIMEOUT_NONE);
        assert_eq!(ctx.timeout(TimeoutKind::Send), TIMEOUT_NONE);

        ctx.set_timeout(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), TIMEOUT_NONE);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_table_grows_past_capacity() {
        let mgr = FdManager::new();
        // A non-existent fd index far past the initial capacity: the table
        // must grow rather than panic, and the context reports not-init.
        let ctx = mgr.get(300, true).unwrap();
        assert!(!ctx.is_init());
        assert!(!ctx.is_socket());
        mgr.del(300);
    }
}
