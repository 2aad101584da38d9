//! Hooked blocking calls
//!
//! Replacement implementations of the blocking I/O entry points. Inside a
//! fiber on a reactor worker, a call that would block parks the fiber on
//! the reactor instead of the OS thread; everywhere else (hook switch off,
//! unknown fd, non-socket, user-requested non-blocking) it falls through
//! to the raw call.
//!
//! Error convention: payload on success, negative errno on failure. The
//! runtime adds exactly two codes of its own: `-ETIMEDOUT` when a
//! configured deadline fires and `-EBADF` for an fd whose context was
//! closed.
//!
//! The per-thread switch defaults to off; reactor workers turn it on at
//! startup (see `RuntimeConfig::hook_workers`).

use crate::fd_manager::{fd_manager, FdCtx, TimeoutKind, TIMEOUT_NONE};
use crate::io_manager::IoManager;
use crate::poller::Event;

use strand_core::{serror, swarn};
use strand_runtime::fiber::{self, Fiber};

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Is the hook switch on for this thread?
#[inline]
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Flip the hook switch for this thread
pub fn set_hook_enable(enable: bool) {
    HOOK_ENABLED.with(|c| c.set(enable));
}

/// Deadline witness for one suspended operation
///
/// Shared by the waiting fiber and (weakly) its condition timer; the
/// timer records the timeout here before cancelling the event.
struct TimerInfo {
    cancelled: AtomicI32,
}

impl TimerInfo {
    fn new() -> TimerInfo {
        TimerInfo {
            cancelled: AtomicI32::new(0),
        }
    }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[inline]
fn os_result(n: isize) -> isize {
    if n == -1 {
        -(errno() as isize)
    } else {
        n
    }
}

#[inline]
fn os_result32(n: i32) -> i32 {
    if n == -1 {
        -errno()
    } else {
        n
    }
}

fn event_errno(e: &strand_core::EventError) -> i32 {
    use strand_core::EventError;
    match e {
        EventError::Duplicate => libc::EEXIST,
        EventError::NoReactor => libc::ENOSYS,
        EventError::Poller(errno) if *errno != 0 => *errno,
        EventError::Poller(_) => libc::EINVAL,
    }
}

/// The shared control flow of every hooked read/write-family call
///
/// Try the raw call; on would-block, park the current fiber on the
/// reactor (plus a condition timer when the fd has a timeout of `kind`),
/// and retry once resumed. Resumption without readiness (cancel) simply
/// goes around the loop again; a fired deadline surfaces as `-ETIMEDOUT`.
fn do_io<F>(fd: i32, raw: F, hook_name: &str, event: Event, kind: TimeoutKind) -> isize
where
    F: Fn() -> isize,
{
    if !is_hook_enable() {
        return os_result(raw());
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return os_result(raw());
    };
    if ctx.is_closed() {
        return -(libc::EBADF as isize);
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return os_result(raw());
    }

    let timeout_ms = ctx.timeout(kind);
    let tinfo = Arc::new(TimerInfo::new());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return os_result(n);
        }

        // Would block: park this fiber on the reactor.
        let Some(iom) = IoManager::current() else {
            return os_result(n);
        };

        let timer = if timeout_ms != TIMEOUT_NONE {
            let winfo = Arc::downgrade(&tinfo);
            let wiom = Arc::downgrade(&iom);
            Some(iom.add_condition_timer(
                timeout_ms,
                move || {
                    let Some(t) = winfo.upgrade() else {
                        return;
                    };
                    if t.cancelled.load(Ordering::Relaxed) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::Relaxed);
                    if let Some(iom) = wiom.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                Arc::downgrade(&tinfo),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event, None) {
            swarn!("{}: add_event({}, {:?}) failed: {}", hook_name, fd, event, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            return -(event_errno(&e) as isize);
        }

        fiber::yield_now();

        // Resumed by readiness, cancel_event or the deadline.
        if let Some(t) = &timer {
            t.cancel();
        }
        if tinfo.cancelled.load(Ordering::Relaxed) == libc::ETIMEDOUT {
            return -(libc::ETIMEDOUT as isize);
        }
        // A hooked close() may have taken the fd away while we waited;
        // re-arming on it would strand this fiber.
        if ctx.is_closed() {
            return -(libc::EBADF as isize);
        }
    }
}

// -- timed sleeps ---------------------------------------------------------

/// Park the current fiber for `ms` milliseconds via a one-shot timer
fn fiber_sleep_ms(iom: &Arc<IoManager>, ms: u64) {
    let fiber = Fiber::current();
    let sched = iom.scheduler().clone();
    iom.add_timer(
        ms,
        move || {
            sched.schedule_fiber(fiber.clone(), -1);
        },
        false,
    );
    fiber::yield_now();
}

pub fn sleep(seconds: u32) -> u32 {
    if !is_hook_enable() {
        return unsafe { libc::sleep(seconds) };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { libc::sleep(seconds) };
    };
    fiber_sleep_ms(&iom, seconds as u64 * 1000);
    0
}

pub fn usleep(usec: u64) -> i32 {
    if !is_hook_enable() {
        return os_result32(unsafe { libc::usleep(usec as libc::useconds_t) });
    }
    let Some(iom) = IoManager::current() else {
        return os_result32(unsafe { libc::usleep(usec as libc::useconds_t) });
    };
    fiber_sleep_ms(&iom, usec / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec) -> i32 {
    if !is_hook_enable() {
        return os_result32(unsafe { libc::nanosleep(req, std::ptr::null_mut()) });
    }
    let Some(iom) = IoManager::current() else {
        return os_result32(unsafe { libc::nanosleep(req, std::ptr::null_mut()) });
    };
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    fiber_sleep_ms(&iom, ms);
    0
}

// -- socket lifecycle -----------------------------------------------------

/// Create a socket; with hooks on, the fd is adopted by the registry
/// (which also flips it to system non-blocking)
pub fn socket(domain: i32, ty: i32, protocol: i32) -> i32 {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        return -errno();
    }
    if is_hook_enable() {
        fd_manager().get(fd, true);
    }
    fd
}

/// Non-blocking connect with an explicit deadline
///
/// On in-progress, WRITE readiness is the completion signal; SO_ERROR
/// delivers the verdict.
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !is_hook_enable() {
        return os_result32(libc::connect(fd, addr, addrlen));
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return -libc::EBADF;
    };
    if ctx.is_closed() {
        return -libc::EBADF;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return os_result32(libc::connect(fd, addr, addrlen));
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return os_result32(n);
    }

    let Some(iom) = IoManager::current() else {
        return -libc::EINPROGRESS;
    };
    let tinfo = Arc::new(TimerInfo::new());

    let timer = if timeout_ms != TIMEOUT_NONE {
        let winfo = Arc::downgrade(&tinfo);
        let wiom = Arc::downgrade(&iom);
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else {
                    return;
                };
                if t.cancelled.load(Ordering::Relaxed) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::Relaxed);
                if let Some(iom) = wiom.upgrade() {
                    iom.cancel_event(fd, Event::WRITE);
                }
            },
            Arc::downgrade(&tinfo),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            fiber::yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::Relaxed);
            if cancelled != 0 {
                return -cancelled;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            serror!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // The connection either completed or failed; SO_ERROR knows which.
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut i32 as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -errno();
    }
    if err == 0 {
        0
    } else {
        -err
    }
}

/// Hooked connect; deadline comes from the reactor configuration
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect(fd: i32, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    let timeout_ms = IoManager::current()
        .map(|iom| iom.config().connect_timeout_ms)
        .unwrap_or(TIMEOUT_NONE);
    connect_with_timeout(fd, addr, addrlen, timeout_ms)
}

/// Hooked accept; the new connection is adopted by the registry
///
/// # Safety
///
/// `addr`/`addrlen` follow the raw accept contract (both may be null).
pub unsafe fn accept(
    fd: i32,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> i32 {
    let n = do_io(
        fd,
        || unsafe { libc::accept(fd, addr, addrlen) as isize },
        "accept",
        Event::READ,
        TimeoutKind::Recv,
    );
    if n >= 0 {
        fd_manager().get(n as i32, true);
    }
    n as i32
}

// -- read family ----------------------------------------------------------

pub fn read(fd: i32, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(
        fd,
        || unsafe { libc::read(fd, ptr as *mut libc::c_void, len) },
        "read",
        Event::READ,
        TimeoutKind::Recv,
    )
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(
        fd,
        || unsafe { libc::readv(fd, iov, iovcnt) },
        "readv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

pub fn recv(fd: i32, buf: &mut [u8], flags: i32) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(
        fd,
        || unsafe { libc::recv(fd, ptr as *mut libc::c_void, len, flags) },
        "recv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

/// # Safety
///
/// `src_addr`/`addrlen` follow the raw recvfrom contract (both may be null).
pub unsafe fn recvfrom(
    fd: i32,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(
        fd,
        || unsafe { libc::recvfrom(fd, ptr as *mut libc::c_void, len, flags, src_addr, addrlen) },
        "recvfrom",
        Event::READ,
        TimeoutKind::Recv,
    )
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: i32, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(
        fd,
        || unsafe { libc::recvmsg(fd, msg, flags) },
        "recvmsg",
        Event::READ,
        TimeoutKind::Recv,
    )
}

// -- write family ---------------------------------------------------------

pub fn write(fd: i32, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(
        fd,
        || unsafe { libc::write(fd, ptr as *const libc::c_void, len) },
        "write",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(
        fd,
        || unsafe { libc::writev(fd, iov, iovcnt) },
        "writev",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

pub fn send(fd: i32, buf: &[u8], flags: i32) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(
        fd,
        || unsafe { libc::send(fd, ptr as *const libc::c_void, len, flags) },
        "send",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

/// # Safety
///
/// `dest_addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn sendto(
    fd: i32,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(
        fd,
        || unsafe { libc::sendto(fd, ptr as *const libc::c_void, len, flags, dest_addr, addrlen) },
        "sendto",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: i32, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(
        fd,
        || unsafe { libc::sendmsg(fd, msg, flags) },
        "sendmsg",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

// -- fd lifecycle and options ---------------------------------------------

/// Hooked close: cancel all armed events, drop the registry slot, then
/// close the fd for real
pub fn close(fd: i32) -> i32 {
    if !is_hook_enable() {
        return os_result32(unsafe { libc::close(fd) });
    }
    if fd_manager().get(fd, false).is_some() {
        // Mark-and-drop first: waiters woken by cancel_all below observe
        // the closed context instead of re-arming on a dying fd.
        fd_manager().del(fd);
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
    }
    os_result32(unsafe { libc::close(fd) })
}

/// Hooked fcntl
///
/// F_SETFL records the user's O_NONBLOCK intent and forwards the system
/// flags (adopted sockets always stay non-blocking underneath); F_GETFL
/// reports the user's intent back, preserving the illusion. Everything
/// else forwards unchanged with `arg`.
pub fn fcntl(fd: i32, cmd: i32, arg: i64) -> i32 {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as i32;
            if let Some(ctx) = socket_ctx(fd) {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    flags |= libc::O_NONBLOCK;
                } else {
                    flags &= !libc::O_NONBLOCK;
                }
            }
            os_result32(unsafe { libc::fcntl(fd, cmd, flags) })
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                return -errno();
            }
            match socket_ctx(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => os_result32(unsafe { libc::fcntl(fd, cmd, arg as libc::c_long) }),
    }
}

fn socket_ctx(fd: i32) -> Option<Arc<FdCtx>> {
    fd_manager()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
}

/// Hooked ioctl; FIONBIO mirrors the F_SETFL path
///
/// # Safety
///
/// `argp` must be valid for `request`; FIONBIO reads an int through it.
pub unsafe fn ioctl(fd: i32, request: libc::c_ulong, argp: *mut libc::c_void) -> i32 {
    if request == libc::FIONBIO as libc::c_ulong {
        let user_nonblock = *(argp as *const i32) != 0;
        if let Some(ctx) = socket_ctx(fd) {
            ctx.set_user_nonblock(user_nonblock);
        }
    }
    os_result32(libc::ioctl(fd, request, argp))
}

/// Pass-through getsockopt
///
/// # Safety
///
/// Raw getsockopt contract.
pub unsafe fn getsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    os_result32(libc::getsockopt(fd, level, optname, optval, optlen))
}

/// Hooked setsockopt; SO_RCVTIMEO/SO_SNDTIMEO are recorded in the fd
/// context (milliseconds) before the raw call is forwarded unchanged
///
/// # Safety
///
/// Raw setsockopt contract; the timeout options read a timeval through
/// `optval`.
pub unsafe fn setsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = fd_manager().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            // Zero timeval means "no timeout" in the sockopt contract
            ctx.set_timeout(kind, if ms == 0 { TIMEOUT_NONE } else { ms });
        }
    }
    os_result32(libc::setsockopt(fd, level, optname, optval, optlen))
}
