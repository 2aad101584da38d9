//! Readiness polling over epoll
//!
//! Registrations are always edge-triggered: consumers must drain until
//! would-block after a wakeup.

use bitflags::bitflags;

bitflags! {
    /// Reactor interest/readiness bits
    ///
    /// The values coincide with `EPOLLIN`/`EPOLLOUT` on purpose; an empty
    /// set is "no event".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

impl Event {
    pub(crate) fn to_epoll(self) -> u32 {
        let mut mask = 0u32;
        if self.contains(Event::READ) {
            mask |= libc::EPOLLIN as u32;
        }
        if self.contains(Event::WRITE) {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Thin epoll wrapper; errors are raw errno values
pub struct Poller {
    epfd: i32,
}

impl Poller {
    pub fn new() -> Result<Poller, i32> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(errno());
        }
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: i32, fd: i32, events: Option<(Event, u64)>) -> Result<(), i32> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ev_ptr = match events {
            Some((interest, data)) => {
                ev.events = interest.to_epoll() | libc::EPOLLET as u32;
                ev.u64 = data;
                &mut ev as *mut libc::epoll_event
            }
            // DEL ignores the event argument
            None => std::ptr::null_mut(),
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, ev_ptr) };
        if rt != 0 {
            return Err(errno());
        }
        Ok(())
    }

    /// Register `fd` with edge-triggered interest
    pub fn add(&self, fd: i32, interest: Event, data: u64) -> Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some((interest, data)))
    }

    /// Replace the interest set of an already-registered fd
    pub fn modify(&self, fd: i32, interest: Event, data: u64) -> Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some((interest, data)))
    }

    /// Remove `fd` entirely
    pub fn remove(&self, fd: i32) -> Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Block up to `timeout_ms` for events; returns how many landed in `events`
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize, i32> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(errno());
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_nonblock() -> (i32, i32) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    #[test]
    fn test_event_epoll_mapping() {
        assert_eq!(Event::READ.bits(), 0x1);
        assert_eq!(Event::WRITE.bits(), 0x4);
        assert_eq!(Event::READ.to_epoll(), libc::EPOLLIN as u32);
        assert_eq!(Event::WRITE.to_epoll(), libc::EPOLLOUT as u32);
        assert_eq!(Event::empty().to_epoll(), 0);
    }

    #[test]
    fn test_pipe_readiness() {
        let poller = Poller::new().unwrap();
        let (r, w) = pipe_nonblock();
        poller.add(r, Event::READ, r as u64).unwrap();

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
        // Nothing readable yet
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);

        assert_eq!(
            unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        let n = poller.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let ev0 = events[0];
        let ev0_u64 = ev0.u64;
        let ev0_events = ev0.events;
        assert_eq!(ev0_u64, r as u64);
        assert_ne!(ev0_events & libc::EPOLLIN as u32, 0);

        poller.remove(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_modify_interest() {
        let poller = Poller::new().unwrap();
        let (r, w) = pipe_nonblock();
        // Write end is immediately writable
        poller.add(w, Event::WRITE, w as u64).unwrap();

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = poller.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        assert_ne!(events[0].events & libc::EPOLLOUT as u32, 0);

        poller.remove(w).unwrap();
        // Double-remove surfaces ENOENT
        assert_eq!(poller.remove(w), Err(libc::ENOENT));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
