//! Error types for the strand runtime

use core::fmt;

/// Result type for scheduler and runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler/runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Scheduler was already started
    AlreadyStarted,

    /// Scheduler has been stopped
    Stopped,

    /// Fiber stack allocation failed (mmap/mprotect errno)
    StackAlloc(i32),

    /// Worker thread creation failed
    ThreadSpawn(i32),

    /// Raw OS error (errno)
    Os(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::Stopped => write!(f, "scheduler stopped"),
            SchedError::StackAlloc(e) => write!(f, "fiber stack allocation failed: errno {}", e),
            SchedError::ThreadSpawn(e) => write!(f, "worker thread spawn failed: errno {}", e),
            SchedError::Os(e) => write!(f, "os error: errno {}", e),
        }
    }
}

impl std::error::Error for SchedError {}

/// Errors from reactor event registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The (fd, event) pair is already registered
    Duplicate,

    /// No scheduler/reactor is running on this thread
    NoReactor,

    /// The readiness facility rejected the registration (errno)
    Poller(i32),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Duplicate => write!(f, "event already registered for this fd"),
            EventError::NoReactor => write!(f, "no reactor on this thread"),
            EventError::Poller(e) => write!(f, "poller registration failed: errno {}", e),
        }
    }
}

impl std::error::Error for EventError {}

impl From<EventError> for SchedError {
    fn from(e: EventError) -> Self {
        match e {
            EventError::Poller(errno) => SchedError::Os(errno),
            _ => SchedError::Os(libc_einval()),
        }
    }
}

// EventError carries no errno for the logical failures; EINVAL is the
// closest raw code when one is forced through SchedError.
#[inline]
fn libc_einval() -> i32 {
    22
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::AlreadyStarted;
        assert_eq!(format!("{}", e), "scheduler already started");

        let e = SchedError::StackAlloc(12);
        assert_eq!(format!("{}", e), "fiber stack allocation failed: errno 12");
    }

    #[test]
    fn test_event_error_conversion() {
        let e: SchedError = EventError::Poller(9).into();
        assert_eq!(e, SchedError::Os(9));

        let e: SchedError = EventError::Duplicate.into();
        assert!(matches!(e, SchedError::Os(_)));
    }
}
