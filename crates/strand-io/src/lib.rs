//! # strand-io
//!
//! The I/O half of the strand runtime:
//!
//! - `poller` - edge-triggered epoll wrapper and the `Event` mask
//! - `fd_manager` - process-wide per-fd metadata registry
//! - `io_manager` - the reactor: scheduler whose idle fibers block in the
//!   poller and feed ready events and expired timers back into the queue
//! - `hook` - replacement blocking calls that park fibers instead of
//!   OS threads

pub mod fd_manager;
pub mod hook;
pub mod io_manager;
pub mod poller;

pub use fd_manager::{fd_manager, FdCtx, FdManager, TimeoutKind, TIMEOUT_NONE};
pub use hook::{is_hook_enable, set_hook_enable};
pub use io_manager::IoManager;
pub use poller::{Event, Poller};
