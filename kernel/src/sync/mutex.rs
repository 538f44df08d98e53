//! Kernel locks.
//!
//! [`Mutex`] is the lock used throughout the memory subsystem. With the `ticket_mutex` feature
//! it is a [`TicketMutex`], so faulting threads queued on one frame are served in order;
//! otherwise it is a plain [`SpinMutex`].

pub mod spin;
pub mod ticket;

pub use self::spin::{SpinMutex, SpinMutexGuard};
pub use self::ticket::{TicketMutex, TicketMutexGuard};

#[cfg(not(feature = "ticket_mutex"))]
pub use self::spin::{SpinMutex as Mutex, SpinMutexGuard as MutexGuard};
#[cfg(feature = "ticket_mutex")]
pub use self::ticket::{TicketMutex as Mutex, TicketMutexGuard as MutexGuard};
