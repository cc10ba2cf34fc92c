//! Process lifecycle shared by every adapter.

pub mod shutdown;

pub use shutdown::{SessionGuard, Shutdown, Signal};
