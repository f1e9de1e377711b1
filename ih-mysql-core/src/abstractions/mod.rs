//! Trait abstractions over the local host
//!
//! Production code depends on these interfaces rather than on tokio's
//! process, time and filesystem APIs directly, which keeps every long-running
//! or side-effecting step testable.

pub mod command;
pub mod filesystem;
pub mod time;

pub use command::*;
pub use filesystem::*;
pub use time::*;
