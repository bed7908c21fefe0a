//! The agent that runs on every provisioned instance.
//!
//! # Components
//!
//! - [`Worker`]: fixed-interval polling loop that claims jobs up to the
//!   per-instance concurrency limit
//! - [`StatusTracker`]: moves each job's status message from `running` to
//!   `finished` and uploads its log
//! - [`executor`]: the process seam, with [`LocalLauncher`] for real commands
//!
//! # Cycle
//!
//! 1. Advance every active job (refresh or finish its status)
//! 2. Receive jobs while there are free slots, stopping at the first empty receive
//! 3. Start each received job with its output redirected to a log file
//! 4. Sleep, then repeat
//!
//! Under quit-when-empty the Worker terminates its own instance after the
//! job queue has stayed empty, with nothing running, for the idle timeout.

pub mod executor;
pub mod runner;
pub mod status;

pub use executor::{ChildProcess, LocalLauncher, ProcessLauncher};
pub use runner::{Worker, WorkerExit, WorkerServices};
pub use status::StatusTracker;
