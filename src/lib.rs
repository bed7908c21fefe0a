pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod ids;
pub mod protocol;
pub mod provision;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;
