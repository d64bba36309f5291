pub mod config;
pub mod delivery;
pub mod error;
pub mod queue;
pub mod relay;
pub mod target;
pub mod worker;
