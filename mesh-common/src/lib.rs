pub mod config;
pub mod event;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod signal;
pub mod store;
pub mod time;
