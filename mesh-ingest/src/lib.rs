pub mod config;
pub mod dedup;
pub mod error;
pub mod live;
pub mod router;
pub mod server;
pub mod sink;
pub mod subscriber;
