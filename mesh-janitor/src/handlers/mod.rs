mod app;
mod retention;

pub use app::app;
pub use retention::add_retention_routes;
