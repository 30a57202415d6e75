//! Operational HTTP endpoints (metrics and health) served next to the
//! reconciliation loop.

pub mod handler;

pub use handler::{run_http_server, AppState, PassStatus};
