//! Voice bridge HTTP surface
//!
//! Serves health checks and the metrics surface (aggregate and per-session
//! latency/cost summaries) plus session teardown. The real-time media
//! transport lives outside this crate; sessions are registered here by the
//! embedding application.

pub mod http;
pub mod metrics;
pub mod state;

pub use http::create_router;
pub use metrics::{init_metrics, prometheus_handler};
pub use state::AppState;
