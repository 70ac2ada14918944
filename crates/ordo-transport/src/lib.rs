//! Ordo Transport Layer
//!
//! Network access to the orderers:
//! - TCP: line protocol connections, one handler per client
//! - Rate limiting: optional per-client submit throttling
//! - Metrics: Prometheus metrics (optional feature)

pub mod handler;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod rate_limit;
pub mod tcp;

/// Transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

pub use handler::{ConnectionHandler, HandlerContext};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use tcp::TcpServer;
