//! Prometheus metrics for Ordo
//!
//! Exposed in Prometheus text format over a minimal HTTP endpoint.

use crate::TransportError;
use ordo_core::RoutingStats;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Ordo metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub connections_total: IntCounter,
    pub connections_active: IntGauge,

    pub commands_total: IntCounterVec,
    pub commands_errors: IntCounterVec,
    pub command_duration_seconds: HistogramVec,

    /// Documents by ordering route
    pub documents_routed: IntGaugeVec,
    pub messages_pushed: IntCounter,
    pub rate_limited_submits: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounter::new("ordo_connections_total", "Total client connections")?;
        let connections_active = IntGauge::new("ordo_connections_active", "Open client connections")?;

        let commands_total = IntCounterVec::new(
            Opts::new("ordo_commands_total", "Commands processed"),
            &["command"],
        )?;
        let commands_errors = IntCounterVec::new(
            Opts::new("ordo_commands_errors_total", "Commands answered with an error"),
            &["command", "code"],
        )?;
        let command_duration_seconds = HistogramVec::new(
            HistogramOpts::new("ordo_command_duration_seconds", "Command processing duration")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["command"],
        )?;

        let documents_routed = IntGaugeVec::new(
            Opts::new("ordo_documents_routed", "Documents currently dispatched, by route"),
            &["route"],
        )?;
        let messages_pushed = IntCounter::new(
            "ordo_messages_pushed_total",
            "Sequenced messages pushed to clients",
        )?;
        let rate_limited_submits = IntCounter::new(
            "ordo_rate_limited_submits_total",
            "Submits rejected by the per-client rate limit",
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(commands_errors.clone()))?;
        registry.register(Box::new(command_duration_seconds.clone()))?;
        registry.register(Box::new(documents_routed.clone()))?;
        registry.register(Box::new(messages_pushed.clone()))?;
        registry.register(Box::new(rate_limited_submits.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            commands_total,
            commands_errors,
            command_duration_seconds,
            documents_routed,
            messages_pushed,
            rate_limited_submits,
        })
    }

    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    pub fn record_command(&self, command: &str, duration_secs: f64) {
        self.commands_total.with_label_values(&[command]).inc();
        self.command_duration_seconds
            .with_label_values(&[command])
            .observe(duration_secs);
    }

    pub fn record_error(&self, command: &str, code: &str) {
        self.commands_errors.with_label_values(&[command, code]).inc();
    }

    pub fn observe_routing(&self, stats: &RoutingStats) {
        self.documents_routed
            .with_label_values(&["local"])
            .set(stats.local_documents as i64);
        self.documents_routed
            .with_label_values(&["log"])
            .set(stats.log_documents as i64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String, TransportError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| TransportError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TransportError::Metrics(e.to_string()))
    }
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };

                        let request = String::from_utf8_lossy(&buf[..n]);
                        let response = render(&metrics, &request);
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

fn render(metrics: &Metrics, request: &str) -> String {
    if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
        match metrics.export() {
            Ok(body) => format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                 Content-Length: {}\r\n\
                 \r\n\
                 {}",
                body.len(),
                body
            ),
            Err(e) => {
                error!(error = %e, "Failed to export metrics");
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        }
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK".to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_connection();
        metrics.record_command("submit", 0.001);
        metrics.record_error("submit", "LEASE_LOST");
        metrics.observe_routing(&RoutingStats {
            local_documents: 2,
            log_documents: 1,
        });

        let text = metrics.export().unwrap();
        assert!(text.contains("ordo_connections_active 1"));
        assert!(text.contains("ordo_commands_total{command=\"submit\"} 1"));
        assert!(text.contains("ordo_documents_routed{route=\"local\"} 2"));
    }

    #[test]
    fn test_render_routes() {
        let metrics = Metrics::new().unwrap();
        assert!(render(&metrics, "GET /health HTTP/1.1\r\n").ends_with("OK"));
        assert!(render(&metrics, "GET /metrics HTTP/1.1\r\n").starts_with("HTTP/1.1 200"));
        assert!(render(&metrics, "GET /nope HTTP/1.1\r\n").starts_with("HTTP/1.1 404"));
    }
}
