//! Ordo Daemon (ordod)
//!
//! Serves the Ordo line protocol and orders document operations, either
//! locally under a document lease or through the shared log.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (TCP on 7400, in-memory backend)
//! ordod
//!
//! # Durable log and fleet state shared by nodes on this host
//! ordod --backend sqlite --db /var/lib/ordo/ordo.db --node-id a --port 7400
//! ordod --backend sqlite --db /var/lib/ordo/ordo.db --node-id b --port 7401
//!
//! # With configuration file
//! ordod --config /etc/ordo/ordo.toml
//! ```

mod config;
mod resources;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use ordo_transport::{HandlerContext, TcpServer};

use crate::config::{Args, Config};
use crate::resources::Resources;

/// How often empty broadcast groups are dropped
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(args)?;

    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let listen_addr = config.listen_addr()?;
    let mut resources = Resources::build(config)?;
    let config = resources.config.clone();

    info!(
        node = %config.node_id,
        addr = %listen_addr,
        backend = ?config.backend,
        local_ordering = config.local_ordering,
        lease_ttl_ms = config.ordering.lease_ttl.as_millis() as u64,
        "Starting Ordo daemon"
    );

    // This node must be live before it may take leases
    resources.nodes.heartbeat().await?;

    let mut handles = Vec::new();

    handles.push(tokio::spawn(
        resources.nodes.clone().run(config.ordering.heartbeat_interval),
    ));

    if let Some(local) = &resources.local {
        handles.push(tokio::spawn(
            local.clone().run_renewal(config.ordering.renew_interval),
        ));
    }

    if let Some(tail) = resources.take_tail() {
        handles.push(tokio::spawn(resources.sequencer.clone().run(tail)));
    }

    let mut context = HandlerContext::new(resources.manager.clone(), resources.hub.clone())
        .with_nodes(resources.nodes.clone());

    if let Some(limit) = config.rate_limit {
        info!(rate = limit.requests_per_second, burst = limit.burst_size, "Rate limiting enabled");
        context = context.with_rate_limit(limit);
    }

    #[cfg(feature = "metrics")]
    {
        use ordo_transport::{Metrics, MetricsServer};
        use std::sync::Arc;

        let metrics = Arc::new(Metrics::new()?);
        context = context.with_metrics(metrics.clone());

        let server = MetricsServer::new(metrics.clone(), config.metrics_addr()?);
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Metrics server error");
            }
        }));

        let manager = resources.manager.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                metrics.observe_routing(&manager.stats());
            }
        }));
    }

    let tcp_server = TcpServer::new(context, listen_addr);
    handles.push(tokio::spawn(async move {
        if let Err(e) = tcp_server.run().await {
            error!(error = %e, "TCP server error");
        }
    }));

    let hub = resources.hub.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let removed = hub.prune();
            if removed > 0 {
                tracing::debug!(removed, "Pruned idle broadcast groups");
            }
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for handle in &handles {
        handle.abort();
    }
    resources.dispose().await;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╔═╗╦═╗╔╦╗╔═╗
  ║ ║╠╦╝ ║║║ ║
  ╚═╝╩╚══╩╝╚═╝
  Operation ordering for collaborative documents
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
