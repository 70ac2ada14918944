//! Connection handler - runs one client's commands against the orderers

use crate::rate_limit::{RateLimitConfig, RateLimiter};
use ordo_core::{
    BroadcastHub, DocumentKey, Envelope, Error, HubSocket, NodeManager, Operation,
    OrdererConnection, OrdererManager,
};
use ordo_protocol::{Command, CommandKind, Parser, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Shared services every handler works against
#[derive(Clone)]
pub struct HandlerContext {
    pub manager: Arc<OrdererManager>,
    pub hub: Arc<BroadcastHub>,
    pub nodes: Option<Arc<NodeManager>>,
    pub rate_limit: Option<RateLimitConfig>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Arc<Metrics>>,
}

impl HandlerContext {
    pub fn new(manager: Arc<OrdererManager>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            manager,
            hub,
            nodes: None,
            rate_limit: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_nodes(mut self, nodes: Arc<NodeManager>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Handles a single client session.
///
/// A session owns at most one orderer connection at a time.
pub struct ConnectionHandler {
    /// Peer label used in logs
    pub peer: String,
    context: HandlerContext,
    parser: Parser,
    socket: HubSocket,
    connection: Option<Box<dyn OrdererConnection>>,
    limiter: Option<RateLimiter>,
}

impl ConnectionHandler {
    /// Create a handler and the queue of sequenced messages pushed to it
    pub fn new(peer: String, context: HandlerContext) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (socket, pushes) = HubSocket::new(context.hub.clone());
        let limiter = context.rate_limit.map(RateLimiter::new);
        let handler = Self {
            peer,
            context,
            parser: Parser::new(),
            socket,
            connection: None,
            limiter,
        };
        (handler, pushes)
    }

    /// Client id of the live connection, if any
    pub fn client_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.client_id())
    }

    /// Process incoming data and return responses
    pub async fn process(&mut self, data: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();

        if let Err(e) = self.parser.feed(data) {
            responses.push(Response::error(e.code(), e.to_string()));
            return responses;
        }

        loop {
            match self.parser.parse() {
                Ok(Some(cmd)) => {
                    let response = self.handle_command(cmd).await;
                    responses.push(response);
                }
                Ok(None) => break,
                Err(e) => {
                    responses.push(Response::error(e.code(), e.to_string()));
                    break;
                }
            }
        }

        responses
    }

    async fn handle_command(&mut self, cmd: Command) -> Response {
        debug!(peer = %self.peer, cmd = ?cmd.kind, "Processing command");
        let name = cmd.name();
        let started = Instant::now();

        let response = match cmd.kind {
            CommandKind::Connect {
                tenant_id,
                user,
                client,
            } => {
                let document_id = cmd.document_id.unwrap_or_default();
                self.handle_connect(tenant_id, document_id, user, client).await
            }
            CommandKind::Submit {
                client_sequence_number,
                reference_sequence_number,
                contents,
            } => {
                self.handle_submit(client_sequence_number, reference_sequence_number, contents)
                    .await
            }
            CommandKind::Disconnect => self.handle_disconnect().await,
            CommandKind::Ping => Response::pong(),
            CommandKind::Quit => Response::ok_with_message("Goodbye"),
            CommandKind::Info => self.handle_info(),
            CommandKind::Nodes => self.handle_nodes().await,
        };

        self.record(name, started, &response);
        response
    }

    #[cfg(feature = "metrics")]
    fn record(&self, name: &str, started: Instant, response: &Response) {
        if let Some(metrics) = &self.context.metrics {
            metrics.record_command(name, started.elapsed().as_secs_f64());
            if let Response::Error { code, .. } = response {
                metrics.record_error(name, code);
                if code == "RATE_LIMITED" {
                    metrics.rate_limited_submits.inc();
                }
            }
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record(&self, _name: &str, _started: Instant, _response: &Response) {}

    async fn handle_connect(&mut self, tenant_id: String, document_id: String, user: Value, client: Value) -> Response {
        if let Some(existing) = &self.connection {
            return Response::error(
                "ALREADY_CONNECTED",
                format!("Already connected to {}", existing.key()),
            );
        }

        let key = match DocumentKey::new(tenant_id, document_id) {
            Ok(key) => key,
            Err(e) => return Response::from_error(&e),
        };

        let orderer = match self.context.manager.get_orderer(&key).await {
            Ok(orderer) => orderer,
            Err(e) => {
                warn!(peer = %self.peer, document = %key, error = %e, "No orderer for document");
                return Response::from_error(&e);
            }
        };

        let connection = match orderer.connect(&self.socket, user, client).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(peer = %self.peer, document = %key, error = %e, "Connect failed");
                self.socket.leave_all();
                return Response::from_error(&e);
            }
        };

        let route = self.context.manager.route(&key).map(|r| r.to_string());
        info!(
            peer = %self.peer,
            document = %key,
            client_id = %connection.client_id(),
            route = route.as_deref().unwrap_or("unknown"),
            "Client connected to document"
        );

        let reply = json!({
            "clientId": connection.client_id(),
            "tenantId": key.tenant_id(),
            "documentId": key.document_id(),
            "existing": connection.existing(),
            "parentBranch": connection.parent_branch(),
            "route": route,
        });
        self.connection = Some(connection);
        Response::json(&reply)
    }

    async fn handle_submit(&mut self, csn: i64, rsn: i64, contents: Value) -> Response {
        let Some(connection) = &self.connection else {
            return Response::error("NOT_CONNECTED", "CONNECT to a document first");
        };

        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire() {
                return Response::error("RATE_LIMITED", "Submit rate exceeded");
            }
        }

        let result = connection.submit(Operation::edit(csn, rsn, contents)).await;
        match result {
            Ok(()) => Response::ok(),
            Err(e @ Error::LeaseLost(_)) => {
                // The connection cannot be used again; the client must reconnect
                warn!(peer = %self.peer, error = %e, "Connection lost its document lease");
                self.connection = None;
                self.socket.leave_all();
                Response::from_error(&e)
            }
            Err(e) => Response::from_error(&e),
        }
    }

    async fn handle_disconnect(&mut self) -> Response {
        let Some(connection) = self.connection.take() else {
            return Response::error("NOT_CONNECTED", "No open connection");
        };

        let result = connection.disconnect().await;
        self.socket.leave_all();
        match result {
            Ok(()) => {
                info!(peer = %self.peer, client_id = %connection.client_id(), "Client disconnected from document");
                Response::ok()
            }
            Err(e) => Response::from_error(&e),
        }
    }

    fn handle_info(&self) -> Response {
        let stats = self.context.manager.stats();
        let held = self
            .context
            .manager
            .local()
            .map(|local| local.held())
            .unwrap_or_default();

        let info = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "node": self.context.nodes.as_ref().map(|n| n.node_id().to_string()),
            "peer": self.peer,
            "clientId": self.client_id(),
            "document": self.connection.as_ref().map(|c| c.key().to_string()),
            "localDocuments": stats.local_documents,
            "logDocuments": stats.log_documents,
            "leases": held,
            "groups": self.context.hub.group_count(),
        });
        Response::json(&info)
    }

    async fn handle_nodes(&self) -> Response {
        let Some(nodes) = &self.context.nodes else {
            return Response::array(Vec::new());
        };

        match nodes.live_nodes().await {
            Ok(live) => Response::array(live.iter().map(Response::json).collect()),
            Err(e) => Response::from_error(&e),
        }
    }

    /// Frame a sequenced message for the client
    pub fn push(&self, message: &Envelope) -> Response {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.context.metrics {
            metrics.messages_pushed.inc();
        }
        Response::sequenced(message)
    }

    /// Clean up when the client goes away: leave on its behalf
    pub async fn cleanup(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.disconnect().await {
                warn!(peer = %self.peer, client_id = %connection.client_id(), error = %e, "Failed to issue leave");
            } else {
                debug!(peer = %self.peer, client_id = %connection.client_id(), "Issued leave for closed session");
            }
        }
        self.socket.leave_all();
    }
}
