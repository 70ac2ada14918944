//! TCP transport for Ordo

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use ordo_core::Envelope;
use ordo_protocol::Response;

use crate::handler::{ConnectionHandler, HandlerContext};
use crate::TransportError;

/// TCP server speaking the Ordo line protocol
pub struct TcpServer {
    context: HandlerContext,
    addr: SocketAddr,
    client_counter: AtomicU64,
}

impl TcpServer {
    pub fn new(context: HandlerContext, addr: SocketAddr) -> Self {
        Self {
            context,
            addr,
            client_counter: AtomicU64::new(0),
        }
    }

    /// Accept clients until the listener fails
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Ordo TCP server listening");
        self.serve(listener).await
    }

    /// Accept clients on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let peer = format!(
                        "tcp:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let context = self.context.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, peer.clone(), context).await {
                            error!(peer = %peer, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: String,
        context: HandlerContext,
    ) -> Result<(), TransportError> {
        info!(peer = %peer, "Client connected");

        #[cfg(feature = "metrics")]
        let metrics = context.metrics.clone();
        #[cfg(feature = "metrics")]
        if let Some(m) = &metrics {
            m.record_connection();
        }

        let (mut handler, mut pushes) = ConnectionHandler::new(peer.clone(), context);
        let result = Self::session(&mut stream, &mut handler, &mut pushes).await;

        // Closing without DISCONNECT still produces a Leave
        handler.cleanup().await;

        #[cfg(feature = "metrics")]
        if let Some(m) = &metrics {
            m.record_disconnection();
        }

        info!(peer = %peer, "Client disconnected");
        result
    }

    async fn session(
        stream: &mut TcpStream,
        handler: &mut ConnectionHandler,
        pushes: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<(), TransportError> {
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => return Ok(()),
                        Ok(n) => n,
                        Err(e) => {
                            debug!(peer = %handler.peer, error = %e, "Read error");
                            return Ok(());
                        }
                    };

                    for response in handler.process(&buf[..n]).await {
                        stream.write_all(&response.encode()).await?;

                        if matches!(response, Response::Ok(Some(ref msg)) if msg == "Goodbye") {
                            return Ok(());
                        }
                    }
                }

                message = pushes.recv() => {
                    let Some(message) = message else {
                        // The socket fell behind its document and was closed
                        stream
                            .write_all(&Response::error("LAGGED", "Missed sequenced messages, reconnect").encode())
                            .await?;
                        return Ok(());
                    };
                    stream.write_all(&handler.push(&message).encode()).await?;
                }
            }
        }
    }
}
