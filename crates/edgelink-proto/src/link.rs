//! The bidirectional session link between platform and edge.
//!
//! In production, this wraps tonic gRPC bidirectional streaming channels with
//! optional mTLS. In-process, it uses tokio mpsc pairs for simulation, so the
//! session core can be exercised without a network.

use crate::codec::{ProtoError, Result};
use crate::msg::{RequestMsg, ResponseMsg};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// Transport-security material for the session endpoint.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// PEM-encoded certificate chain.
    pub cert_pem: Vec<u8>,
    /// PEM-encoded private key.
    pub key_pem: Vec<u8>,
}

/// Connection parameters of the session endpoint.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bind address.
    pub bind_addr: String,
    /// Listen port.
    pub port: u16,
    /// Optional transport-security material.
    pub tls: Option<TlsMaterial>,
    /// Maximum inbound message size in bytes.
    pub max_inbound_message_size: usize,
    /// Keep-alive ping interval in seconds.
    pub keepalive_interval_secs: u64,
    /// Keep-alive timeout in seconds.
    pub keepalive_timeout_secs: u64,
    /// Whether keep-alive pings are permitted without in-flight calls.
    pub permit_keepalive_without_calls: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 7070,
            tls: None,
            max_inbound_message_size: 4 * 1024 * 1024,
            keepalive_interval_secs: 300,
            keepalive_timeout_secs: 10,
            permit_keepalive_without_calls: true,
        }
    }
}

/// One half of a bidirectional session link.
///
/// `Out` is the frame type this half sends, `In` the type it receives.
pub struct Link<Out, In> {
    sender: mpsc::Sender<Out>,
    receiver: Mutex<mpsc::Receiver<In>>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

/// The platform half: sends [`ResponseMsg`], receives [`RequestMsg`].
pub type ServerLink = Link<ResponseMsg, RequestMsg>;

/// The edge half: sends [`RequestMsg`], receives [`ResponseMsg`].
pub type ClientLink = Link<RequestMsg, ResponseMsg>;

/// Create a connected (server, client) link pair with the given channel
/// capacity. Both halves observe the same shutdown state.
pub fn link_pair(capacity: usize) -> (ServerLink, ClientLink) {
    let (req_tx, req_rx) = mpsc::channel::<RequestMsg>(capacity);
    let (resp_tx, resp_rx) = mpsc::channel::<ResponseMsg>(capacity);
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);

    let server = Link {
        sender: resp_tx,
        receiver: Mutex::new(req_rx),
        closed_tx: Arc::clone(&closed_tx),
        closed_rx: closed_rx.clone(),
    };
    let client = Link {
        sender: req_tx,
        receiver: Mutex::new(resp_rx),
        closed_tx,
        closed_rx,
    };
    (server, client)
}

impl<Out, In> Link<Out, In> {
    /// Send one frame. Fails with [`ProtoError::LinkClosed`] once either half
    /// has shut the link down.
    pub async fn send(&self, msg: Out) -> Result<()> {
        if *self.closed_rx.borrow() {
            return Err(ProtoError::LinkClosed);
        }
        self.sender.send(msg).await.map_err(|_| ProtoError::LinkClosed)
    }

    /// Receive the next frame, or `None` once the link is shut down.
    ///
    /// Frames already in flight when the link closes are still delivered
    /// (a rejection response must reach the client ahead of the closure);
    /// after the buffer drains, a closed link delivers nothing further.
    pub async fn recv(&self) -> Option<In> {
        let mut receiver = self.receiver.lock().await;
        if let Ok(msg) = receiver.try_recv() {
            return Some(msg);
        }
        let mut closed = self.closed_rx.clone();
        if *closed.borrow_and_update() {
            return None;
        }
        tokio::select! {
            msg = receiver.recv() => msg,
            _ = closed.changed() => receiver.try_recv().ok(),
        }
    }

    /// Shut the link down. Idempotent; both halves observe the closure.
    pub fn shutdown(&self) {
        if !self.closed_tx.send_replace(true) {
            tracing::debug!("session link shut down");
        }
    }

    /// Whether the link is still open.
    pub fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }
}
