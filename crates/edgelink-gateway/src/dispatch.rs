//! Uplink dispatch: fan a decoded batch out to domain processors by kind.
//!
//! Most kinds dispatch concurrently; user and user-credentials updates are
//! serialized under the session's ordering lock so a reordering by the
//! dispatch layer can never apply credentials before the user record exists.
//! Any failure fails the whole batch as one unit and no partial
//! acknowledgement is sent.

use crate::edge::{EdgeId, TenantId};
use crate::error::{GatewayError, Result};
use crate::session::SessionCore;
use async_trait::async_trait;
use edgelink_proto::msg::{UplinkKind, UplinkMsg, UplinkPayload};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// One domain processor handling uplink sub-messages of one or more kinds.
#[async_trait]
pub trait UplinkProcessor: Send + Sync {
    /// Apply one sub-message against the platform.
    async fn process(
        &self,
        tenant_id: TenantId,
        edge_id: EdgeId,
        msg: UplinkPayload,
    ) -> Result<()>;
}

/// Routes uplink sub-messages to their domain processors.
#[derive(Default)]
pub struct UplinkDispatcher {
    processors: HashMap<UplinkKind, Arc<dyn UplinkProcessor>>,
}

impl UplinkDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the processor for one kind.
    pub fn register(&mut self, kind: UplinkKind, processor: Arc<dyn UplinkProcessor>) {
        self.processors.insert(kind, processor);
    }

    /// Register one processor for several kinds.
    pub fn register_all(&mut self, kinds: &[UplinkKind], processor: Arc<dyn UplinkProcessor>) {
        for kind in kinds {
            self.processors.insert(*kind, Arc::clone(&processor));
        }
    }

    /// Dispatch one batch. Sub-messages of order-sensitive kinds are applied
    /// in arrival order under the session's ordering lock; all other kinds
    /// complete in any order. An error anywhere fails the batch as one unit.
    pub async fn dispatch(&self, session: &SessionCore, batch: UplinkMsg) -> Result<()> {
        let edge = session.edge().await.ok_or(GatewayError::SessionClosed)?;
        let tenant_id = edge.tenant_id;
        let edge_id = edge.id;

        // resolve every processor before any work starts: an unroutable
        // sub-message fails the whole batch up front
        let mut ordered = Vec::new();
        let mut concurrent = Vec::new();
        for msg in batch.msgs {
            let kind = msg.kind();
            let processor =
                Arc::clone(
                    self.processors
                        .get(&kind)
                        .ok_or_else(|| GatewayError::UplinkDispatch {
                            msg: format!("no processor registered for {:?}", kind),
                        })?,
                );
            if msg.is_order_sensitive() {
                ordered.push((processor, msg));
            } else {
                concurrent.push((processor, msg));
            }
        }
        debug!(
            %edge_id,
            ordered = ordered.len(),
            concurrent = concurrent.len(),
            "dispatching uplink batch"
        );

        let mut handles = Vec::with_capacity(concurrent.len());
        for (processor, msg) in concurrent {
            handles.push(tokio::spawn(async move {
                processor.process(tenant_id, edge_id, msg).await
            }));
        }

        let mut failure: Option<String> = None;
        if !ordered.is_empty() {
            let _guard = session.ordering_lock().lock().await;
            for (processor, msg) in ordered {
                if let Err(e) = processor.process(tenant_id, edge_id, msg).await {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e.to_string());
                }
                Err(e) => {
                    failure.get_or_insert(format!("uplink task failed: {e}"));
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(msg) => Err(GatewayError::UplinkDispatch { msg }),
        }
    }
}

/// Recording processor used for embedding and tests: remembers the order in
/// which sub-messages were applied, with an optional artificial delay.
#[derive(Default)]
pub struct RecordingUplinkProcessor {
    applied: Mutex<Vec<UplinkKind>>,
    delay_ms: u64,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingUplinkProcessor {
    /// Create a processor that applies instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a processor that sleeps before applying each sub-message.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    /// Make every subsequent apply fail.
    pub fn fail_all(&self) {
        self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// The kinds applied so far, in application order.
    pub async fn applied(&self) -> Vec<UplinkKind> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl UplinkProcessor for RecordingUplinkProcessor {
    async fn process(
        &self,
        _tenant_id: TenantId,
        _edge_id: EdgeId,
        msg: UplinkPayload,
    ) -> Result<()> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GatewayError::UplinkDispatch {
                msg: "processor failure".to_string(),
            });
        }
        self.applied.lock().await.push(msg.kind());
        Ok(())
    }
}
