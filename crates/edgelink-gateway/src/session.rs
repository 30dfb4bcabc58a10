//! The edge session: one edge's connection lifecycle, outbound queueing,
//! the event-check loop, and the sync state machine.
//!
//! Shared per-session state lives in [`SessionCore`], a composed struct the
//! backend variants wrap; the variants never subclass session state.

use crate::config::GatewayConfig;
use crate::edge::{Edge, EdgeId, EdgeSessionId, TenantId};
use crate::error::{GatewayError, Result};
use crate::event::EdgeEvent;
use crate::provider::EntityFetchProvider;
use crate::store::{EventStore, EventStoreFactory};
use crate::sync::SyncCursor;
use crate::translate::DownlinkConverter;
use edgelink_proto::link::ServerLink;
use edgelink_proto::msg::{
    ConnectRequestMsg, ConnectResponseCode, ConnectResponseMsg, DownlinkMsg, DownlinkPayload,
    DownlinkResponseMsg, RequestMsg, ResponseMsg,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

/// Internal counters with atomic fields for lock-free updates.
#[derive(Debug, Default)]
struct SessionStatsInner {
    events_sent: AtomicU64,
    batches_sent: AtomicU64,
    events_skipped: AtomicU64,
    high_priority_sent: AtomicU64,
}

/// Snapshot of one session's delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Downlink messages acknowledged by the edge.
    pub events_sent: u64,
    /// Acknowledged batches.
    pub batches_sent: u64,
    /// Events dropped because conversion failed.
    pub events_skipped: u64,
    /// Messages delivered through the high-priority path.
    pub high_priority_sent: u64,
}

/// Shared state of one edge session. Composed into both backend variants.
pub struct SessionCore {
    session_id: EdgeSessionId,
    config: GatewayConfig,
    link: ServerLink,
    edge: RwLock<Option<Edge>>,
    connected: AtomicBool,
    syncing: AtomicBool,
    migrated: AtomicBool,
    hp_draining: AtomicBool,
    new_events: AtomicBool,
    event_notify: Notify,
    msg_id_seq: AtomicU64,
    pending: Mutex<HashMap<u64, DownlinkPayload>>,
    ack_notify: Notify,
    hp_queue: Mutex<VecDeque<DownlinkPayload>>,
    ordering_lock: Mutex<()>,
    converter: DownlinkConverter,
    stats: SessionStatsInner,
}

impl SessionCore {
    /// Create the shared state for a fresh, not-yet-connected session.
    pub fn new(link: ServerLink, config: GatewayConfig) -> Self {
        Self {
            session_id: EdgeSessionId::random(),
            config,
            link,
            edge: RwLock::new(None),
            connected: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            migrated: AtomicBool::new(false),
            hp_draining: AtomicBool::new(false),
            new_events: AtomicBool::new(false),
            event_notify: Notify::new(),
            msg_id_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            ack_notify: Notify::new(),
            hp_queue: Mutex::new(VecDeque::new()),
            ordering_lock: Mutex::new(()),
            converter: DownlinkConverter,
            stats: SessionStatsInner::default(),
        }
    }

    /// The opaque token identifying this session instance.
    pub fn session_id(&self) -> EdgeSessionId {
        self.session_id
    }

    /// The session configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Whether the session is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The cached edge, set by a successful handshake.
    pub async fn edge(&self) -> Option<Edge> {
        self.edge.read().await.clone()
    }

    /// The cached edge id.
    pub async fn edge_id(&self) -> Option<EdgeId> {
        self.edge.read().await.as_ref().map(|e| e.id)
    }

    /// The cached tenant id.
    pub async fn tenant_id(&self) -> Option<TenantId> {
        self.edge.read().await.as_ref().map(|e| e.tenant_id)
    }

    /// The lock serializing sequence-dependent uplink kinds.
    pub fn ordering_lock(&self) -> &Mutex<()> {
        &self.ordering_lock
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            events_skipped: self.stats.events_skipped.load(Ordering::Relaxed),
            high_priority_sent: self.stats.high_priority_sent.load(Ordering::Relaxed),
        }
    }

    /// Receive the next inbound frame, or `None` once the link is closed.
    pub async fn recv(&self) -> Option<RequestMsg> {
        self.link.recv().await
    }

    /// Send one outbound frame.
    pub async fn send_response(&self, msg: ResponseMsg) -> Result<()> {
        self.link.send(msg).await?;
        Ok(())
    }

    /// Close the underlying link. Idempotent.
    pub fn shutdown_link(&self) {
        self.link.shutdown();
    }

    /// Mark new events pending and wake the event-check loop. A flag set here
    /// is only cleared by the loop itself after it has been observed, so a
    /// signal can never be lost to a race with the loop's own clear.
    pub fn signal_new_events(&self) {
        self.new_events.store(true, Ordering::SeqCst);
        self.event_notify.notify_one();
    }

    /// Consume the "new events pending" flag.
    pub(crate) fn take_new_events(&self) -> bool {
        self.new_events.swap(false, Ordering::SeqCst)
    }

    /// Queue one urgent downlink, bypassing the batch path. The queue is
    /// bounded; a push over capacity is rejected, not silently dropped.
    pub async fn push_high_priority(&self, payload: DownlinkPayload) -> Result<()> {
        let capacity = self.config.max_high_priority_queue_size;
        {
            let mut queue = self.hp_queue.lock().await;
            if queue.len() >= capacity {
                warn!(
                    session_id = %self.session_id,
                    capacity,
                    "high priority queue full, rejecting message"
                );
                return Err(GatewayError::HighPriorityQueueFull { capacity });
            }
            queue.push_back(payload);
        }
        self.signal_new_events();
        Ok(())
    }

    /// Number of queued high-priority messages.
    pub async fn high_priority_len(&self) -> usize {
        self.hp_queue.lock().await.len()
    }

    /// Number of in-flight, unacknowledged downlink messages.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send one batch of downlink payloads and wait for the edge to
    /// acknowledge every message. Nothing is considered delivered until the
    /// acknowledgement arrives; on timeout or link failure the in-flight
    /// entries are withdrawn and the caller retries from the same position.
    pub async fn send_downlink_batch(&self, payloads: Vec<DownlinkPayload>) -> Result<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }
        let mut batch = Vec::with_capacity(payloads.len());
        {
            let mut pending = self.pending.lock().await;
            for payload in payloads {
                let msg_id = self.msg_id_seq.fetch_add(1, Ordering::SeqCst) + 1;
                pending.insert(msg_id, payload.clone());
                batch.push(DownlinkMsg { msg_id, payload });
            }
        }
        let ids: Vec<u64> = batch.iter().map(|m| m.msg_id).collect();
        for msg in batch {
            if let Err(e) = self.link.send(ResponseMsg::Downlink(msg)).await {
                self.forget_pending(&ids).await;
                return Err(e.into());
            }
        }
        if !self.wait_for_acks(&ids).await {
            self.forget_pending(&ids).await;
            return Err(GatewayError::EventStore {
                msg: "downlink batch was not acknowledged in time".to_string(),
            });
        }
        let n = ids.len();
        self.stats.events_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    /// Translate a page of events and send the result as one batch.
    /// Conversion failures are logged and skipped so one bad event cannot
    /// block the rest of the page.
    pub async fn convert_and_send(&self, events: &[EdgeEvent]) -> Result<usize> {
        let edge = self.edge().await.ok_or(GatewayError::SessionClosed)?;
        let mut payloads = Vec::with_capacity(events.len());
        for event in events {
            match self.converter.convert(&edge, event) {
                Ok(Some(payload)) => payloads.push(payload),
                Ok(None) => {}
                Err(e) => {
                    warn!(seq = event.seq, error = %e, "skipping event that failed conversion");
                    self.stats.events_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.send_downlink_batch(payloads).await
    }

    /// Apply one acknowledgement from the edge.
    pub async fn handle_downlink_ack(&self, ack: &DownlinkResponseMsg) {
        let removed = self.pending.lock().await.remove(&ack.msg_id);
        if removed.is_some() {
            if !ack.success {
                warn!(
                    msg_id = ack.msg_id,
                    error = %ack.error_msg,
                    "edge reported failure for downlink message"
                );
            }
            self.ack_notify.notify_waiters();
        }
    }

    async fn wait_for_acks(&self, ids: &[u64]) -> bool {
        let deadline = Duration::from_millis(self.config.send_ack_timeout_ms);
        let wait = async {
            loop {
                let notified = self.ack_notify.notified();
                {
                    let pending = self.pending.lock().await;
                    if !ids.iter().any(|id| pending.contains_key(id)) {
                        return;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }

    async fn forget_pending(&self, ids: &[u64]) {
        let mut pending = self.pending.lock().await;
        for id in ids {
            pending.remove(id);
        }
    }

    /// Drain the high-priority queue fully. A batch that fails to send goes
    /// back to the front of the queue in its original order.
    pub(crate) async fn drain_high_priority(&self) -> Result<usize> {
        let mut sent = 0;
        loop {
            let batch: Vec<DownlinkPayload> = {
                let mut queue = self.hp_queue.lock().await;
                queue.drain(..).collect()
            };
            if batch.is_empty() {
                return Ok(sent);
            }
            let n = batch.len();
            if let Err(e) = self.send_downlink_batch(batch.clone()).await {
                let mut queue = self.hp_queue.lock().await;
                for payload in batch.into_iter().rev() {
                    queue.push_front(payload);
                }
                return Err(e);
            }
            sent += n;
            self.stats
                .high_priority_sent
                .fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

/// One edge's live session: the shared core plus the backend variant the
/// deployment selected at startup.
pub struct EdgeSession {
    core: Arc<SessionCore>,
    store: Arc<dyn EventStore>,
}

impl EdgeSession {
    /// Construct a session bound to the globally selected backend.
    pub fn new(
        link: ServerLink,
        config: GatewayConfig,
        factory: &dyn EventStoreFactory,
    ) -> Arc<Self> {
        let core = Arc::new(SessionCore::new(link, config));
        let store = factory.create(Arc::clone(&core));
        Arc::new(Self { core, store })
    }

    /// The shared session state.
    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// The session token.
    pub fn session_id(&self) -> EdgeSessionId {
        self.core.session_id()
    }

    /// Whether the session is connected.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// The cached edge, set by a successful handshake.
    pub async fn edge(&self) -> Option<Edge> {
        self.core.edge().await
    }

    /// The backend this session delivers through.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Process a connect request: look the edge up by routing key, verify
    /// the shared secret, cache the edge and transition to connected. A
    /// rejection carries a typed code; the caller closes the connection.
    pub async fn process_connect(
        &self,
        request: &ConnectRequestMsg,
        edges: &dyn crate::provider::EdgeProvider,
    ) -> ConnectResponseMsg {
        match edges.find_by_routing_key(&request.routing_key).await {
            Ok(Some(edge)) => {
                if edge.secret != request.secret {
                    warn!(routing_key = %request.routing_key, "edge secret mismatch");
                    return ConnectResponseMsg::rejected(
                        ConnectResponseCode::BadCredentials,
                        "Failed to validate the edge: secret mismatch",
                    );
                }
                info!(edge_id = %edge.id, name = %edge.name, "edge connected");
                let configuration = edge.configuration();
                *self.core.edge.write().await = Some(edge);
                self.core.connected.store(true, Ordering::SeqCst);
                ConnectResponseMsg::accepted(configuration)
            }
            Ok(None) => {
                warn!(routing_key = %request.routing_key, "no edge for routing key");
                ConnectResponseMsg::rejected(
                    ConnectResponseCode::BadCredentials,
                    "Failed to validate the edge: routing key not found",
                )
            }
            Err(e) => {
                warn!(error = %e, "edge lookup failed during handshake");
                ConnectResponseMsg::rejected(
                    ConnectResponseCode::ServerUnavailable,
                    "Failed to process the connect request",
                )
            }
        }
    }

    /// One pass of the event-check loop. Returns whether the next pass
    /// should run sooner than the idle interval. Failures are caught and
    /// logged here; the loop itself never dies on them.
    pub async fn event_check_pass(&self) -> bool {
        let core = &self.core;
        if !core.is_connected() || core.syncing.load(Ordering::SeqCst) {
            return false;
        }
        // high-priority draining takes exclusive precedence within one pass
        if core.hp_draining.swap(true, Ordering::SeqCst) {
            return false;
        }
        let hp_result = core.drain_high_priority().await;
        core.hp_draining.store(false, Ordering::SeqCst);
        if let Err(e) = hp_result {
            warn!(session_id = %core.session_id, error = %e, "high priority drain failed");
            return true;
        }
        if !core.migrated.load(Ordering::SeqCst) {
            match self.store.migrate_edge_events().await {
                Ok(true) => {
                    debug!(session_id = %core.session_id, "legacy events remain, migration continues");
                }
                Ok(false) => {
                    core.migrated.store(true, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(session_id = %core.session_id, error = %e, "event migration failed");
                }
            }
            // the batch path is untouched on a migration pass
            return true;
        }
        match self.store.process_edge_events().await {
            Ok(more) => more,
            Err(e) => {
                warn!(session_id = %core.session_id, error = %e, "event processing failed");
                false
            }
        }
    }

    /// Run one sync. Succeeds only if no sync is already in progress on this
    /// session; the check is a non-blocking compare-and-set.
    pub async fn run_sync(
        &self,
        full_sync: bool,
        fetch: &dyn EntityFetchProvider,
    ) -> Result<()> {
        if self
            .core
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GatewayError::SyncInProgress);
        }
        let result = self.run_sync_inner(full_sync, fetch).await;
        self.core.syncing.store(false, Ordering::SeqCst);
        result
    }

    async fn run_sync_inner(
        &self,
        full_sync: bool,
        fetch: &dyn EntityFetchProvider,
    ) -> Result<()> {
        let edge = self.core.edge().await.ok_or(GatewayError::SessionClosed)?;
        info!(edge_id = %edge.id, full_sync, "starting sync");
        let mut cursor = SyncCursor::new(&edge, full_sync);
        while let Some(fetcher) = cursor.next() {
            let events = fetch.fetch(&edge, fetcher).await?;
            if !events.is_empty() {
                self.core.convert_and_send(&events).await?;
            }
        }
        self.core
            .send_downlink_batch(vec![DownlinkPayload::SyncComplete])
            .await?;
        info!(edge_id = %edge.id, "sync completed");
        Ok(())
    }

    /// Whether a sync is currently running.
    pub fn sync_in_progress(&self) -> bool {
        self.core.syncing.load(Ordering::SeqCst)
    }

    /// Whether one-time migration has been confirmed complete.
    pub fn migration_complete(&self) -> bool {
        self.core.migrated.load(Ordering::SeqCst)
    }

    /// Replace the cached edge after a platform-side update and push the new
    /// configuration to the client.
    pub async fn update_edge(&self, edge: Edge) -> Result<()> {
        let configuration = edge.configuration();
        *self.core.edge.write().await = Some(edge);
        self.core
            .push_high_priority(DownlinkPayload::EdgeConfig(configuration))
            .await
    }

    /// Tear the session down: mark disconnected, close the link, and release
    /// the backend resource. Returns whether the release fully succeeded;
    /// `false` puts the session on the registry's zombie list.
    pub async fn destroy(&self) -> bool {
        self.core.connected.store(false, Ordering::SeqCst);
        self.core.link.shutdown();
        let released = self.store.destroy().await;
        if !released {
            warn!(session_id = %self.core.session_id, "backend resource failed to release");
        }
        released
    }

    /// Backend-specific irreversible cleanup (deleting the edge's partition
    /// and consumer group). Invoked only on edge deletion, never on an
    /// ordinary disconnect.
    pub async fn clean_up(&self) {
        self.store.clean_up().await;
    }

    /// A session is a zombie when it is disconnected but its backend
    /// resource is still actively consuming.
    pub fn is_zombie(&self) -> bool {
        !self.is_connected() && self.store.consumer_active()
    }
}

/// The long-lived event-check loop for one session. Each iteration performs
/// one pass; a "more pending" outcome or a new-events signal shortens the
/// wait before the next one. Cancellation is immediate (the task is aborted
/// by the registry) and double-cancellation is harmless.
pub async fn run_event_loop(session: Arc<EdgeSession>) {
    let core = Arc::clone(session.core());
    debug!(session_id = %core.session_id(), "event-check loop started");
    loop {
        if !core.is_connected() {
            break;
        }
        let more = session.event_check_pass().await;
        if !core.is_connected() {
            break;
        }
        if more {
            tokio::time::sleep(Duration::from_millis(core.config.sleep_between_batches_ms)).await;
            continue;
        }
        if core.take_new_events() {
            continue;
        }
        let notified = core.event_notify.notified();
        if core.take_new_events() {
            continue;
        }
        let _ = tokio::time::timeout(
            Duration::from_millis(core.config.no_records_sleep_ms),
            notified,
        )
        .await;
    }
    debug!(session_id = %core.session_id(), "event-check loop stopped");
}
