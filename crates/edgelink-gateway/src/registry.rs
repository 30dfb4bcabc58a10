//! The connection registry: the single point of truth for "is edge X
//! connected, and through which session".
//!
//! Owns the edge→session and session-id→session indexes (the only
//! platform-wide shared mutable state in this core), arbitrates
//! at-most-one-session-per-edge, schedules and cancels each session's
//! event-check loop, forwards control-plane requests to the right session,
//! and periodically retries destruction of zombie sessions.

use crate::config::GatewayConfig;
use crate::edge::{Edge, EdgeId, EdgeSessionId, TenantId};
use crate::error::Result;
use crate::event::EdgeEvent;
use crate::provider::{
    current_time_ms, ActivityRecorder, ConnectivityTrigger, EntityFetchProvider,
    RuleEngineNotifier,
};
use crate::session::{run_event_loop, EdgeSession};
use crate::store::EdgeEventService;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edgelink_proto::msg::DownlinkPayload;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A cross-service request to sync one edge.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Correlation id.
    pub request_id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Target edge.
    pub edge_id: EdgeId,
    /// Identity of the requesting service.
    pub service_id: String,
    /// Full or partial sync.
    pub full_sync: bool,
}

/// Outcome of a sync request, delivered to the original requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    /// Correlation id of the request.
    pub request_id: Uuid,
    /// Whether the sync ran.
    pub success: bool,
    /// Failure reason when it did not.
    pub error_msg: String,
}

impl SyncResponse {
    fn positive(request_id: Uuid) -> Self {
        Self {
            request_id,
            success: true,
            error_msg: String::new(),
        }
    }

    fn negative(request_id: Uuid, error_msg: &str) -> Self {
        Self {
            request_id,
            success: false,
            error_msg: error_msg.to_string(),
        }
    }
}

struct PendingSyncRequest {
    request: SyncRequest,
    responder: oneshot::Sender<SyncResponse>,
}

/// The connection registry.
pub struct SessionRegistry {
    config: GatewayConfig,
    by_edge: DashMap<EdgeId, Arc<EdgeSession>>,
    by_session: DashMap<EdgeSessionId, Arc<EdgeSession>>,
    loops: DashMap<EdgeId, JoinHandle<()>>,
    zombies: Mutex<Vec<Arc<EdgeSession>>>,
    pending_syncs: DashMap<Uuid, PendingSyncRequest>,
    events: Arc<EdgeEventService>,
    activity: Arc<dyn ActivityRecorder>,
    rule_engine: Arc<dyn RuleEngineNotifier>,
    fetch: Arc<dyn EntityFetchProvider>,
}

impl SessionRegistry {
    /// Create a registry over the platform collaborators.
    pub fn new(
        config: GatewayConfig,
        events: Arc<EdgeEventService>,
        activity: Arc<dyn ActivityRecorder>,
        rule_engine: Arc<dyn RuleEngineNotifier>,
        fetch: Arc<dyn EntityFetchProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            by_edge: DashMap::new(),
            by_session: DashMap::new(),
            loops: DashMap::new(),
            zombies: Mutex::new(Vec::new()),
            pending_syncs: DashMap::new(),
            events,
            activity,
            rule_engine,
            fetch,
        })
    }

    /// The durable event service this deployment writes to.
    pub fn events(&self) -> &Arc<EdgeEventService> {
        &self.events
    }

    /// Register a freshly connected session. Any prior session for the same
    /// edge is synchronously destroyed first; a failed destroy is logged and
    /// tracked as a zombie, never a reason to refuse the new session.
    pub async fn on_connect(self: &Arc<Self>, session: Arc<EdgeSession>) {
        let Some(edge) = session.edge().await else {
            warn!("onConnect called for a session without a completed handshake");
            return;
        };
        let edge_id = edge.id;
        if let Some((_, old)) = self.by_edge.remove(&edge_id) {
            if old.session_id() != session.session_id() {
                info!(%edge_id, replaced = %old.session_id(), "replacing existing session for edge");
                self.by_session.remove(&old.session_id());
                if !old.destroy().await {
                    warn!(%edge_id, "replaced session failed to release, tracking as zombie");
                    self.zombies.lock().await.push(old);
                }
            }
        }
        self.by_session
            .insert(session.session_id(), Arc::clone(&session));
        self.by_edge.insert(edge_id, Arc::clone(&session));
        session.core().signal_new_events();
        self.activity
            .record_connectivity(edge.tenant_id, edge_id, true, current_time_ms())
            .await;
        self.rule_engine
            .emit(edge.tenant_id, edge_id, ConnectivityTrigger::Connected, None)
            .await;
        self.schedule_event_check(edge_id, session);
    }

    /// Unregister a disconnected session. Only acts on the edge's current
    /// session if the session id still matches; a stale disconnect racing a
    /// newer connection destroys the stale session by id alone and leaves
    /// the live session untouched.
    pub async fn on_disconnect(&self, edge_id: EdgeId, session_id: EdgeSessionId) {
        let current = self.by_edge.get(&edge_id).map(|s| Arc::clone(&s));
        match current {
            Some(current) if current.session_id() == session_id => {
                self.by_edge.remove(&edge_id);
                self.by_session.remove(&session_id);
                self.cancel_event_check(edge_id);
                if !current.destroy().await {
                    warn!(%edge_id, "session failed to release on disconnect, tracking as zombie");
                    self.zombies.lock().await.push(Arc::clone(&current));
                }
                if let Some(edge) = current.edge().await {
                    self.activity
                        .record_connectivity(edge.tenant_id, edge_id, false, current_time_ms())
                        .await;
                    self.rule_engine
                        .emit(
                            edge.tenant_id,
                            edge_id,
                            ConnectivityTrigger::Disconnected,
                            None,
                        )
                        .await;
                }
                info!(%edge_id, %session_id, "edge disconnected");
            }
            _ => {
                if let Some((_, stale)) = self.by_session.remove(&session_id) {
                    debug!(%edge_id, %session_id, "destroying stale session after racing disconnect");
                    if !stale.destroy().await {
                        self.zombies.lock().await.push(stale);
                    }
                }
            }
        }
    }

    /// Start (or restart) the edge's event-check loop. The per-edge entry
    /// lock serializes cancel and reschedule, so a loop is never scheduled
    /// twice concurrently.
    pub fn schedule_event_check(&self, edge_id: EdgeId, session: Arc<EdgeSession>) {
        match self.loops.entry(edge_id) {
            Entry::Occupied(mut occupied) => {
                occupied.get().abort();
                occupied.insert(tokio::spawn(run_event_loop(session)));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tokio::spawn(run_event_loop(session)));
            }
        }
    }

    /// Cancel the edge's event-check loop. Idempotent.
    pub fn cancel_event_check(&self, edge_id: EdgeId) {
        if let Some((_, handle)) = self.loops.remove(&edge_id) {
            handle.abort();
        }
    }

    /// Forward a platform-side edge update to the connected session, if any.
    pub async fn update_edge_config(&self, edge: Edge) -> Result<()> {
        let session = self
            .by_edge
            .get(&edge.id)
            .filter(|s| s.is_connected())
            .map(|s| Arc::clone(&s));
        if let Some(session) = session {
            session.update_edge(edge).await?;
        }
        Ok(())
    }

    /// Handle edge deletion: destroy and fully unregister the session, run
    /// irreversible backend cleanup, and purge the edge's durable state.
    pub async fn delete_edge(&self, edge_id: EdgeId) {
        self.cancel_event_check(edge_id);
        if let Some((_, session)) = self.by_edge.remove(&edge_id) {
            self.by_session.remove(&session.session_id());
            if !session.destroy().await {
                warn!(%edge_id, "deleted session failed to release, tracking as zombie");
                self.zombies.lock().await.push(Arc::clone(&session));
            }
            session.clean_up().await;
        }
        self.events.purge_edge(edge_id).await;
        info!(%edge_id, "edge deleted");
    }

    /// Push an urgent downlink to the edge's session; a no-op when the edge
    /// is not connected.
    pub async fn route_high_priority(&self, edge_id: EdgeId, payload: DownlinkPayload) -> Result<()> {
        let session = self
            .by_edge
            .get(&edge_id)
            .filter(|s| s.is_connected())
            .map(|s| Arc::clone(&s));
        match session {
            Some(session) => session.core().push_high_priority(payload).await,
            None => Ok(()),
        }
    }

    /// Wake the edge's event-check loop after new events were produced
    /// elsewhere in the platform; a no-op when the edge is not connected.
    pub fn route_event_notification(&self, edge_id: EdgeId) {
        if let Some(session) = self.by_edge.get(&edge_id) {
            if session.is_connected() {
                session.core().signal_new_events();
            }
        }
    }

    /// Append one platform-produced event and wake the target session.
    pub async fn save_edge_event(&self, event: EdgeEvent) -> Result<u64> {
        let edge_id = event.edge_id;
        let seq = self.events.save(event).await?;
        self.route_event_notification(edge_id);
        Ok(seq)
    }

    /// Request a sync of one edge on behalf of another platform service.
    ///
    /// When the edge is not connected the negative response is immediate.
    /// Otherwise the request is held in the pending map until the session
    /// responds or the timeout elapses; whichever happens first removes the
    /// entry and answers the requester, exactly once.
    pub fn request_sync(self: &Arc<Self>, request: SyncRequest) -> oneshot::Receiver<SyncResponse> {
        let (tx, rx) = oneshot::channel();
        let session = self
            .by_edge
            .get(&request.edge_id)
            .filter(|s| s.is_connected())
            .map(|s| Arc::clone(&s));
        let Some(session) = session else {
            debug!(edge_id = %request.edge_id, "sync requested for disconnected edge");
            let _ = tx.send(SyncResponse::negative(
                request.request_id,
                "Edge is not connected",
            ));
            return rx;
        };

        let request_id = request.request_id;
        let full_sync = request.full_sync;
        self.pending_syncs.insert(
            request_id,
            PendingSyncRequest {
                request,
                responder: tx,
            },
        );

        let registry = Arc::clone(self);
        let timeout = Duration::from_millis(self.config.sync_request_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, pending)) = registry.pending_syncs.remove(&request_id) {
                debug!(
                    %request_id,
                    edge_id = %pending.request.edge_id,
                    "sync request timed out"
                );
                let _ = pending
                    .responder
                    .send(SyncResponse::negative(request_id, "Edge is not connected"));
            }
        });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let result = session
                .run_sync(full_sync, registry.fetch.as_ref())
                .await;
            let response = match result {
                Ok(()) => SyncResponse::positive(request_id),
                Err(e) => SyncResponse::negative(request_id, &e.to_string()),
            };
            registry.handle_sync_response(response);
        });
        rx
    }

    /// Deliver a sync outcome to its requester. The pending entry is removed
    /// exactly once; a response arriving after the timeout already answered
    /// is dropped.
    pub fn handle_sync_response(&self, response: SyncResponse) {
        if let Some((_, pending)) = self.pending_syncs.remove(&response.request_id) {
            let _ = pending.responder.send(response);
        }
    }

    /// Emit a communication-failure trigger after an uplink batch failed.
    pub async fn notify_comm_failure(&self, tenant_id: TenantId, edge_id: EdgeId, error_msg: &str) {
        self.rule_engine
            .emit(
                tenant_id,
                edge_id,
                ConnectivityTrigger::CommunicationFailure,
                Some(serde_json::json!({ "error": error_msg })),
            )
            .await;
    }

    /// One zombie cleanup cycle: adopt disconnected sessions whose backend
    /// resource is still consuming, re-attempt destruction for every tracked
    /// zombie, and keep the ones that still fail for the next cycle. Returns
    /// how many sessions were destroyed.
    pub async fn cleanup_zombies(&self) -> usize {
        let mut zombies = self.zombies.lock().await;
        for entry in self.by_edge.iter() {
            let session = entry.value();
            if session.is_zombie()
                && !zombies
                    .iter()
                    .any(|z| z.session_id() == session.session_id())
            {
                zombies.push(Arc::clone(session));
            }
        }
        for entry in self.by_session.iter() {
            let session = entry.value();
            if session.is_zombie()
                && !zombies
                    .iter()
                    .any(|z| z.session_id() == session.session_id())
            {
                zombies.push(Arc::clone(session));
            }
        }

        let candidates: Vec<Arc<EdgeSession>> = zombies.drain(..).collect();
        let mut destroyed = 0;
        for session in candidates {
            if session.destroy().await {
                destroyed += 1;
            } else {
                warn!(session_id = %session.session_id(), "zombie session still failing to release");
                zombies.push(session);
            }
        }
        destroyed
    }

    /// Spawn the periodic zombie cleanup task.
    pub fn spawn_zombie_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_millis(registry.config.zombie_cleanup_interval_ms);
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                let destroyed = registry.cleanup_zombies().await;
                if destroyed > 0 {
                    info!(destroyed, "zombie cleanup destroyed sessions");
                }
            }
        })
    }

    /// The connected session for an edge, if any.
    pub fn session_for_edge(&self, edge_id: EdgeId) -> Option<Arc<EdgeSession>> {
        self.by_edge.get(&edge_id).map(|s| Arc::clone(&s))
    }

    /// Whether the edge currently has a connected session.
    pub fn is_connected(&self, edge_id: EdgeId) -> bool {
        self.by_edge
            .get(&edge_id)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Number of connected sessions.
    pub fn connected_count(&self) -> usize {
        self.by_edge.iter().filter(|e| e.value().is_connected()).count()
    }

    /// Number of sessions on the zombie retry list.
    pub async fn zombie_count(&self) -> usize {
        self.zombies.lock().await.len()
    }

    /// Number of pending sync requests.
    pub fn pending_sync_count(&self) -> usize {
        self.pending_syncs.len()
    }
}
