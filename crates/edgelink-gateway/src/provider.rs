//! Collaborator seams consumed by the gateway core.
//!
//! The platform services behind these traits (entity persistence, telemetry
//! save, the rule engine) are external to this core; only their consumed
//! interfaces appear here. In-memory implementations ship alongside for
//! embedding and tests.

use crate::config::ActivityPersistence;
use crate::edge::{Edge, EdgeId, TenantId};
use crate::error::Result;
use crate::event::EdgeEvent;
use crate::sync::SyncFetcher;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Looks an edge up by its routing key at handshake time.
#[async_trait]
pub trait EdgeProvider: Send + Sync {
    /// Find the edge registered under `routing_key`, if any.
    async fn find_by_routing_key(&self, routing_key: &str) -> Result<Option<Edge>>;
}

/// Persists edge connectivity state (as an attribute or time-series, per
/// deployment configuration).
#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    /// Record a connectivity transition at `ts_ms`.
    async fn record_connectivity(&self, tenant_id: TenantId, edge_id: EdgeId, connected: bool, ts_ms: u64);
}

/// Connectivity trigger events emitted towards the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityTrigger {
    /// An edge session connected.
    Connected,
    /// An edge session disconnected.
    Disconnected,
    /// An uplink batch failed as one unit.
    CommunicationFailure,
}

/// Emits connectivity trigger events into the rule engine.
#[async_trait]
pub trait RuleEngineNotifier: Send + Sync {
    /// Emit one trigger for the edge, with an optional serialized body.
    async fn emit(
        &self,
        tenant_id: TenantId,
        edge_id: EdgeId,
        trigger: ConnectivityTrigger,
        body: Option<serde_json::Value>,
    );
}

/// Enumerates platform entities for the sync cursor's fetchers.
#[async_trait]
pub trait EntityFetchProvider: Send + Sync {
    /// Produce the events one fetcher contributes to a sync run.
    async fn fetch(&self, edge: &Edge, fetcher: SyncFetcher) -> Result<Vec<EdgeEvent>>;
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory edge directory keyed by routing key.
#[derive(Debug, Default)]
pub struct InMemoryEdgeDirectory {
    edges: DashMap<String, Edge>,
}

impl InMemoryEdgeDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an edge.
    pub fn insert(&self, edge: Edge) {
        self.edges.insert(edge.routing_key.clone(), edge);
    }

    /// Remove an edge by routing key.
    pub fn remove(&self, routing_key: &str) {
        self.edges.remove(routing_key);
    }
}

#[async_trait]
impl EdgeProvider for InMemoryEdgeDirectory {
    async fn find_by_routing_key(&self, routing_key: &str) -> Result<Option<Edge>> {
        Ok(self.edges.get(routing_key).map(|e| e.clone()))
    }
}

/// One persisted connectivity transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    /// The edge the record belongs to.
    pub edge_id: EdgeId,
    /// Connected or disconnected.
    pub connected: bool,
    /// Transition timestamp, milliseconds since epoch.
    pub ts_ms: u64,
    /// How the record was persisted.
    pub persistence: ActivityPersistence,
}

/// Recording activity store used for embedding and tests.
#[derive(Debug)]
pub struct RecordingActivityLog {
    persistence: ActivityPersistence,
    records: Mutex<Vec<ActivityRecord>>,
}

impl RecordingActivityLog {
    /// Create a log persisting in the given mode.
    pub fn new(persistence: ActivityPersistence) -> Self {
        Self {
            persistence,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of all recorded transitions.
    pub async fn records(&self) -> Vec<ActivityRecord> {
        self.records.lock().await.clone()
    }

    /// The most recent transition for an edge.
    pub async fn last_for(&self, edge_id: EdgeId) -> Option<ActivityRecord> {
        self.records
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.edge_id == edge_id)
            .cloned()
    }
}

#[async_trait]
impl ActivityRecorder for RecordingActivityLog {
    async fn record_connectivity(&self, _tenant_id: TenantId, edge_id: EdgeId, connected: bool, ts_ms: u64) {
        self.records.lock().await.push(ActivityRecord {
            edge_id,
            connected,
            ts_ms,
            persistence: self.persistence,
        });
    }
}

/// Recording rule-engine notifier used for embedding and tests.
#[derive(Debug, Default)]
pub struct RecordingRuleNotifier {
    events: Mutex<Vec<(EdgeId, ConnectivityTrigger)>>,
}

impl RecordingRuleNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all emitted triggers.
    pub async fn events(&self) -> Vec<(EdgeId, ConnectivityTrigger)> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl RuleEngineNotifier for RecordingRuleNotifier {
    async fn emit(
        &self,
        _tenant_id: TenantId,
        edge_id: EdgeId,
        trigger: ConnectivityTrigger,
        _body: Option<serde_json::Value>,
    ) {
        self.events.lock().await.push((edge_id, trigger));
    }
}

/// Static fetch provider serving pre-seeded entity sets per fetcher.
#[derive(Debug, Default)]
pub struct StaticEntityFetcher {
    entries: Mutex<HashMap<SyncFetcher, Vec<EdgeEvent>>>,
}

impl StaticEntityFetcher {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the events one fetcher returns.
    pub async fn seed(&self, fetcher: SyncFetcher, events: Vec<EdgeEvent>) {
        self.entries.lock().await.insert(fetcher, events);
    }
}

#[async_trait]
impl EntityFetchProvider for StaticEntityFetcher {
    async fn fetch(&self, _edge: &Edge, fetcher: SyncFetcher) -> Result<Vec<EdgeEvent>> {
        Ok(self
            .entries
            .lock()
            .await
            .get(&fetcher)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{CustomerId, EdgeVersion};
    use crate::event::EdgeEventAction;
    use edgelink_proto::msg::EntityType;

    fn edge() -> Edge {
        Edge {
            tenant_id: TenantId::random(),
            id: EdgeId::random(),
            customer_id: Some(CustomerId::random()),
            routing_key: "rk-1".to_string(),
            secret: "s".to_string(),
            version: EdgeVersion::V3,
            name: "e".to_string(),
            edge_type: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let dir = InMemoryEdgeDirectory::new();
        let e = edge();
        dir.insert(e.clone());

        let found = dir.find_by_routing_key("rk-1").await.unwrap();
        assert_eq!(found, Some(e));

        let missing = dir.find_by_routing_key("rk-2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_directory_remove() {
        let dir = InMemoryEdgeDirectory::new();
        dir.insert(edge());
        dir.remove("rk-1");
        assert!(dir.find_by_routing_key("rk-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activity_log_records_transitions() {
        let log = RecordingActivityLog::new(ActivityPersistence::Attribute);
        let e = edge();
        log.record_connectivity(e.tenant_id, e.id, true, 100).await;
        log.record_connectivity(e.tenant_id, e.id, false, 200).await;

        let records = log.records().await;
        assert_eq!(records.len(), 2);
        assert!(records[0].connected);
        assert!(!records[1].connected);
        assert_eq!(records[1].persistence, ActivityPersistence::Attribute);

        let last = log.last_for(e.id).await.unwrap();
        assert_eq!(last.ts_ms, 200);
    }

    #[tokio::test]
    async fn test_rule_notifier_records_triggers() {
        let notifier = RecordingRuleNotifier::new();
        let e = edge();
        notifier
            .emit(e.tenant_id, e.id, ConnectivityTrigger::Connected, None)
            .await;
        let events = notifier.events().await;
        assert_eq!(events, vec![(e.id, ConnectivityTrigger::Connected)]);
    }

    #[tokio::test]
    async fn test_static_fetcher_serves_seeded_events() {
        let fetch = StaticEntityFetcher::new();
        let e = edge();
        let ev = EdgeEvent::new(
            e.tenant_id,
            e.id,
            EdgeEventAction::Added,
            EntityType::Device,
            Some(uuid::Uuid::new_v4()),
        );
        fetch.seed(SyncFetcher::Devices, vec![ev.clone()]).await;

        let got = fetch.fetch(&e, SyncFetcher::Devices).await.unwrap();
        assert_eq!(got, vec![ev]);

        let empty = fetch.fetch(&e, SyncFetcher::Assets).await.unwrap();
        assert!(empty.is_empty());
    }
}
