//! Gateway configuration.

use serde::{Deserialize, Serialize};

/// How connectivity state is persisted for an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPersistence {
    /// Store the connected flag as an entity attribute.
    Attribute,
    /// Store connectivity transitions as time-series points.
    TimeSeries,
}

/// Which event delivery backend the deployment runs on. Selected once at
/// process start, never per edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStoreKind {
    /// Polled relational table.
    Polled,
    /// Push-style partitioned log, one logical partition per edge.
    Streamed,
}

/// Configuration for the gateway core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum records read per poll batch.
    pub events_batch_size: usize,
    /// Sleep interval when no records are found, in milliseconds.
    pub no_records_sleep_ms: u64,
    /// Sleep interval between successive batches, in milliseconds.
    pub sleep_between_batches_ms: u64,
    /// Worker pool size for event-check scheduling.
    pub scheduler_pool_size: usize,
    /// Worker pool size for sends.
    pub send_scheduler_pool_size: usize,
    /// Per-session high-priority queue capacity.
    pub max_high_priority_queue_size: usize,
    /// How long to wait for a batch acknowledgement before retrying, in
    /// milliseconds. An unacknowledged batch is never committed.
    pub send_ack_timeout_ms: u64,
    /// How connectivity state is persisted.
    pub activity_persistence: ActivityPersistence,
    /// Timeout for cross-service sync requests, in milliseconds.
    pub sync_request_timeout_ms: u64,
    /// Period of the zombie-session cleanup cycle, in milliseconds.
    pub zombie_cleanup_interval_ms: u64,
    /// Event delivery backend for this deployment.
    pub backend: EventStoreKind,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            events_batch_size: 50,
            no_records_sleep_ms: 60_000,
            sleep_between_batches_ms: 1_000,
            scheduler_pool_size: 4,
            send_scheduler_pool_size: 4,
            max_high_priority_queue_size: 10_000,
            send_ack_timeout_ms: 10_000,
            activity_persistence: ActivityPersistence::Attribute,
            sync_request_timeout_ms: 20_000,
            zombie_cleanup_interval_ms: 60_000,
            backend: EventStoreKind::Polled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.events_batch_size, 50);
        assert_eq!(config.max_high_priority_queue_size, 10_000);
        assert_eq!(config.sync_request_timeout_ms, 20_000);
        assert_eq!(config.zombie_cleanup_interval_ms, 60_000);
        assert_eq!(config.backend, EventStoreKind::Polled);
        assert_eq!(config.activity_persistence, ActivityPersistence::Attribute);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = GatewayConfig {
            backend: EventStoreKind::Streamed,
            activity_persistence: ActivityPersistence::TimeSeries,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.backend, EventStoreKind::Streamed);
        assert_eq!(back.activity_persistence, ActivityPersistence::TimeSeries);
    }
}
