//! Event delivery backends.
//!
//! Two interchangeable implementations of one capability contract: a polled
//! relational table and a push-style partitioned log with one logical
//! partition per edge. The variant is selected once at process start; a
//! session is constructed against either without knowing which.

pub mod polled;
pub mod streamed;

pub use polled::{EventTable, PolledEventStore, PolledStoreFactory};
pub use streamed::{PartitionLog, StreamedEventStore, StreamedStoreFactory};

use crate::config::EventStoreKind;
use crate::edge::EdgeId;
use crate::error::Result;
use crate::event::EdgeEvent;
use crate::session::SessionCore;
use async_trait::async_trait;
use std::sync::Arc;

/// The capability contract both backend variants implement.
///
/// `process_edge_events` returns whether the next event-check pass should run
/// sooner than the idle interval; the push-log variant always answers `false`
/// because its delivery is consumer-driven. `migrate_edge_events` returns
/// whether legacy events still remain to be drained.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event to the durable per-edge log.
    async fn save(&self, event: EdgeEvent) -> Result<u64>;

    /// Deliver pending events for this session's edge.
    async fn process_edge_events(&self) -> Result<bool>;

    /// Drain events left in the legacy store, one page per call.
    async fn migrate_edge_events(&self) -> Result<bool>;

    /// Release the backend resource (stop consuming / cancel the poll).
    /// Returns whether the release fully succeeded.
    async fn destroy(&self) -> bool;

    /// Irreversible backend cleanup (delete the edge's partition and
    /// consumer group). Only invoked on edge deletion.
    async fn clean_up(&self);

    /// Whether the backend resource is still actively consuming. Used by the
    /// registry's zombie predicate.
    fn consumer_active(&self) -> bool;
}

/// Builds the deployment's backend variant for a new session.
pub trait EventStoreFactory: Send + Sync {
    /// Bind a backend instance to one session's shared state.
    fn create(&self, core: Arc<SessionCore>) -> Arc<dyn EventStore>;
}

/// Platform-side entry point to the durable event log. Owns the global table
/// and partition log and appends to whichever the deployment selected.
pub struct EdgeEventService {
    kind: EventStoreKind,
    table: Arc<EventTable>,
    log: Arc<PartitionLog>,
}

impl EdgeEventService {
    /// Create the service with fresh backing stores.
    pub fn new(kind: EventStoreKind) -> Self {
        Self {
            kind,
            table: Arc::new(EventTable::new()),
            log: Arc::new(PartitionLog::new()),
        }
    }

    /// The selected backend kind.
    pub fn kind(&self) -> EventStoreKind {
        self.kind
    }

    /// The polled-table store (also the legacy store under the push-log
    /// deployment).
    pub fn table(&self) -> Arc<EventTable> {
        Arc::clone(&self.table)
    }

    /// The partitioned push log.
    pub fn log(&self) -> Arc<PartitionLog> {
        Arc::clone(&self.log)
    }

    /// Append one event produced by a platform-side mutation.
    pub async fn save(&self, event: EdgeEvent) -> Result<u64> {
        match self.kind {
            EventStoreKind::Polled => Ok(self.table.append(event).await),
            EventStoreKind::Streamed => Ok(self.log.publish(event)),
        }
    }

    /// Undelivered events for an edge, across whichever store holds them.
    pub async fn pending_count(&self, edge_id: EdgeId) -> usize {
        match self.kind {
            EventStoreKind::Polled => self.table.pending_count(edge_id).await,
            EventStoreKind::Streamed => {
                self.log.pending_count(edge_id) + self.table.pending_count(edge_id).await
            }
        }
    }

    /// Drop all durable state for an edge (rows, topic, consumer group).
    pub async fn purge_edge(&self, edge_id: EdgeId) {
        self.table.clear_edge(edge_id).await;
        self.log.delete_topic(edge_id);
    }

    /// The session factory matching the selected backend. The streamed
    /// factory carries the table as its legacy migration source.
    pub fn store_factory(&self) -> Arc<dyn EventStoreFactory> {
        match self.kind {
            EventStoreKind::Polled => Arc::new(PolledStoreFactory::new(self.table())),
            EventStoreKind::Streamed => {
                Arc::new(StreamedStoreFactory::new(self.log(), self.table()))
            }
        }
    }
}
