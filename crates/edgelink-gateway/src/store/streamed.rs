//! Push-log event delivery.
//!
//! Each edge owns one logical partition; publishing appends to it and wakes
//! a per-session consumer task, so delivery is event-driven rather than a
//! synchronous page fetch. Offsets commit only after a batch has been
//! acknowledged. On the first connect after a deployment switches to this
//! backend, events left in the legacy polled table are drained through the
//! polled processing path once per tick until it reports empty.

use crate::edge::EdgeId;
use crate::error::Result;
use crate::event::EdgeEvent;
use crate::session::SessionCore;
use crate::store::polled::EventTable;
use crate::store::{EventStore, EventStoreFactory};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug)]
struct Topic {
    entries: Vec<EdgeEvent>,
    next_seq: u64,
    committed: u64,
    notify: Arc<Notify>,
}

impl Default for Topic {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            committed: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// The partitioned push log: one logical topic per edge.
#[derive(Debug, Default)]
pub struct PartitionLog {
    topics: DashMap<EdgeId, Topic>,
}

impl PartitionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one event to the edge's partition, waking its consumer.
    pub fn publish(&self, mut event: EdgeEvent) -> u64 {
        let mut topic = self.topics.entry(event.edge_id).or_default();
        topic.next_seq += 1;
        let seq = topic.next_seq;
        event.seq = seq;
        topic.entries.push(event);
        topic.notify.notify_one();
        seq
    }

    /// Uncommitted entries in offset order, bounded by `limit`.
    pub fn read_uncommitted(&self, edge_id: EdgeId, limit: usize) -> Vec<EdgeEvent> {
        self.topics
            .get(&edge_id)
            .map(|topic| {
                topic
                    .entries
                    .iter()
                    .filter(|e| e.seq > topic.committed)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Commit the consumer offset and drop delivered entries. Never moves
    /// backwards.
    pub fn commit(&self, edge_id: EdgeId, up_to_seq: u64) {
        if let Some(mut topic) = self.topics.get_mut(&edge_id) {
            if up_to_seq <= topic.committed {
                return;
            }
            topic.committed = up_to_seq;
            topic.entries.retain(|e| e.seq > up_to_seq);
        }
    }

    /// The committed consumer offset for an edge.
    pub fn committed_seq(&self, edge_id: EdgeId) -> u64 {
        self.topics.get(&edge_id).map(|t| t.committed).unwrap_or(0)
    }

    /// Number of uncommitted entries for an edge.
    pub fn pending_count(&self, edge_id: EdgeId) -> usize {
        self.topics
            .get(&edge_id)
            .map(|topic| {
                topic
                    .entries
                    .iter()
                    .filter(|e| e.seq > topic.committed)
                    .count()
            })
            .unwrap_or(0)
    }

    /// The wakeup handle a consumer subscribes to; creates the topic lazily.
    pub fn notify_handle(&self, edge_id: EdgeId) -> Arc<Notify> {
        Arc::clone(&self.topics.entry(edge_id).or_default().notify)
    }

    /// Whether the edge's topic exists.
    pub fn has_topic(&self, edge_id: EdgeId) -> bool {
        self.topics.contains_key(&edge_id)
    }

    /// Delete the edge's topic and consumer group. Returns whether a topic
    /// existed.
    pub fn delete_topic(&self, edge_id: EdgeId) -> bool {
        self.topics.remove(&edge_id).is_some()
    }
}

struct StreamConsumer {
    active: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Push-log backend bound to one session. The consumer task is created
/// lazily on first use and re-created if it has stopped.
pub struct StreamedEventStore {
    core: Arc<SessionCore>,
    log: Arc<PartitionLog>,
    legacy: Arc<EventTable>,
    consumer: std::sync::Mutex<Option<StreamConsumer>>,
}

impl StreamedEventStore {
    /// Bind the log (and the legacy table for migration) to one session.
    pub fn new(core: Arc<SessionCore>, log: Arc<PartitionLog>, legacy: Arc<EventTable>) -> Self {
        Self {
            core,
            log,
            legacy,
            consumer: std::sync::Mutex::new(None),
        }
    }

    fn spawn_consumer(&self, edge_id: EdgeId) -> StreamConsumer {
        let active = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(consumer_loop(
            Arc::clone(&self.core),
            Arc::clone(&self.log),
            edge_id,
            Arc::clone(&active),
        ));
        debug!(%edge_id, "created partition consumer");
        StreamConsumer { active, handle }
    }

    fn stop_consumer(&self) {
        if let Ok(mut guard) = self.consumer.lock() {
            if let Some(consumer) = guard.take() {
                consumer.active.store(false, Ordering::SeqCst);
                consumer.handle.abort();
            }
        }
    }
}

async fn consumer_loop(
    core: Arc<SessionCore>,
    log: Arc<PartitionLog>,
    edge_id: EdgeId,
    active: Arc<AtomicBool>,
) {
    let notify = log.notify_handle(edge_id);
    let batch_size = core.config().events_batch_size;
    let idle = Duration::from_millis(core.config().no_records_sleep_ms);
    let retry = Duration::from_millis(core.config().sleep_between_batches_ms);
    while active.load(Ordering::SeqCst) {
        let notified = notify.notified();
        let page = log.read_uncommitted(edge_id, batch_size);
        if page.is_empty() {
            let _ = tokio::time::timeout(idle, notified).await;
            continue;
        }
        let last_seq = page.last().map(|e| e.seq).unwrap_or(0);
        match core.convert_and_send(&page).await {
            Ok(_) => {
                log.commit(edge_id, last_seq);
                debug!(%edge_id, up_to = last_seq, "committed partition offset");
            }
            Err(e) => {
                // nothing committed, the same page is retried
                debug!(%edge_id, error = %e, "partition batch not delivered, retrying");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

#[async_trait]
impl EventStore for StreamedEventStore {
    async fn save(&self, event: EdgeEvent) -> Result<u64> {
        Ok(self.log.publish(event))
    }

    async fn process_edge_events(&self) -> Result<bool> {
        let edge_id = match self.core.edge_id().await {
            Some(id) => id,
            None => return Ok(false),
        };
        let needs_consumer = self
            .consumer
            .lock()
            .map(|guard| match guard.as_ref() {
                None => true,
                Some(c) => !c.active.load(Ordering::SeqCst) || c.handle.is_finished(),
            })
            .unwrap_or(false);
        if needs_consumer {
            let consumer = self.spawn_consumer(edge_id);
            if let Ok(mut guard) = self.consumer.lock() {
                *guard = Some(consumer);
            }
        }
        // delivery is consumer-driven; there is no synchronous signal
        Ok(false)
    }

    async fn migrate_edge_events(&self) -> Result<bool> {
        let edge_id = match self.core.edge_id().await {
            Some(id) => id,
            None => return Ok(false),
        };
        let limit = self.core.config().events_batch_size;
        let page = self.legacy.read_page(edge_id, limit).await;
        if page.is_empty() {
            return Ok(false);
        }
        let last_seq = page.last().map(|e| e.seq).unwrap_or(0);
        self.core.convert_and_send(&page).await?;
        self.legacy.commit(edge_id, last_seq).await;
        let remaining = self.legacy.pending_count(edge_id).await;
        debug!(%edge_id, migrated = page.len(), remaining, "drained legacy event page");
        Ok(remaining > 0)
    }

    async fn destroy(&self) -> bool {
        self.stop_consumer();
        true
    }

    async fn clean_up(&self) {
        self.stop_consumer();
        if let Some(edge_id) = self.core.edge_id().await {
            if self.log.delete_topic(edge_id) {
                debug!(%edge_id, "deleted edge partition");
            }
            self.legacy.clear_edge(edge_id).await;
        }
    }

    fn consumer_active(&self) -> bool {
        self.consumer
            .lock()
            .map(|guard| {
                guard
                    .as_ref()
                    .map(|c| c.active.load(Ordering::SeqCst) && !c.handle.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

/// Builds push-log backends for new sessions.
pub struct StreamedStoreFactory {
    log: Arc<PartitionLog>,
    legacy: Arc<EventTable>,
}

impl StreamedStoreFactory {
    /// Create a factory over the shared log and the legacy table.
    pub fn new(log: Arc<PartitionLog>, legacy: Arc<EventTable>) -> Self {
        Self { log, legacy }
    }
}

impl EventStoreFactory for StreamedStoreFactory {
    fn create(&self, core: Arc<SessionCore>) -> Arc<dyn EventStore> {
        Arc::new(StreamedEventStore::new(
            core,
            Arc::clone(&self.log),
            Arc::clone(&self.legacy),
        ))
    }
}
