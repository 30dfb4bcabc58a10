//! Polled-table event delivery.
//!
//! Events live in a relational table keyed by edge; the session's event-check
//! loop issues bounded page reads and the read position advances only after a
//! page has been acknowledged. An interrupted send retries the same page, so
//! delivery is at-least-once.

use crate::edge::EdgeId;
use crate::error::Result;
use crate::event::EdgeEvent;
use crate::session::SessionCore;
use crate::store::{EventStore, EventStoreFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct TableInner {
    rows: HashMap<EdgeId, Vec<EdgeEvent>>,
    next_seq: HashMap<EdgeId, u64>,
    committed: HashMap<EdgeId, u64>,
}

/// The per-edge event table. Positions are assigned on append; committing a
/// position trims the delivered rows.
#[derive(Debug, Default)]
pub struct EventTable {
    inner: Mutex<TableInner>,
}

impl EventTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row, assigning the edge's next position.
    pub async fn append(&self, mut event: EdgeEvent) -> u64 {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq.entry(event.edge_id).or_insert(0);
        *seq += 1;
        let assigned = *seq;
        event.seq = assigned;
        inner.rows.entry(event.edge_id).or_default().push(event);
        assigned
    }

    /// Bounded read of uncommitted rows, in position order.
    pub async fn read_page(&self, edge_id: EdgeId, limit: usize) -> Vec<EdgeEvent> {
        let inner = self.inner.lock().await;
        let committed = inner.committed.get(&edge_id).copied().unwrap_or(0);
        inner
            .rows
            .get(&edge_id)
            .map(|rows| {
                rows.iter()
                    .filter(|e| e.seq > committed)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Advance the read position and trim delivered rows. Never moves
    /// backwards.
    pub async fn commit(&self, edge_id: EdgeId, up_to_seq: u64) {
        let mut inner = self.inner.lock().await;
        let committed = inner.committed.entry(edge_id).or_insert(0);
        if up_to_seq <= *committed {
            return;
        }
        *committed = up_to_seq;
        if let Some(rows) = inner.rows.get_mut(&edge_id) {
            rows.retain(|e| e.seq > up_to_seq);
        }
    }

    /// The committed read position for an edge.
    pub async fn committed_seq(&self, edge_id: EdgeId) -> u64 {
        self.inner
            .lock()
            .await
            .committed
            .get(&edge_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of uncommitted rows for an edge.
    pub async fn pending_count(&self, edge_id: EdgeId) -> usize {
        let inner = self.inner.lock().await;
        let committed = inner.committed.get(&edge_id).copied().unwrap_or(0);
        inner
            .rows
            .get(&edge_id)
            .map(|rows| rows.iter().filter(|e| e.seq > committed).count())
            .unwrap_or(0)
    }

    /// Drop all rows and positions for an edge.
    pub async fn clear_edge(&self, edge_id: EdgeId) {
        let mut inner = self.inner.lock().await;
        inner.rows.remove(&edge_id);
        inner.next_seq.remove(&edge_id);
        inner.committed.remove(&edge_id);
    }
}

/// Polled-table backend bound to one session.
pub struct PolledEventStore {
    core: Arc<SessionCore>,
    table: Arc<EventTable>,
}

impl PolledEventStore {
    /// Bind the table to one session's shared state.
    pub fn new(core: Arc<SessionCore>, table: Arc<EventTable>) -> Self {
        Self { core, table }
    }
}

#[async_trait]
impl EventStore for PolledEventStore {
    async fn save(&self, event: EdgeEvent) -> Result<u64> {
        Ok(self.table.append(event).await)
    }

    async fn process_edge_events(&self) -> Result<bool> {
        let edge_id = match self.core.edge_id().await {
            Some(id) => id,
            None => return Ok(false),
        };
        let limit = self.core.config().events_batch_size;
        let page = self.table.read_page(edge_id, limit).await;
        if page.is_empty() {
            return Ok(false);
        }
        let last_seq = page.last().map(|e| e.seq).unwrap_or(0);
        self.core.convert_and_send(&page).await?;
        self.table.commit(edge_id, last_seq).await;
        debug!(%edge_id, up_to = last_seq, "committed polled event page");
        // a full page implies more rows may remain
        Ok(page.len() == limit)
    }

    async fn migrate_edge_events(&self) -> Result<bool> {
        // nothing to migrate: this variant IS the legacy store
        Ok(false)
    }

    async fn destroy(&self) -> bool {
        // the poll is driven by the session's own loop; nothing to release
        true
    }

    async fn clean_up(&self) {
        if let Some(edge_id) = self.core.edge_id().await {
            self.table.clear_edge(edge_id).await;
        }
    }

    fn consumer_active(&self) -> bool {
        false
    }
}

/// Builds polled-table backends for new sessions.
pub struct PolledStoreFactory {
    table: Arc<EventTable>,
}

impl PolledStoreFactory {
    /// Create a factory over the shared table.
    pub fn new(table: Arc<EventTable>) -> Self {
        Self { table }
    }
}

impl EventStoreFactory for PolledStoreFactory {
    fn create(&self, core: Arc<SessionCore>) -> Arc<dyn EventStore> {
        Arc::new(PolledEventStore::new(core, Arc::clone(&self.table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::TenantId;
    use crate::event::EdgeEventAction;
    use edgelink_proto::msg::EntityType;
    use proptest::prelude::*;

    fn event(edge_id: EdgeId) -> EdgeEvent {
        EdgeEvent::new(
            TenantId::random(),
            edge_id,
            EdgeEventAction::Added,
            EntityType::Device,
            Some(uuid::Uuid::new_v4()),
        )
    }

    #[tokio::test]
    async fn test_store_save_appends_to_shared_table() {
        use crate::config::GatewayConfig;
        use crate::session::SessionCore;
        use edgelink_proto::link::link_pair;

        let (server, _client) = link_pair(8);
        let core = Arc::new(SessionCore::new(server, GatewayConfig::default()));
        let table = Arc::new(EventTable::new());
        let store = PolledStoreFactory::new(Arc::clone(&table)).create(core);

        let edge_id = EdgeId::random();
        let seq = store.save(event(edge_id)).await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(table.pending_count(edge_id).await, 1);
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_positions() {
        let table = EventTable::new();
        let edge_id = EdgeId::random();
        assert_eq!(table.append(event(edge_id)).await, 1);
        assert_eq!(table.append(event(edge_id)).await, 2);
        assert_eq!(table.append(event(edge_id)).await, 3);
    }

    #[tokio::test]
    async fn test_positions_are_per_edge() {
        let table = EventTable::new();
        let a = EdgeId::random();
        let b = EdgeId::random();
        assert_eq!(table.append(event(a)).await, 1);
        assert_eq!(table.append(event(b)).await, 1);
        assert_eq!(table.append(event(a)).await, 2);
    }

    #[tokio::test]
    async fn test_read_page_is_idempotent_without_commit() {
        let table = EventTable::new();
        let edge_id = EdgeId::random();
        for _ in 0..5 {
            table.append(event(edge_id)).await;
        }
        let first = table.read_page(edge_id, 3).await;
        let second = table.read_page(edge_id, 3).await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(table.committed_seq(edge_id).await, 0);
    }

    #[tokio::test]
    async fn test_commit_advances_and_trims() {
        let table = EventTable::new();
        let edge_id = EdgeId::random();
        for _ in 0..5 {
            table.append(event(edge_id)).await;
        }
        table.commit(edge_id, 3).await;
        assert_eq!(table.committed_seq(edge_id).await, 3);
        assert_eq!(table.pending_count(edge_id).await, 2);

        let page = table.read_page(edge_id, 10).await;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].seq, 4);
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let table = EventTable::new();
        let edge_id = EdgeId::random();
        for _ in 0..3 {
            table.append(event(edge_id)).await;
        }
        table.commit(edge_id, 3).await;
        table.commit(edge_id, 1).await;
        assert_eq!(table.committed_seq(edge_id).await, 3);
    }

    #[tokio::test]
    async fn test_clear_edge_resets_positions() {
        let table = EventTable::new();
        let edge_id = EdgeId::random();
        table.append(event(edge_id)).await;
        table.commit(edge_id, 1).await;
        table.clear_edge(edge_id).await;

        assert_eq!(table.pending_count(edge_id).await, 0);
        assert_eq!(table.committed_seq(edge_id).await, 0);
        assert_eq!(table.append(event(edge_id)).await, 1);
    }

    proptest! {
        /// Paging with commits delivers every appended event exactly once,
        /// in position order, for any event count and page size.
        #[test]
        fn prop_paging_with_commits_delivers_everything_once(
            total in 0usize..60,
            page_size in 1usize..12,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let table = EventTable::new();
                let edge_id = EdgeId::random();
                for _ in 0..total {
                    table.append(event(edge_id)).await;
                }
                let mut delivered = Vec::new();
                loop {
                    let page = table.read_page(edge_id, page_size).await;
                    if page.is_empty() {
                        break;
                    }
                    let last = page.last().unwrap().seq;
                    delivered.extend(page.iter().map(|e| e.seq));
                    table.commit(edge_id, last).await;
                }
                let expected: Vec<u64> = (1..=total as u64).collect();
                prop_assert_eq!(delivered, expected);
                prop_assert_eq!(table.pending_count(edge_id).await, 0);
                Ok(())
            })?;
        }

        /// Without a commit, repeated reads return the same page: an
        /// unacknowledged batch never advances the position.
        #[test]
        fn prop_uncommitted_reads_are_stable(
            total in 1usize..40,
            page_size in 1usize..10,
            rereads in 1usize..5,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let table = EventTable::new();
                let edge_id = EdgeId::random();
                for _ in 0..total {
                    table.append(event(edge_id)).await;
                }
                let first = table.read_page(edge_id, page_size).await;
                for _ in 0..rereads {
                    let again = table.read_page(edge_id, page_size).await;
                    prop_assert_eq!(&again, &first);
                }
                prop_assert_eq!(table.committed_seq(edge_id).await, 0);
                Ok(())
            })?;
        }
    }
}
