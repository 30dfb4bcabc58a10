//! The durable edge event record.
//!
//! Edge events are produced by platform-side mutations, appended to the
//! per-edge event log, and consumed exactly once by the delivery path, which
//! translates them into downlink messages.

use crate::edge::{EdgeId, TenantId};
use edgelink_proto::msg::EntityType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to the target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeEventAction {
    /// Entity created.
    Added,
    /// Entity updated.
    Updated,
    /// Entity deleted.
    Deleted,
    /// Entity assigned to the edge.
    Assigned,
    /// Entity unassigned from the edge.
    Unassigned,
    /// Entity credentials rotated.
    CredentialsUpdated,
    /// Attribute values written.
    AttributesUpdated,
    /// Attribute keys deleted.
    AttributesDeleted,
    /// Time-series values written.
    TimeseriesUpdated,
    /// Relation added or updated.
    RelationAddOrUpdate,
    /// Relation removed.
    RelationDeleted,
    /// RPC call issued towards a device behind the edge.
    RpcCall,
    /// Alarm acknowledged.
    AlarmAck,
    /// Alarm cleared.
    AlarmClear,
}

/// One durable per-edge event. `seq` is assigned by the event log on append
/// and is strictly increasing within an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvent {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Target edge.
    pub edge_id: EdgeId,
    /// Log position within the edge's event stream; 0 until appended.
    pub seq: u64,
    /// What happened.
    pub action: EdgeEventAction,
    /// Target entity type.
    pub entity_type: EntityType,
    /// Target entity id, when the action has a single target.
    pub entity_id: Option<Uuid>,
    /// Optional serialized body.
    pub body: Option<serde_json::Value>,
}

impl EdgeEvent {
    /// Create an event with no body.
    pub fn new(
        tenant_id: TenantId,
        edge_id: EdgeId,
        action: EdgeEventAction,
        entity_type: EntityType,
        entity_id: Option<Uuid>,
    ) -> Self {
        Self {
            tenant_id,
            edge_id,
            seq: 0,
            action,
            entity_type,
            entity_id,
            body: None,
        }
    }

    /// Attach a serialized body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}
