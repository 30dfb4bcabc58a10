//! Downlink translation: stored edge events into wire messages.
//!
//! Conversion is gated on the client's protocol version: an entity kind the
//! connected client does not understand is suppressed, never errored. A
//! malformed event fails conversion with a typed error; the caller logs and
//! skips it so one bad event cannot block the rest of a batch.

use crate::edge::Edge;
use crate::error::{GatewayError, Result};
use crate::event::{EdgeEvent, EdgeEventAction};
use edgelink_proto::msg::{DownlinkPayload, UpdateAction};

/// Converts stored edge events into downlink payloads.
#[derive(Debug, Default, Clone)]
pub struct DownlinkConverter;

impl DownlinkConverter {
    /// Convert one event for the given edge. Returns `Ok(None)` when the
    /// event is suppressed by a version gate.
    pub fn convert(&self, edge: &Edge, event: &EdgeEvent) -> Result<Option<DownlinkPayload>> {
        if !edge.version.supports(event.entity_type) {
            return Ok(None);
        }
        match event.action {
            EdgeEventAction::Added
            | EdgeEventAction::Updated
            | EdgeEventAction::Deleted
            | EdgeEventAction::Assigned
            | EdgeEventAction::Unassigned
            | EdgeEventAction::CredentialsUpdated
            | EdgeEventAction::AlarmAck
            | EdgeEventAction::AlarmClear => Ok(Some(DownlinkPayload::EntityUpdate {
                entity_type: event.entity_type,
                entity_id: self.require_entity_id(event)?,
                action: lifecycle_action(event.action),
                body: event.body.clone(),
            })),
            EdgeEventAction::AttributesUpdated => Ok(Some(DownlinkPayload::Attributes {
                entity_type: event.entity_type,
                entity_id: self.require_entity_id(event)?,
                body: self.require_body(event)?,
            })),
            EdgeEventAction::AttributesDeleted => Ok(Some(DownlinkPayload::AttributesDeleted {
                entity_type: event.entity_type,
                entity_id: self.require_entity_id(event)?,
                keys: self.deleted_keys(event)?,
            })),
            EdgeEventAction::TimeseriesUpdated => Ok(Some(DownlinkPayload::Telemetry {
                entity_type: event.entity_type,
                entity_id: self.require_entity_id(event)?,
                body: self.require_body(event)?,
            })),
            EdgeEventAction::RelationAddOrUpdate => Ok(Some(DownlinkPayload::Relation {
                action: UpdateAction::Updated,
                body: self.require_body(event)?,
            })),
            EdgeEventAction::RelationDeleted => Ok(Some(DownlinkPayload::Relation {
                action: UpdateAction::Deleted,
                body: self.require_body(event)?,
            })),
            EdgeEventAction::RpcCall => Ok(Some(DownlinkPayload::RpcCall {
                device_id: self.require_entity_id(event)?,
                body: self.require_body(event)?,
            })),
        }
    }

    fn require_entity_id(&self, event: &EdgeEvent) -> Result<uuid::Uuid> {
        event.entity_id.ok_or_else(|| GatewayError::Conversion {
            msg: format!("event seq {} has no target entity id", event.seq),
        })
    }

    fn require_body(&self, event: &EdgeEvent) -> Result<serde_json::Value> {
        event.body.clone().ok_or_else(|| GatewayError::Conversion {
            msg: format!("event seq {} has no body", event.seq),
        })
    }

    fn deleted_keys(&self, event: &EdgeEvent) -> Result<Vec<String>> {
        let body = self.require_body(event)?;
        let keys = body
            .get("keys")
            .and_then(|k| k.as_array())
            .ok_or_else(|| GatewayError::Conversion {
                msg: format!("event seq {} has no deleted-keys list", event.seq),
            })?;
        Ok(keys
            .iter()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect())
    }
}

fn lifecycle_action(action: EdgeEventAction) -> UpdateAction {
    match action {
        EdgeEventAction::Added => UpdateAction::Added,
        EdgeEventAction::Deleted => UpdateAction::Deleted,
        EdgeEventAction::Assigned => UpdateAction::Assigned,
        EdgeEventAction::Unassigned => UpdateAction::Unassigned,
        // credential rotations and alarm transitions reach the edge as updates
        _ => UpdateAction::Updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{CustomerId, EdgeId, EdgeVersion, TenantId};
    use edgelink_proto::msg::EntityType;
    use uuid::Uuid;

    fn edge(version: EdgeVersion) -> Edge {
        Edge {
            tenant_id: TenantId::random(),
            id: EdgeId::random(),
            customer_id: Some(CustomerId::random()),
            routing_key: "rk".to_string(),
            secret: "s".to_string(),
            version,
            name: "e".to_string(),
            edge_type: "default".to_string(),
        }
    }

    fn event(action: EdgeEventAction, entity_type: EntityType) -> EdgeEvent {
        EdgeEvent::new(
            TenantId::random(),
            EdgeId::random(),
            action,
            entity_type,
            Some(Uuid::new_v4()),
        )
    }

    #[test]
    fn test_lifecycle_event_converts_to_entity_update() {
        let converter = DownlinkConverter;
        let ev = event(EdgeEventAction::Added, EntityType::Device)
            .with_body(serde_json::json!({"name": "sensor"}));
        let payload = converter.convert(&edge(EdgeVersion::V3), &ev).unwrap();
        assert!(matches!(
            payload,
            Some(DownlinkPayload::EntityUpdate {
                entity_type: EntityType::Device,
                action: UpdateAction::Added,
                ..
            })
        ));
    }

    #[test]
    fn test_version_gate_suppresses_instead_of_erroring() {
        let converter = DownlinkConverter;
        let ev = event(EdgeEventAction::Added, EntityType::AiModel)
            .with_body(serde_json::json!({"model": "m1"}));
        let payload = converter.convert(&edge(EdgeVersion::V1), &ev).unwrap();
        assert!(payload.is_none());

        let payload = converter.convert(&edge(EdgeVersion::V3), &ev).unwrap();
        assert!(payload.is_some());
    }

    #[test]
    fn test_telemetry_requires_body() {
        let converter = DownlinkConverter;
        let ev = event(EdgeEventAction::TimeseriesUpdated, EntityType::Device);
        let result = converter.convert(&edge(EdgeVersion::V3), &ev);
        assert!(matches!(result, Err(GatewayError::Conversion { .. })));
    }

    #[test]
    fn test_entity_update_requires_entity_id() {
        let converter = DownlinkConverter;
        let mut ev = event(EdgeEventAction::Updated, EntityType::Asset);
        ev.entity_id = None;
        let result = converter.convert(&edge(EdgeVersion::V3), &ev);
        assert!(matches!(result, Err(GatewayError::Conversion { .. })));
    }

    #[test]
    fn test_attributes_deleted_extracts_keys() {
        let converter = DownlinkConverter;
        let ev = event(EdgeEventAction::AttributesDeleted, EntityType::Device)
            .with_body(serde_json::json!({"keys": ["a", "b"]}));
        let payload = converter.convert(&edge(EdgeVersion::V3), &ev).unwrap();
        match payload {
            Some(DownlinkPayload::AttributesDeleted { keys, .. }) => {
                assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_rpc_call_targets_device() {
        let converter = DownlinkConverter;
        let device = Uuid::new_v4();
        let mut ev = event(EdgeEventAction::RpcCall, EntityType::Device)
            .with_body(serde_json::json!({"method": "reboot"}));
        ev.entity_id = Some(device);
        let payload = converter.convert(&edge(EdgeVersion::V3), &ev).unwrap();
        assert!(matches!(
            payload,
            Some(DownlinkPayload::RpcCall { device_id, .. }) if device_id == device
        ));
    }

    #[test]
    fn test_relation_deleted_maps_to_deleted_action() {
        let converter = DownlinkConverter;
        let ev = event(EdgeEventAction::RelationDeleted, EntityType::Relation)
            .with_body(serde_json::json!({"from": "a", "to": "b"}));
        let payload = converter.convert(&edge(EdgeVersion::V3), &ev).unwrap();
        assert!(matches!(
            payload,
            Some(DownlinkPayload::Relation {
                action: UpdateAction::Deleted,
                ..
            })
        ));
    }
}
