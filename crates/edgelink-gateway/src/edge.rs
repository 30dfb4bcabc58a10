//! Edge identity and the cached edge record.

use edgelink_proto::msg::{EdgeConfiguration, EntityType};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

/// Edge identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

/// Customer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub Uuid);

/// Opaque unique token identifying one session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSessionId(pub Uuid);

impl TenantId {
    /// Generate a random tenant id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl EdgeId {
    /// Generate a random edge id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl CustomerId {
    /// Generate a random customer id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl EdgeSessionId {
    /// Generate a fresh session token.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for EdgeSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Protocol version an edge connected with. Newer entity kinds are gated on
/// the client version; unsupported downlinks are suppressed, not errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeVersion {
    /// Baseline protocol.
    V1,
    /// Adds calculated fields and notification entities.
    V2,
    /// Adds AI models.
    V3,
}

impl EdgeVersion {
    /// Whether a client at this version understands downlinks for `entity_type`.
    pub fn supports(&self, entity_type: EntityType) -> bool {
        match entity_type {
            EntityType::AiModel => *self >= EdgeVersion::V3,
            EntityType::CalculatedField
            | EntityType::NotificationTemplate
            | EntityType::NotificationTarget
            | EntityType::NotificationRule => *self >= EdgeVersion::V2,
            _ => true,
        }
    }
}

/// A remote edge gateway as the platform knows it. Immutable except via
/// platform-side update; loaded at connect time and cached on the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Edge id.
    pub id: EdgeId,
    /// Assigned customer, if any.
    pub customer_id: Option<CustomerId>,
    /// Routing key the edge connects with.
    pub routing_key: String,
    /// Shared secret proving the edge's identity.
    pub secret: String,
    /// Protocol version of the connected client.
    pub version: EdgeVersion,
    /// Display name.
    pub name: String,
    /// Edge type label.
    pub edge_type: String,
}

impl Edge {
    /// The configuration payload pushed to the client on accept and on
    /// platform-side updates.
    pub fn configuration(&self) -> EdgeConfiguration {
        EdgeConfiguration {
            edge_id: self.id.0,
            tenant_id: self.tenant_id.0,
            customer_id: self.customer_id.map(|c| c.0),
            name: self.name.clone(),
            edge_type: self.edge_type.clone(),
            routing_key: self.routing_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge() -> Edge {
        Edge {
            tenant_id: TenantId::random(),
            id: EdgeId::random(),
            customer_id: Some(CustomerId::random()),
            routing_key: "rk-1".to_string(),
            secret: "s3cret".to_string(),
            version: EdgeVersion::V3,
            name: "factory-edge".to_string(),
            edge_type: "default".to_string(),
        }
    }

    #[test]
    fn test_configuration_mirrors_edge() {
        let e = edge();
        let cfg = e.configuration();
        assert_eq!(cfg.edge_id, e.id.0);
        assert_eq!(cfg.tenant_id, e.tenant_id.0);
        assert_eq!(cfg.customer_id, e.customer_id.map(|c| c.0));
        assert_eq!(cfg.name, e.name);
        assert_eq!(cfg.routing_key, e.routing_key);
    }

    #[test]
    fn test_version_gates() {
        assert!(!EdgeVersion::V1.supports(EntityType::CalculatedField));
        assert!(!EdgeVersion::V1.supports(EntityType::AiModel));
        assert!(EdgeVersion::V1.supports(EntityType::Device));

        assert!(EdgeVersion::V2.supports(EntityType::CalculatedField));
        assert!(!EdgeVersion::V2.supports(EntityType::AiModel));

        assert!(EdgeVersion::V3.supports(EntityType::AiModel));
    }

    #[test]
    fn test_version_ordering() {
        assert!(EdgeVersion::V1 < EdgeVersion::V2);
        assert!(EdgeVersion::V2 < EdgeVersion::V3);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(EdgeSessionId::random(), EdgeSessionId::random());
    }
}
