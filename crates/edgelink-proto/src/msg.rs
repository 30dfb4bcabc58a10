//! Wire message catalog for the edge session protocol.
//!
//! The transport is a bidirectional streaming RPC: the edge sends
//! [`RequestMsg`] frames, the platform answers with [`ResponseMsg`] frames.
//! Only the envelope and the message kinds the session core routes on are
//! defined here; per-entity business payloads travel as opaque JSON bodies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform entity types that can be replicated to an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Device entity.
    Device,
    /// Device profile.
    DeviceProfile,
    /// Asset entity.
    Asset,
    /// Asset profile.
    AssetProfile,
    /// Entity view.
    EntityView,
    /// Dashboard.
    Dashboard,
    /// Rule chain.
    RuleChain,
    /// Platform user.
    User,
    /// Customer.
    Customer,
    /// Tenant.
    Tenant,
    /// Entity relation.
    Relation,
    /// Alarm.
    Alarm,
    /// Widget type.
    WidgetType,
    /// Widgets bundle.
    WidgetsBundle,
    /// Message queue definition.
    Queue,
    /// Administration settings.
    AdminSettings,
    /// OAuth2 client/domain configuration.
    OAuth2Domain,
    /// Notification template.
    NotificationTemplate,
    /// Notification target.
    NotificationTarget,
    /// Notification rule.
    NotificationRule,
    /// OTA package.
    OtaPackage,
    /// Tenant resource (image, JS module, ...).
    TenantResource,
    /// Calculated field.
    CalculatedField,
    /// AI model.
    AiModel,
}

/// Lifecycle action carried by an entity downlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    /// Entity was created on the platform.
    Added,
    /// Entity was updated.
    Updated,
    /// Entity was deleted.
    Deleted,
    /// Entity was assigned to the edge.
    Assigned,
    /// Entity was unassigned from the edge.
    Unassigned,
}

/// Connect request sent by an edge as the first frame of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequestMsg {
    /// Routing key identifying the edge.
    pub routing_key: String,
    /// Shared secret proving the edge's identity.
    pub secret: String,
}

/// Typed result code of a connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectResponseCode {
    /// Handshake succeeded; the session is live.
    Accepted,
    /// Unknown routing key or secret mismatch.
    BadCredentials,
    /// The platform could not complete the handshake.
    ServerUnavailable,
}

/// The platform's view of an edge, pushed on accept and on config updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfiguration {
    /// Edge id.
    pub edge_id: Uuid,
    /// Owning tenant id.
    pub tenant_id: Uuid,
    /// Assigned customer, if any.
    pub customer_id: Option<Uuid>,
    /// Display name.
    pub name: String,
    /// Edge type label.
    pub edge_type: String,
    /// Routing key the edge connected with.
    pub routing_key: String,
}

/// Connect handshake response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponseMsg {
    /// Typed result code.
    pub code: ConnectResponseCode,
    /// Human-readable error text; empty on success.
    pub error_msg: String,
    /// Edge configuration payload; present only when accepted.
    pub configuration: Option<EdgeConfiguration>,
}

impl ConnectResponseMsg {
    /// Build an accepted response carrying the edge configuration.
    pub fn accepted(configuration: EdgeConfiguration) -> Self {
        Self {
            code: ConnectResponseCode::Accepted,
            error_msg: String::new(),
            configuration: Some(configuration),
        }
    }

    /// Build a typed rejection with error text.
    pub fn rejected(code: ConnectResponseCode, error_msg: &str) -> Self {
        Self {
            code,
            error_msg: error_msg.to_string(),
            configuration: None,
        }
    }
}

/// Payload of one downlink message (platform → edge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkPayload {
    /// Entity lifecycle/assignment update.
    EntityUpdate {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: Uuid,
        /// Lifecycle action.
        action: UpdateAction,
        /// Serialized entity body; absent for deletions.
        body: Option<serde_json::Value>,
    },
    /// Time-series values for an entity.
    Telemetry {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: Uuid,
        /// Key/value payload.
        body: serde_json::Value,
    },
    /// Attribute values for an entity.
    Attributes {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: Uuid,
        /// Key/value payload.
        body: serde_json::Value,
    },
    /// Attribute keys deleted from an entity.
    AttributesDeleted {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: Uuid,
        /// Deleted keys.
        keys: Vec<String>,
    },
    /// Relation added, updated or removed.
    Relation {
        /// Lifecycle action.
        action: UpdateAction,
        /// Serialized relation.
        body: serde_json::Value,
    },
    /// RPC call targeted at a device behind the edge.
    RpcCall {
        /// Target device id.
        device_id: Uuid,
        /// Serialized request.
        body: serde_json::Value,
    },
    /// Updated platform view of the edge itself.
    EdgeConfig(EdgeConfiguration),
    /// Marks the end of a sync run.
    SyncComplete,
}

/// One downlink message with its session-scoped id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkMsg {
    /// Monotonically assigned per-session message id.
    pub msg_id: u64,
    /// Message payload.
    pub payload: DownlinkPayload,
}

/// Per-message acknowledgement for a downlink (edge → platform).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkResponseMsg {
    /// Id of the acknowledged downlink message.
    pub msg_id: u64,
    /// Whether the edge applied the message.
    pub success: bool,
    /// Error text when not applied.
    pub error_msg: String,
}

/// Routing kind of an uplink sub-message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkKind {
    /// Device updates.
    Device,
    /// Asset updates.
    Asset,
    /// Entity view updates.
    EntityView,
    /// Rule chain updates.
    RuleChain,
    /// Relation updates.
    Relation,
    /// Alarm updates.
    Alarm,
    /// Dashboard updates.
    Dashboard,
    /// Resource updates.
    Resource,
    /// User record updates.
    User,
    /// User credentials updates.
    UserCredentials,
    /// RPC responses.
    Rpc,
    /// Calculated field updates.
    CalculatedField,
    /// AI model updates.
    AiModel,
    /// Time-series values.
    Telemetry,
    /// Attribute values.
    Attributes,
}

/// One uplink sub-message (edge → platform).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkPayload {
    /// Device created/updated on the edge.
    DeviceUpdate {
        /// Device id.
        entity_id: Uuid,
        /// Serialized device.
        body: serde_json::Value,
    },
    /// Asset created/updated on the edge.
    AssetUpdate {
        /// Asset id.
        entity_id: Uuid,
        /// Serialized asset.
        body: serde_json::Value,
    },
    /// Entity view created/updated on the edge.
    EntityViewUpdate {
        /// Entity view id.
        entity_id: Uuid,
        /// Serialized entity view.
        body: serde_json::Value,
    },
    /// Rule chain changed on the edge.
    RuleChainUpdate {
        /// Rule chain id.
        entity_id: Uuid,
        /// Serialized rule chain.
        body: serde_json::Value,
    },
    /// Relation changed on the edge.
    RelationUpdate {
        /// Serialized relation.
        body: serde_json::Value,
    },
    /// Alarm raised/updated on the edge.
    AlarmUpdate {
        /// Alarm id.
        entity_id: Uuid,
        /// Serialized alarm.
        body: serde_json::Value,
    },
    /// Dashboard changed on the edge.
    DashboardUpdate {
        /// Dashboard id.
        entity_id: Uuid,
        /// Serialized dashboard.
        body: serde_json::Value,
    },
    /// Resource uploaded on the edge.
    ResourceUpdate {
        /// Resource id.
        entity_id: Uuid,
        /// Serialized resource.
        body: serde_json::Value,
    },
    /// User record changed on the edge. Ordered relative to
    /// [`UplinkPayload::UserCredentialsUpdate`] for the same user.
    UserUpdate {
        /// User id.
        entity_id: Uuid,
        /// Serialized user.
        body: serde_json::Value,
    },
    /// User credentials changed on the edge. Must never be applied before
    /// the corresponding user record exists.
    UserCredentialsUpdate {
        /// Owning user id.
        user_id: Uuid,
        /// Serialized credentials.
        body: serde_json::Value,
    },
    /// Response to an RPC call previously pushed downlink.
    RpcResponse {
        /// Id of the originating RPC request.
        request_id: Uuid,
        /// Serialized response.
        body: serde_json::Value,
    },
    /// Calculated field changed on the edge.
    CalculatedFieldUpdate {
        /// Calculated field id.
        entity_id: Uuid,
        /// Serialized calculated field.
        body: serde_json::Value,
    },
    /// AI model changed on the edge.
    AiModelUpdate {
        /// AI model id.
        entity_id: Uuid,
        /// Serialized model.
        body: serde_json::Value,
    },
    /// Time-series values reported by the edge.
    Telemetry {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: Uuid,
        /// Key/value payload.
        body: serde_json::Value,
    },
    /// Attribute values reported by the edge.
    AttributesUpdate {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: Uuid,
        /// Key/value payload.
        body: serde_json::Value,
    },
}

impl UplinkPayload {
    /// Routing kind used by the uplink dispatcher.
    pub fn kind(&self) -> UplinkKind {
        match self {
            UplinkPayload::DeviceUpdate { .. } => UplinkKind::Device,
            UplinkPayload::AssetUpdate { .. } => UplinkKind::Asset,
            UplinkPayload::EntityViewUpdate { .. } => UplinkKind::EntityView,
            UplinkPayload::RuleChainUpdate { .. } => UplinkKind::RuleChain,
            UplinkPayload::RelationUpdate { .. } => UplinkKind::Relation,
            UplinkPayload::AlarmUpdate { .. } => UplinkKind::Alarm,
            UplinkPayload::DashboardUpdate { .. } => UplinkKind::Dashboard,
            UplinkPayload::ResourceUpdate { .. } => UplinkKind::Resource,
            UplinkPayload::UserUpdate { .. } => UplinkKind::User,
            UplinkPayload::UserCredentialsUpdate { .. } => UplinkKind::UserCredentials,
            UplinkPayload::RpcResponse { .. } => UplinkKind::Rpc,
            UplinkPayload::CalculatedFieldUpdate { .. } => UplinkKind::CalculatedField,
            UplinkPayload::AiModelUpdate { .. } => UplinkKind::AiModel,
            UplinkPayload::Telemetry { .. } => UplinkKind::Telemetry,
            UplinkPayload::AttributesUpdate { .. } => UplinkKind::Attributes,
        }
    }

    /// True for kinds whose relative arrival order must be preserved.
    pub fn is_order_sensitive(&self) -> bool {
        matches!(
            self.kind(),
            UplinkKind::User | UplinkKind::UserCredentials
        )
    }
}

/// One decoded uplink batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkMsg {
    /// Sub-messages in arrival order.
    pub msgs: Vec<UplinkPayload>,
}

/// Whole-batch result of an uplink dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkResponseMsg {
    /// True when every sub-message was dispatched.
    pub success: bool,
    /// Error text on failure.
    pub error_msg: String,
}

/// Client → server frame envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMsg {
    /// Session handshake; must be the first frame.
    Connect(ConnectRequestMsg),
    /// One uplink batch.
    Uplink(UplinkMsg),
    /// Acknowledgement of one downlink message.
    DownlinkAck(DownlinkResponseMsg),
}

/// Server → client frame envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMsg {
    /// Handshake result.
    ConnectResponse(ConnectResponseMsg),
    /// Whole-batch uplink result.
    UplinkResponse(UplinkResponseMsg),
    /// One downlink message.
    Downlink(DownlinkMsg),
}
