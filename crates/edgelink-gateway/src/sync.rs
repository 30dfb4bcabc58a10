//! The sync cursor: a deterministic, ordered plan of entity fetchers used for
//! one full or partial state replication to an edge.
//!
//! A cursor is built per sync request and walked strictly in order;
//! exhaustion is terminal. A dropped connection never resumes a cursor — a
//! reconnect triggers a fresh sync request and a fresh cursor.

use crate::edge::Edge;
use serde::{Deserialize, Serialize};

/// One step of the replication plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFetcher {
    /// The owning tenant entity.
    Tenant,
    /// Message queue definitions.
    Queues,
    /// Rule chains.
    RuleChains,
    /// Administration settings.
    AdminSettings,
    /// Tenant administrator users.
    TenantAdminUsers,
    /// OAuth2 clients and domains.
    OAuth2Domains,
    /// System and tenant widget types.
    WidgetTypes,
    /// System and tenant widget bundles.
    WidgetsBundles,
    /// AI models.
    AiModels,
    /// The public customer.
    PublicCustomer,
    /// The customer the edge is assigned to.
    AssignedCustomer,
    /// Users of the assigned customer.
    CustomerUsers,
    /// Dashboards assigned to the edge.
    Dashboards,
    /// Default device and asset profiles.
    DefaultProfiles,
    /// Device profiles.
    DeviceProfiles,
    /// Asset profiles.
    AssetProfiles,
    /// Devices assigned to the edge.
    Devices,
    /// Assets assigned to the edge.
    Assets,
    /// Entity views assigned to the edge.
    EntityViews,
    /// Notification templates.
    NotificationTemplates,
    /// Notification targets.
    NotificationTargets,
    /// Notification rules.
    NotificationRules,
    /// OTA packages.
    OtaPackages,
    /// Second device-profile pass, picking up fields set after the first.
    DeviceProfilesSecondPass,
    /// Tenant resources.
    TenantResources,
}

const FULL_PREFIX: &[SyncFetcher] = &[
    SyncFetcher::Tenant,
    SyncFetcher::Queues,
    SyncFetcher::RuleChains,
    SyncFetcher::AdminSettings,
    SyncFetcher::TenantAdminUsers,
    SyncFetcher::OAuth2Domains,
    SyncFetcher::WidgetTypes,
    SyncFetcher::WidgetsBundles,
    SyncFetcher::AiModels,
];

const FULL_SUFFIX: &[SyncFetcher] = &[
    SyncFetcher::NotificationTemplates,
    SyncFetcher::NotificationTargets,
    SyncFetcher::NotificationRules,
    SyncFetcher::OtaPackages,
    SyncFetcher::DeviceProfilesSecondPass,
    SyncFetcher::TenantResources,
];

/// Ordered, resumable-within-one-run sequence of fetchers.
#[derive(Debug)]
pub struct SyncCursor {
    fetchers: Vec<SyncFetcher>,
    index: usize,
}

impl SyncCursor {
    /// Build the plan for one sync run. The assigned-customer steps are
    /// included only when the edge has a customer.
    pub fn new(edge: &Edge, full_sync: bool) -> Self {
        let mut fetchers = Vec::new();
        if full_sync {
            fetchers.extend_from_slice(FULL_PREFIX);
        }
        fetchers.push(SyncFetcher::PublicCustomer);
        if edge.customer_id.is_some() {
            fetchers.push(SyncFetcher::AssignedCustomer);
            fetchers.push(SyncFetcher::CustomerUsers);
        }
        fetchers.extend_from_slice(&[
            SyncFetcher::Dashboards,
            SyncFetcher::DefaultProfiles,
            SyncFetcher::DeviceProfiles,
            SyncFetcher::AssetProfiles,
            SyncFetcher::Devices,
            SyncFetcher::Assets,
            SyncFetcher::EntityViews,
        ]);
        if full_sync {
            fetchers.extend_from_slice(FULL_SUFFIX);
        }
        Self { fetchers, index: 0 }
    }

    /// Whether another fetcher remains.
    pub fn has_next(&self) -> bool {
        self.index < self.fetchers.len()
    }

    /// Advance to the next fetcher. Returns `None` once exhausted.
    pub fn next(&mut self) -> Option<SyncFetcher> {
        let fetcher = self.fetchers.get(self.index).copied()?;
        self.index += 1;
        Some(fetcher)
    }

    /// Number of fetchers in this plan.
    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    /// Current position within the plan.
    pub fn position(&self) -> usize {
        self.index
    }
}
