//! Per-result processing state

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::attributes::AttributeSchema;
use crate::db::settings;
use crate::error::SinkResult;
use crate::sync::SearchSyncEmitter;

/// Tenant configuration loaded once per processed result
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub integration_id: Option<Uuid>,
    pub schema: AttributeSchema,
    /// Empty when the tenant never configured one
    pub priority: Vec<String>,
}

impl TenantContext {
    pub async fn load(
        conn: &mut SqliteConnection,
        tenant_id: Uuid,
        integration_id: Option<Uuid>,
    ) -> SinkResult<Self> {
        Ok(Self {
            tenant_id,
            integration_id,
            schema: AttributeSchema::load(conn, tenant_id).await?,
            priority: settings::priority_array(conn, tenant_id)
                .await?
                .unwrap_or_default(),
        })
    }
}

/// Search-index requests collected during a transaction, sent after commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub members: Vec<Uuid>,
    pub organizations: Vec<Uuid>,
    pub removed_members: Vec<Uuid>,
}

impl SyncPlan {
    pub fn member(&mut self, id: Uuid) {
        if !self.members.contains(&id) {
            self.members.push(id);
        }
    }

    pub fn organization(&mut self, id: Uuid) {
        if !self.organizations.contains(&id) {
            self.organizations.push(id);
        }
    }

    pub fn removed_member(&mut self, id: Uuid) {
        self.members.retain(|m| *m != id);
        if !self.removed_members.contains(&id) {
            self.removed_members.push(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.organizations.is_empty() && self.removed_members.is_empty()
    }

    /// Fire every request; failures are logged, never returned
    pub async fn send(&self, tenant_id: Uuid, sync: &dyn SearchSyncEmitter) {
        for member_id in &self.members {
            if let Err(e) = sync.trigger_member_sync(tenant_id, *member_id).await {
                tracing::warn!(member_id = %member_id, error = %e, "Member sync request failed");
            }
        }
        for organization_id in &self.organizations {
            if let Err(e) = sync.trigger_organization_sync(tenant_id, *organization_id).await {
                tracing::warn!(
                    organization_id = %organization_id,
                    error = %e,
                    "Organization sync request failed"
                );
            }
        }
        for member_id in &self.removed_members {
            if let Err(e) = sync.trigger_remove_member(tenant_id, *member_id).await {
                tracing::warn!(member_id = %member_id, error = %e, "Member removal request failed");
            }
        }
    }
}
