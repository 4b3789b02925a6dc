use cdp_common::events::{CdpEvent, EventBus};
use cdp_common::time::{fmt_ts, now};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::manager;
use crate::attributes::{calculate_reach, deep_merge, set_defaults};
use crate::db::members::MemberChanges;
use crate::db::{activities, identities, members, organizations, settings};
use crate::error::{ResultExt, SinkError, SinkResult};
use crate::sync::SearchSyncEmitter;
use crate::utils::retry_on_lock;

/// Absorb `secondary` into `primary` inside the caller's transaction
///
/// Returns `false` for a self-merge, which changes nothing. Primary wins
/// every conflict. Secondary activities that duplicate a primary activity
/// by (timestamp, type, platform) are dropped rather than moved.
pub async fn merge_in_transaction(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    primary_id: Uuid,
    secondary_id: Uuid,
) -> SinkResult<bool> {
    if primary_id == secondary_id {
        tracing::debug!(member_id = %primary_id, "Self-merge requested, nothing to do");
        return Ok(false);
    }

    let primary = members::find_member(conn, primary_id)
        .await?
        .ok_or_else(|| SinkError::NotFound(format!("member {}", primary_id)))?;
    let secondary = members::find_member(conn, secondary_id)
        .await?
        .ok_or_else(|| SinkError::NotFound(format!("member {}", secondary_id)))?;
    if primary.tenant_id != tenant_id || secondary.tenant_id != tenant_id {
        return Err(SinkError::Validation(format!(
            "Members {} and {} do not both belong to tenant {}",
            primary_id, secondary_id, tenant_id
        )));
    }

    // identities: union, primary's row wins on the same tuple
    let primary_identities = identities::identities_for_member(conn, primary_id).await?;
    for identity in identities::identities_for_member(conn, secondary_id).await? {
        match primary_identities.iter().find(|p| p.same_tuple(&identity)) {
            Some(existing) => {
                identities::delete_identity(conn, secondary_id, &identity).await?;
                if identity.verified && !existing.verified {
                    identities::set_identity_verified(conn, primary_id, existing, true).await?;
                }
            }
            None => identities::move_identity(conn, secondary_id, primary_id, &identity).await?,
        }
    }

    // attributes, reach, e-mails, joinedAt
    let mut attributes = deep_merge(&secondary.attributes, &primary.attributes);
    if !attributes.is_empty() {
        let priority = settings::priority_array(conn, tenant_id).await?.unwrap_or_default();
        attributes = set_defaults(&attributes, &priority)?;
    }

    let mut emails = primary.emails.clone();
    for email in &secondary.emails {
        if !emails.contains(email) {
            emails.push(email.clone());
        }
    }

    let changes = MemberChanges {
        display_name: match &primary.display_name {
            Some(_) => None,
            None => secondary.display_name.clone(),
        },
        emails: Some(emails),
        joined_at: Some(primary.joined_at.min(secondary.joined_at)),
        reach: Some(calculate_reach(&secondary.reach, &primary.reach)),
        attributes: Some(attributes),
    };
    members::update_member(conn, primary_id, &changes).await?;

    // activities
    let primary_keys: HashSet<(String, String, String)> =
        activities::activities_for_member(conn, primary_id)
            .await?
            .into_iter()
            .map(|a| (fmt_ts(&a.timestamp), a.activity_type, a.platform))
            .collect();
    let mut dropped = 0usize;
    let mut moved = 0usize;
    for activity in activities::activities_for_member(conn, secondary_id).await? {
        let key = (
            fmt_ts(&activity.timestamp),
            activity.activity_type.clone(),
            activity.platform.clone(),
        );
        if primary_keys.contains(&key) {
            activities::delete_activity(conn, activity.id).await?;
            dropped += 1;
        } else {
            activities::set_activity_member(conn, activity.id, primary_id).await?;
            moved += 1;
        }
    }
    activities::move_object_member(conn, secondary_id, primary_id).await?;

    // work experiences
    let primary_orgs = organizations::member_organizations(conn, primary_id).await?;
    for mut row in organizations::member_organizations(conn, secondary_id).await? {
        let duplicate = primary_orgs.iter().any(|p| {
            p.organization_id == row.organization_id
                && p.title == row.title
                && p.date_start == row.date_start
                && p.date_end == row.date_end
        });
        if duplicate {
            organizations::delete_member_organization(conn, row.id).await?;
        } else {
            row.member_id = primary_id;
            organizations::update_member_organization(conn, &row).await?;
        }
    }

    members::move_member_links(conn, secondary_id, primary_id).await?;
    manager::absorb(conn, primary_id, secondary_id).await?;
    members::record_merge_action(conn, tenant_id, primary_id, secondary_id).await?;
    members::delete_member(conn, secondary_id).await?;

    tracing::info!(
        primary_id = %primary_id,
        secondary_id = %secondary_id,
        activities_moved = moved,
        activities_dropped = dropped,
        "Merged members"
    );
    Ok(true)
}

/// Runs member merges and the edge operations around them
pub struct MergeService {
    pool: SqlitePool,
    sync: Arc<dyn SearchSyncEmitter>,
    events: EventBus,
    max_lock_wait_ms: u64,
}

impl MergeService {
    pub fn new(
        pool: SqlitePool,
        sync: Arc<dyn SearchSyncEmitter>,
        events: EventBus,
        max_lock_wait_ms: u64,
    ) -> Self {
        Self {
            pool,
            sync,
            events,
            max_lock_wait_ms,
        }
    }

    /// Merge `secondary` into `primary`; a self-merge succeeds without changes
    pub async fn merge(&self, tenant_id: Uuid, primary: Uuid, secondary: Uuid) -> SinkResult<bool> {
        if primary == secondary {
            return Ok(false);
        }

        let pool = &self.pool;
        let merged = retry_on_lock("member merge", self.max_lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;
            let merged = merge_in_transaction(&mut *tx, tenant_id, primary, secondary).await?;
            tx.commit().await.context("committing member merge")?;
            Ok::<bool, SinkError>(merged)
        })
        .await?;

        if merged {
            if let Err(e) = self.sync.trigger_member_sync(tenant_id, primary).await {
                tracing::warn!(member_id = %primary, error = %e, "Member sync request failed");
            }
            if let Err(e) = self.sync.trigger_remove_member(tenant_id, secondary).await {
                tracing::warn!(member_id = %secondary, error = %e, "Member removal request failed");
            }
            self.events.emit_lossy(CdpEvent::MembersMerged {
                tenant_id,
                primary_id: primary,
                secondary_id: secondary,
                timestamp: now(),
            });
        }
        Ok(merged)
    }

    pub async fn add_to_merge(&self, a: Uuid, b: Uuid) -> SinkResult<bool> {
        let mut tx = self.pool.begin().await?;
        let added = manager::add_to_merge(&mut *tx, a, b).await?;
        tx.commit().await?;
        Ok(added)
    }

    pub async fn add_to_no_merge(&self, a: Uuid, b: Uuid) -> SinkResult<()> {
        let mut tx = self.pool.begin().await?;
        manager::add_to_no_merge(&mut *tx, a, b).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn to_merge(&self, member: Uuid) -> SinkResult<Vec<Uuid>> {
        let mut conn = self.pool.acquire().await?;
        manager::to_merge(&mut *conn, member).await
    }

    pub async fn no_merge(&self, member: Uuid) -> SinkResult<Vec<Uuid>> {
        let mut conn = self.pool.acquire().await?;
        manager::no_merge(&mut *conn, member).await
    }
}
