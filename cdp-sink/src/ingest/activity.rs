//! ACTIVITY results: member, optional object member, then the activity row

use sqlx::SqliteConnection;
use uuid::Uuid;

use super::context::{SyncPlan, TenantContext};
use super::member::{strip_erased, upsert_member};
use crate::db::{activities, organizations};
use crate::error::{SinkError, SinkResult};
use crate::identity::{find_member_for, heal_stale_activity};
use crate::types::{Activity, ActivityPayload, MemberIdentity, MemberIdentityType, MemberPayload};

/// What happened to the activity row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    Created(Uuid),
    Updated(Uuid),
    /// Same member already has an activity with this dedup key
    Duplicate,
    /// Payload carried an erased identity
    Ignored,
}

/// Username of `member` on `platform`, adding it as an identity when missing
///
/// Without an explicit username the member must carry exactly one username
/// identity for the platform; anything else can never succeed on retry.
fn resolve_username(
    platform: &str,
    explicit: Option<&str>,
    member: &mut MemberPayload,
) -> SinkResult<String> {
    let platform_usernames: Vec<&MemberIdentity> = member
        .identities
        .iter()
        .filter(|i| {
            i.platform == platform
                && i.identity_type == MemberIdentityType::Username
                && !i.value.trim().is_empty()
        })
        .collect();

    match explicit.map(str::trim).filter(|u| !u.is_empty()) {
        Some(username) => {
            if !platform_usernames.iter().any(|i| i.value == username) {
                member
                    .identities
                    .push(MemberIdentity::username(platform, username, true));
            }
            Ok(username.to_string())
        }
        None => match platform_usernames.as_slice() {
            [only] => Ok(only.value.clone()),
            [] => Err(SinkError::Unrepeatable(format!(
                "Member has no username identity for platform {}",
                platform
            ))),
            _ => Err(SinkError::Unrepeatable(format!(
                "Member has multiple username identities for platform {}",
                platform
            ))),
        },
    }
}

fn without_empty_identities(payload: &MemberPayload) -> MemberPayload {
    let mut cleaned = payload.clone();
    cleaned.identities.retain(|i| !i.value.trim().is_empty());
    cleaned.weak_identities.retain(|i| !i.value.trim().is_empty());
    cleaned
}

async fn upsert_object_member(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    platform: &str,
    payload: &ActivityPayload,
    plan: &mut SyncPlan,
) -> SinkResult<Option<(Uuid, String)>> {
    let mut object_member = match (&payload.object_member, &payload.object_member_username) {
        (Some(member), _) => without_empty_identities(member),
        (None, Some(username)) if !username.trim().is_empty() => MemberPayload {
            identities: vec![MemberIdentity::username(platform, username.trim(), true)],
            ..MemberPayload::default()
        },
        _ => return Ok(None),
    };

    let username = resolve_username(
        platform,
        payload.object_member_username.as_deref(),
        &mut object_member,
    )?;

    let Some(object_member) = strip_erased(conn, ctx.tenant_id, &object_member).await? else {
        return Ok(None);
    };

    let outcome = upsert_member(
        conn,
        ctx,
        platform,
        &object_member,
        Some(payload.timestamp),
        None,
        plan,
    )
    .await?;
    Ok(Some((outcome.member_id, username)))
}

/// Organization the member currently works for, if any
async fn current_organization(
    conn: &mut SqliteConnection,
    member_id: Uuid,
) -> SinkResult<Option<Uuid>> {
    let rows = organizations::member_organizations(conn, member_id).await?;
    Ok(rows
        .iter()
        .rev()
        .find(|row| row.date_end.is_none())
        .or_else(|| rows.last())
        .map(|row| row.organization_id))
}

/// Store one activity together with the members it references
pub async fn process_activity(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    platform: &str,
    payload: &ActivityPayload,
    plan: &mut SyncPlan,
) -> SinkResult<ActivityOutcome> {
    let mut member = without_empty_identities(&payload.member);
    let username = resolve_username(platform, payload.username.as_deref(), &mut member)?;

    let Some(member) = strip_erased(conn, ctx.tenant_id, &member).await? else {
        return Ok(ActivityOutcome::Ignored);
    };

    let object_member = upsert_object_member(conn, ctx, platform, payload, plan).await?;

    let known = find_member_for(conn, ctx.tenant_id, platform, &member.identities).await?;
    let outcome = upsert_member(
        conn,
        ctx,
        platform,
        &member,
        Some(payload.timestamp),
        known,
        plan,
    )
    .await?;
    let member_id = outcome.member_id;

    let mut activity = Activity {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        member_id,
        object_member_id: object_member.as_ref().map(|(id, _)| *id),
        object_member_username: object_member.map(|(_, username)| username),
        platform: platform.to_string(),
        activity_type: payload.activity_type.clone(),
        timestamp: payload.timestamp,
        source_id: payload.source_id.clone(),
        source_parent_id: payload.source_parent_id.clone(),
        username: Some(username),
        attributes: payload.attributes.clone(),
        sentiment: payload.sentiment.clone(),
        body: payload.body.clone(),
        title: payload.title.clone(),
        channel: payload.channel.clone(),
        url: payload.url.clone(),
        score: payload.score,
        is_contribution: payload.is_contribution.unwrap_or(false),
        organization_id: current_organization(conn, member_id).await?,
    };

    let existing = activities::find_existing(
        conn,
        ctx.tenant_id,
        &payload.timestamp,
        &payload.source_id,
        platform,
        &payload.activity_type,
        payload.channel.as_deref(),
    )
    .await?;

    if let Some(existing) = existing {
        if !heal_stale_activity(conn, &existing, member_id).await? {
            activity.id = existing.id;
            activities::update_activity(conn, &activity).await?;
            tracing::debug!(activity_id = %activity.id, "Updated existing activity");
            plan.member(member_id);
            return Ok(ActivityOutcome::Updated(activity.id));
        }
    }

    if !activities::insert_activity(conn, &activity).await? {
        tracing::debug!(
            member_id = %member_id,
            platform,
            activity_type = %activity.activity_type,
            "Member already has this activity, skipping"
        );
        return Ok(ActivityOutcome::Duplicate);
    }

    tracing::debug!(activity_id = %activity.id, member_id = %member_id, "Created activity");
    plan.member(member_id);
    Ok(ActivityOutcome::Created(activity.id))
}
