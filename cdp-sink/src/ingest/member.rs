//! Member create/update from incoming payloads

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::context::{SyncPlan, TenantContext};
use crate::attributes::{calculate_reach, merge_for_update, set_defaults, validate};
use crate::db::members::{self, MemberChanges};
use crate::db::{erasure, identities};
use crate::error::{SinkError, SinkResult};
use crate::identity::{find_member_for, normalize_identities, reconcile_identities};
use crate::merge::manager;
use crate::organizations;
use crate::types::{Attributes, Member, MemberIdentity, MemberIdentityType, MemberPayload, Reach};

const IS_BOT: &str = "isBot";

/// Result of writing one member payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberOutcome {
    pub member_id: Uuid,
    pub created: bool,
    pub is_bot: bool,
}

fn is_truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true)) || value.as_str() == Some("true")
}

/// Whether any platform flags the member as a bot
pub fn is_bot_flagged(attributes: &Attributes) -> bool {
    attributes
        .get(IS_BOT)
        .and_then(Value::as_object)
        .map(|per_platform| per_platform.values().any(is_truthy))
        .unwrap_or(false)
}

/// GitHub app accounts are named `<name>[bot]`
fn looks_like_bot(identities: &[MemberIdentity]) -> bool {
    identities.iter().any(|i| {
        i.identity_type == MemberIdentityType::Username && i.value.to_lowercase().ends_with("[bot]")
    })
}

fn email_values(identities: &[MemberIdentity]) -> Vec<String> {
    let mut emails: Vec<String> = Vec::new();
    for identity in identities
        .iter()
        .filter(|i| i.identity_type == MemberIdentityType::Email)
    {
        if !emails.contains(&identity.value) {
            emails.push(identity.value.clone());
        }
    }
    emails
}

/// Attach reconciled identities and turn collisions into merge suggestions
async fn write_identities(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    member_id: Uuid,
    identities: &[MemberIdentity],
    hints: &[MemberIdentity],
) -> SinkResult<bool> {
    let strong: Vec<MemberIdentity> = identities.iter().filter(|i| i.verified).cloned().collect();
    let outcome = reconcile_identities(conn, ctx.tenant_id, Some(member_id), &strong, hints).await?;
    let mut changed = !outcome.to_attach.is_empty() || !outcome.to_verify.is_empty();

    for identity in &outcome.to_attach {
        identities::insert_identity(conn, ctx.tenant_id, member_id, identity, ctx.integration_id)
            .await?;
    }
    for identity in &outcome.to_verify {
        identities::set_identity_verified(conn, member_id, identity, true).await?;
    }
    for (identity, other) in &outcome.collisions {
        tracing::warn!(
            member_id = %member_id,
            other_member_id = %other,
            platform = %identity.platform,
            "Identity collision, suggesting merge"
        );
        manager::add_to_merge(conn, member_id, *other).await?;
    }

    // unverified identities are plain hints; an existing row keeps its flag
    let existing = identities::identities_for_member(conn, member_id).await?;
    for identity in identities.iter().filter(|i| !i.verified) {
        if !existing.iter().any(|e| e.same_tuple(identity)) {
            identities::insert_identity(conn, ctx.tenant_id, member_id, identity, ctx.integration_id)
                .await?;
            changed = true;
        }
    }

    Ok(changed)
}

#[allow(clippy::too_many_arguments)]
async fn link_organizations(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    platform: &str,
    member_id: Uuid,
    payload: &MemberPayload,
    emails: &[String],
    is_bot: bool,
    plan: &mut SyncPlan,
) -> SinkResult<()> {
    let mut organization_ids = Vec::new();

    for organization in &payload.organizations {
        if organization.identities.is_empty() {
            tracing::warn!(member_id = %member_id, "Skipping member organization without identities");
            continue;
        }
        let id = organizations::find_or_create(conn, ctx.tenant_id, platform, organization).await?;
        plan.organization(id);
        organization_ids.push(id);
    }

    if is_bot {
        tracing::debug!(member_id = %member_id, "Member is a bot, skipping email domain affiliation");
    } else {
        for id in organizations::assign_organization_by_email_domain(conn, ctx.tenant_id, emails).await? {
            if !organization_ids.contains(&id) {
                organization_ids.push(id);
            }
        }
    }

    if organizations::add_to_member(conn, member_id, &organization_ids, platform).await? > 0 {
        plan.member(member_id);
    }
    Ok(())
}

/// Apply erasure requests to an incoming member payload
///
/// `None` means a verified identity was erased and the payload must be
/// acknowledged without effect; erased unverified identities are stripped.
pub async fn strip_erased(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    payload: &MemberPayload,
) -> SinkResult<Option<MemberPayload>> {
    let mut stripped = payload.clone();
    stripped.identities.clear();
    for identity in &payload.identities {
        if erasure::is_erased(conn, tenant_id, identity).await? {
            if identity.verified {
                tracing::info!(
                    platform = %identity.platform,
                    identity_type = %identity.identity_type,
                    "Payload carries an erased identity, ignoring it"
                );
                return Ok(None);
            }
            continue;
        }
        stripped.identities.push(identity.clone());
    }

    stripped.weak_identities.clear();
    for identity in &payload.weak_identities {
        if !erasure::is_erased(conn, tenant_id, identity).await? {
            stripped.weak_identities.push(identity.clone());
        }
    }
    Ok(Some(stripped))
}

/// Create or update the member a payload describes
///
/// `known` skips the lookup when the caller already resolved the member.
/// `default_joined_at` stands in for a missing `joinedAt` (the activity
/// timestamp for activity payloads).
pub async fn upsert_member(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    platform: &str,
    payload: &MemberPayload,
    default_joined_at: Option<DateTime<Utc>>,
    known: Option<Uuid>,
    plan: &mut SyncPlan,
) -> SinkResult<MemberOutcome> {
    let identities = normalize_identities(&payload.identities);
    let hints = normalize_identities(&payload.weak_identities);
    if identities.is_empty() && hints.is_empty() {
        return Err(SinkError::Validation("Member payload has no usable identities".to_string()));
    }

    let incoming_attributes = if payload.attributes.is_empty() {
        Attributes::new()
    } else {
        validate(&ctx.schema, &payload.attributes, Some(platform))?
    };

    let existing = match known {
        Some(id) => Some(id),
        None => find_member_for(conn, ctx.tenant_id, platform, &identities).await?,
    };

    match existing {
        None => {
            create_member(
                conn,
                ctx,
                platform,
                payload,
                default_joined_at,
                identities,
                hints,
                incoming_attributes,
                plan,
            )
            .await
        }
        Some(id) => {
            let member = members::find_member(conn, id)
                .await?
                .ok_or_else(|| SinkError::NotFound(format!("member {}", id)))?;
            update_member(
                conn,
                ctx,
                platform,
                payload,
                default_joined_at,
                member,
                identities,
                hints,
                incoming_attributes,
                plan,
            )
            .await
        }
    }
}

/// MEMBER_UPDATE results only touch members that already exist
pub async fn process_member_update(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    platform: &str,
    payload: &MemberPayload,
    plan: &mut SyncPlan,
) -> SinkResult<Option<Uuid>> {
    let Some(payload) = strip_erased(conn, ctx.tenant_id, payload).await? else {
        return Ok(None);
    };
    let identities = normalize_identities(&payload.identities);
    let Some(member_id) = find_member_for(conn, ctx.tenant_id, platform, &identities).await? else {
        tracing::debug!(platform, "No member found for update, skipping");
        return Ok(None);
    };
    let outcome = upsert_member(conn, ctx, platform, &payload, None, Some(member_id), plan).await?;
    Ok(Some(outcome.member_id))
}

#[allow(clippy::too_many_arguments)]
async fn create_member(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    platform: &str,
    payload: &MemberPayload,
    default_joined_at: Option<DateTime<Utc>>,
    identities: Vec<MemberIdentity>,
    hints: Vec<MemberIdentity>,
    mut attributes: Attributes,
    plan: &mut SyncPlan,
) -> SinkResult<MemberOutcome> {
    if looks_like_bot(&identities) && !is_bot_flagged(&attributes) {
        let flags = attributes
            .entry(IS_BOT.to_string())
            .or_insert_with(|| json!({}));
        if let Some(map) = flags.as_object_mut() {
            map.insert("system".to_string(), Value::Bool(true));
        }
    }
    if !attributes.is_empty() {
        attributes = set_defaults(&attributes, &ctx.priority)?;
    }
    let is_bot = is_bot_flagged(&attributes);

    let ts = cdp_common::time::now();
    let emails = email_values(&identities);
    let display_name = payload
        .display_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| {
            identities
                .iter()
                .find(|i| i.identity_type == MemberIdentityType::Username)
                .map(|i| i.value.clone())
        });
    let unknown_reach = Reach::from([("total".to_string(), -1)]);

    let member = Member {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        display_name,
        emails: emails.clone(),
        joined_at: payload.joined_at.or(default_joined_at).unwrap_or(ts),
        score: None,
        reach: calculate_reach(&unknown_reach, &payload.reach.clone().unwrap_or_default()),
        attributes,
        manually_changed_fields: Vec::new(),
        enrichment_last_tried_at: None,
        enrichment_last_updated_at: None,
        created_at: ts,
        updated_at: ts,
    };
    members::insert_member(conn, &member).await?;
    tracing::info!(member_id = %member.id, platform, "Created member");

    write_identities(conn, ctx, member.id, &identities, &hints).await?;
    link_organizations(conn, ctx, platform, member.id, payload, &emails, is_bot, plan).await?;
    plan.member(member.id);

    Ok(MemberOutcome {
        member_id: member.id,
        created: true,
        is_bot,
    })
}

#[allow(clippy::too_many_arguments)]
async fn update_member(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    platform: &str,
    payload: &MemberPayload,
    default_joined_at: Option<DateTime<Utc>>,
    member: Member,
    identities: Vec<MemberIdentity>,
    hints: Vec<MemberIdentity>,
    mut incoming_attributes: Attributes,
    plan: &mut SyncPlan,
) -> SinkResult<MemberOutcome> {
    if is_bot_flagged(&incoming_attributes) && !is_bot_flagged(&member.attributes) {
        tracing::warn!(
            member_id = %member.id,
            "Member attributes appear corrupted due to bot attributes, discarding them"
        );
        incoming_attributes.clear();
    }

    let attributes = if incoming_attributes.is_empty() {
        None
    } else {
        merge_for_update(&member.attributes, &incoming_attributes, &member.manually_changed_fields)
            .map(|merged| set_defaults(&merged, &ctx.priority))
            .transpose()?
            .filter(|merged| *merged != member.attributes)
    };

    let joined_at = payload
        .joined_at
        .or(default_joined_at)
        .filter(|candidate| *candidate < member.joined_at);

    let reach = payload
        .reach
        .as_ref()
        .map(|incoming| calculate_reach(&member.reach, incoming))
        .filter(|merged| *merged != member.reach);

    let display_name = match member.display_name {
        Some(_) => None,
        None => payload.display_name.clone().filter(|n| !n.trim().is_empty()),
    };

    let mut emails = member.emails.clone();
    for email in email_values(&identities) {
        if !emails.contains(&email) {
            emails.push(email);
        }
    }
    let emails_changed = emails != member.emails;

    let changes = MemberChanges {
        display_name,
        emails: if emails_changed { Some(emails.clone()) } else { None },
        joined_at,
        reach,
        attributes,
    };

    let is_bot = is_bot_flagged(changes.attributes.as_ref().unwrap_or(&member.attributes));
    let mut changed = members::update_member(conn, member.id, &changes).await?;
    if changed {
        tracing::debug!(member_id = %member.id, "Updated member");
    }

    changed |= write_identities(conn, ctx, member.id, &identities, &hints).await?;
    link_organizations(conn, ctx, platform, member.id, payload, &emails, is_bot, plan).await?;

    if changed {
        plan.member(member.id);
    }

    Ok(MemberOutcome {
        member_id: member.id,
        created: false,
        is_bot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_flag_detection() {
        let attributes: Attributes =
            serde_json::from_value(json!({ "isBot": { "github": false, "system": "true" } })).unwrap();
        assert!(is_bot_flagged(&attributes));
        assert!(!is_bot_flagged(&Attributes::new()));
        assert!(looks_like_bot(&[MemberIdentity::username("github", "dependabot[bot]", true)]));
        assert!(!looks_like_bot(&[MemberIdentity::username("github", "robert", true)]));
    }

    #[test]
    fn test_email_values_are_unique() {
        let identities = vec![
            MemberIdentity::email("github", "a@b.io", true),
            MemberIdentity::email("slack", "a@b.io", true),
            MemberIdentity::username("github", "a", true),
        ];
        assert_eq!(email_values(&identities), vec!["a@b.io".to_string()]);
    }
}
