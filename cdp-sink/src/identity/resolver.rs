use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::attributes::is_valid_email;
use crate::db::{activities, identities};
use crate::error::SinkResult;
use crate::types::{Activity, MemberIdentity, MemberIdentityType};

/// Outcome of checking incoming identities against what the tenant already knows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityReconciliation {
    /// New rows for the owner, with the verified flag they should be stored with
    pub to_attach: Vec<MemberIdentity>,
    /// Rows already on the owner that are promoted to verified
    pub to_verify: Vec<MemberIdentity>,
    /// Identities verified on another member, paired with that member
    pub collisions: Vec<(MemberIdentity, Uuid)>,
}

impl IdentityReconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_attach.is_empty() && self.to_verify.is_empty() && self.collisions.is_empty()
    }
}

/// Member owning a verified identity tuple
pub async fn resolve(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    platform: &str,
    identity_type: MemberIdentityType,
    value: &str,
) -> SinkResult<Option<Uuid>> {
    let value = match identity_type {
        MemberIdentityType::Email => value.trim().to_lowercase(),
        MemberIdentityType::Username => value.trim().to_string(),
    };
    if value.is_empty() {
        return Ok(None);
    }
    identities::find_member_by_verified(conn, tenant_id, platform, identity_type, &value).await
}

/// Clean incoming identities before they are resolved
///
/// Empty values are dropped. E-mails are lower-cased and syntactically
/// checked; invalid ones are dropped. Duplicate tuples collapse into one,
/// verified if any copy was.
pub fn normalize_identities(identities: &[MemberIdentity]) -> Vec<MemberIdentity> {
    let mut normalized: Vec<MemberIdentity> = Vec::with_capacity(identities.len());

    for identity in identities {
        let value = identity.value.trim();
        if value.is_empty() {
            continue;
        }

        let value = match identity.identity_type {
            MemberIdentityType::Email => {
                let lowered = value.to_lowercase();
                if !is_valid_email(&lowered) {
                    tracing::warn!(platform = %identity.platform, "Dropping invalid email identity");
                    continue;
                }
                lowered
            }
            MemberIdentityType::Username => value.to_string(),
        };

        let candidate = MemberIdentity {
            value,
            ..identity.clone()
        };

        match normalized.iter_mut().find(|i| i.same_tuple(&candidate)) {
            Some(existing) => {
                existing.verified |= candidate.verified;
                if existing.source_id.is_none() {
                    existing.source_id = candidate.source_id;
                }
            }
            None => normalized.push(candidate),
        }
    }

    normalized
}

/// Find the member an incoming fact belongs to
///
/// The username on the fact's own platform is tried first, matching stored
/// rows whatever their verified flag, then every other verified identity in
/// payload order. Verified e-mails match across platforms.
pub async fn find_member_for(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    platform: &str,
    identities: &[MemberIdentity],
) -> SinkResult<Option<Uuid>> {
    let is_platform_username = |i: &MemberIdentity| {
        i.platform == platform && i.identity_type == MemberIdentityType::Username
    };

    let ordered = identities
        .iter()
        .filter(|i| is_platform_username(*i))
        .chain(identities.iter().filter(|i| i.verified && !is_platform_username(*i)));

    for identity in ordered {
        let owner = match identity.identity_type {
            MemberIdentityType::Email => {
                identities::find_member_by_verified_email(conn, tenant_id, &identity.value).await?
            }
            MemberIdentityType::Username if identity.platform == platform => {
                identities::find_member_by_username(conn, tenant_id, platform, &identity.value).await?
            }
            MemberIdentityType::Username => {
                identities::find_member_by_verified(
                    conn,
                    tenant_id,
                    &identity.platform,
                    identity.identity_type,
                    &identity.value,
                )
                .await?
            }
        };

        if let Some(member_id) = owner {
            tracing::debug!(
                member_id = %member_id,
                platform = %identity.platform,
                identity_type = %identity.identity_type,
                "Resolved member by identity"
            );
            return Ok(Some(member_id));
        }
    }

    Ok(None)
}

/// Decide which incoming identities `owner` gets and which collide
///
/// `strong` identities that nobody else owns are attached verified; those
/// verified on another member are kept as unverified hints. `weak`
/// identities nobody owns are promoted to verified; colliding ones are left
/// out. Every collision is reported so the caller can suggest a merge.
/// `owner` is `None` while the member is still being created.
pub async fn reconcile_identities(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    owner: Option<Uuid>,
    strong: &[MemberIdentity],
    weak: &[MemberIdentity],
) -> SinkResult<IdentityReconciliation> {
    let existing = match owner {
        Some(member_id) => identities::identities_for_member(conn, member_id).await?,
        None => Vec::new(),
    };

    let mut outcome = IdentityReconciliation::default();
    let mut seen: Vec<&MemberIdentity> = Vec::new();

    let incoming = strong
        .iter()
        .map(|i| (i, true))
        .chain(weak.iter().map(|i| (i, false)));

    for (identity, is_strong) in incoming {
        if seen.iter().any(|s| s.same_tuple(identity)) {
            continue;
        }
        seen.push(identity);

        let current = existing.iter().find(|e| e.same_tuple(identity));
        if current.map(|c| c.verified).unwrap_or(false) {
            continue;
        }

        let other_owner = identities::find_member_by_verified(
            conn,
            tenant_id,
            &identity.platform,
            identity.identity_type,
            &identity.value,
        )
        .await?
        .filter(|id| Some(*id) != owner);

        match (current, other_owner) {
            (Some(_), None) => outcome.to_verify.push(identity.clone()),
            (None, None) => outcome.to_attach.push(MemberIdentity {
                verified: true,
                ..identity.clone()
            }),
            (current, Some(other)) => {
                tracing::warn!(
                    other_member_id = %other,
                    platform = %identity.platform,
                    identity_type = %identity.identity_type,
                    "Identity already verified on another member"
                );
                if is_strong && current.is_none() {
                    outcome.to_attach.push(MemberIdentity {
                        verified: false,
                        ..identity.clone()
                    });
                }
                outcome.collisions.push((identity.clone(), other));
            }
        }
    }

    Ok(outcome)
}

/// Remove an activity stored against a member its identity no longer resolves to
///
/// Returns `true` when the stale row was deleted; the caller recreates it
/// for `resolved_member`.
pub async fn heal_stale_activity(
    conn: &mut SqliteConnection,
    activity: &Activity,
    resolved_member: Uuid,
) -> SinkResult<bool> {
    if activity.member_id == resolved_member {
        return Ok(false);
    }

    tracing::warn!(
        activity_id = %activity.id,
        stored_member_id = %activity.member_id,
        resolved_member_id = %resolved_member,
        "Activity points at the wrong member, recreating it"
    );
    activities::delete_activity(conn, activity.id).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_tables, members};
    use crate::types::{Member, Reach};
    use cdp_common::time::now;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_tables(&pool).await.unwrap();
        pool
    }

    async fn member_with(
        conn: &mut SqliteConnection,
        tenant: Uuid,
        identities: &[MemberIdentity],
    ) -> Uuid {
        let ts = now();
        let member = Member {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            display_name: None,
            emails: vec![],
            joined_at: ts,
            score: None,
            reach: Reach::from([("total".to_string(), -1)]),
            attributes: Default::default(),
            manually_changed_fields: vec![],
            enrichment_last_tried_at: None,
            enrichment_last_updated_at: None,
            created_at: ts,
            updated_at: ts,
        };
        members::insert_member(conn, &member).await.unwrap();
        for identity in identities {
            identities::insert_identity(conn, tenant, member.id, identity, None)
                .await
                .unwrap();
        }
        member.id
    }

    #[test]
    fn test_normalize_drops_empty_and_invalid() {
        let input = vec![
            MemberIdentity::username("github", "  ", true),
            MemberIdentity::email("github", "Ada@Example.COM", true),
            MemberIdentity::email("github", "ada@example.com", false),
            MemberIdentity::email("github", "not-an-email", true),
            MemberIdentity::username("github", "ada", false),
        ];

        let normalized = normalize_identities(&input);

        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].value, "ada@example.com");
        assert!(normalized[0].verified);
        assert_eq!(normalized[1].value, "ada");
    }

    #[tokio::test]
    async fn test_find_member_prefers_platform_username() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let tenant = Uuid::new_v4();

        let by_username =
            member_with(&mut conn, tenant, &[MemberIdentity::username("github", "ada", true)]).await;
        let by_email = member_with(
            &mut conn,
            tenant,
            &[MemberIdentity::email("slack", "ada@example.com", true)],
        )
        .await;

        let incoming = vec![
            MemberIdentity::email("github", "ada@example.com", true),
            MemberIdentity::username("github", "ada", true),
        ];
        let found = find_member_for(&mut conn, tenant, "github", &incoming).await.unwrap();
        assert_eq!(found, Some(by_username));

        let email_only = vec![MemberIdentity::email("github", "ada@example.com", true)];
        let found = find_member_for(&mut conn, tenant, "github", &email_only).await.unwrap();
        assert_eq!(found, Some(by_email));

        let other_tenant = find_member_for(&mut conn, Uuid::new_v4(), "github", &incoming)
            .await
            .unwrap();
        assert_eq!(other_tenant, None);
    }

    #[tokio::test]
    async fn test_find_member_matches_unverified_platform_username() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let tenant = Uuid::new_v4();

        let member =
            member_with(&mut conn, tenant, &[MemberIdentity::username("github", "ada", false)]).await;

        let incoming = vec![MemberIdentity::username("github", "ada", false)];
        let found = find_member_for(&mut conn, tenant, "github", &incoming).await.unwrap();
        assert_eq!(found, Some(member));

        // other platforms still need a verified match
        let found = find_member_for(&mut conn, tenant, "slack", &incoming).await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_weak_identity_owned_elsewhere_is_left_out() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let tenant = Uuid::new_v4();

        let other =
            member_with(&mut conn, tenant, &[MemberIdentity::email("github", "x@y.io", true)]).await;
        let owner =
            member_with(&mut conn, tenant, &[MemberIdentity::username("github", "ada", true)]).await;

        let weak = vec![
            MemberIdentity::email("github", "x@y.io", false),
            MemberIdentity::username("twitter", "ada_tw", false),
        ];
        let outcome = reconcile_identities(&mut conn, tenant, Some(owner), &[], &weak)
            .await
            .unwrap();

        assert_eq!(outcome.to_attach.len(), 1);
        assert_eq!(outcome.to_attach[0].value, "ada_tw");
        assert!(outcome.to_attach[0].verified);
        assert_eq!(outcome.collisions.len(), 1);
        assert_eq!(outcome.collisions[0].1, other);
    }

    #[tokio::test]
    async fn test_colliding_strong_identity_becomes_hint() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let tenant = Uuid::new_v4();

        let other =
            member_with(&mut conn, tenant, &[MemberIdentity::email("github", "x@y.io", true)]).await;
        let owner = member_with(&mut conn, tenant, &[MemberIdentity::username("github", "ada", false)])
            .await;

        let strong = vec![
            MemberIdentity::email("github", "x@y.io", true),
            MemberIdentity::username("github", "ada", true),
        ];
        let outcome = reconcile_identities(&mut conn, tenant, Some(owner), &strong, &[])
            .await
            .unwrap();

        assert_eq!(outcome.to_attach, vec![MemberIdentity::email("github", "x@y.io", false)]);
        assert_eq!(outcome.to_verify, vec![MemberIdentity::username("github", "ada", true)]);
        assert_eq!(outcome.collisions, vec![(MemberIdentity::email("github", "x@y.io", true), other)]);
    }
}
