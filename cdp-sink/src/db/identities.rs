//! Member identity rows
//!
//! The partial unique index on verified tuples makes "one verified owner per
//! tenant" a storage-level guarantee; callers check first so that a collision
//! becomes a merge suggestion instead of a constraint violation.

use cdp_common::time::{fmt_ts, now};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{bool_to_int, parse_uuid};
use crate::error::SinkResult;
use crate::types::{MemberIdentity, MemberIdentityType};

fn identity_from_row(row: &SqliteRow) -> SinkResult<MemberIdentity> {
    let identity_type: String = row.get("type");
    let verified: i64 = row.get("verified");
    Ok(MemberIdentity {
        platform: row.get("platform"),
        identity_type: identity_type.parse()?,
        value: row.get("value"),
        verified: verified != 0,
        source_id: row.get("source_id"),
    })
}

/// Owner of a verified identity tuple
pub async fn find_member_by_verified(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    platform: &str,
    identity_type: MemberIdentityType,
    value: &str,
) -> SinkResult<Option<Uuid>> {
    let member_id: Option<String> = sqlx::query_scalar(
        r#"
        SELECT member_id FROM member_identities
        WHERE tenant_id = ? AND platform = ? AND type = ? AND value = ? AND verified = 1
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(platform)
    .bind(identity_type.as_str())
    .bind(value)
    .fetch_optional(&mut *conn)
    .await?;
    member_id.as_deref().map(parse_uuid).transpose()
}

/// Owner of a platform username whatever its verified flag
///
/// Unverified rows carry no uniqueness guarantee, so a verified row wins
/// and otherwise the oldest one does.
pub async fn find_member_by_username(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    platform: &str,
    username: &str,
) -> SinkResult<Option<Uuid>> {
    let member_id: Option<String> = sqlx::query_scalar(
        r#"
        SELECT member_id FROM member_identities
        WHERE tenant_id = ? AND platform = ? AND type = 'username' AND value = ?
        ORDER BY verified DESC, created_at
        LIMIT 1
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(platform)
    .bind(username)
    .fetch_optional(&mut *conn)
    .await?;
    member_id.as_deref().map(parse_uuid).transpose()
}

/// Owner of a verified e-mail on any platform
pub async fn find_member_by_verified_email(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    email: &str,
) -> SinkResult<Option<Uuid>> {
    let member_id: Option<String> = sqlx::query_scalar(
        r#"
        SELECT member_id FROM member_identities
        WHERE tenant_id = ? AND type = 'email' AND value = ? AND verified = 1
        ORDER BY created_at
        LIMIT 1
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(email)
    .fetch_optional(&mut *conn)
    .await?;
    member_id.as_deref().map(parse_uuid).transpose()
}

/// Verified owners for every identity in `identities` that has one
pub async fn find_verified_owners(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    identities: &[MemberIdentity],
) -> SinkResult<Vec<(MemberIdentity, Uuid)>> {
    let mut owners = Vec::new();
    for identity in identities {
        if let Some(owner) = find_member_by_verified(
            conn,
            tenant_id,
            &identity.platform,
            identity.identity_type,
            &identity.value,
        )
        .await?
        {
            owners.push((identity.clone(), owner));
        }
    }
    Ok(owners)
}

pub async fn identities_for_member(
    conn: &mut SqliteConnection,
    member_id: Uuid,
) -> SinkResult<Vec<MemberIdentity>> {
    let rows = sqlx::query(
        r#"
        SELECT platform, type, value, verified, source_id
        FROM member_identities
        WHERE member_id = ?
        ORDER BY created_at, platform, type, value
        "#,
    )
    .bind(member_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(identity_from_row).collect()
}

/// Attach an identity; an identical tuple already on the member is left as is
pub async fn insert_identity(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    member_id: Uuid,
    identity: &MemberIdentity,
    integration_id: Option<Uuid>,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        INSERT INTO member_identities (
            id, member_id, tenant_id, platform, type, value, verified,
            source_id, integration_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(member_id, platform, type, value) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(member_id.to_string())
    .bind(tenant_id.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .bind(bool_to_int(identity.verified))
    .bind(&identity.source_id)
    .bind(integration_id.map(|id| id.to_string()))
    .bind(fmt_ts(&now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_identity_verified(
    conn: &mut SqliteConnection,
    member_id: Uuid,
    identity: &MemberIdentity,
    verified: bool,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        UPDATE member_identities SET verified = ?
        WHERE member_id = ? AND platform = ? AND type = ? AND value = ?
        "#,
    )
    .bind(bool_to_int(verified))
    .bind(member_id.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_identity(
    conn: &mut SqliteConnection,
    member_id: Uuid,
    identity: &MemberIdentity,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        DELETE FROM member_identities
        WHERE member_id = ? AND platform = ? AND type = ? AND value = ?
        "#,
    )
    .bind(member_id.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move one identity row between members keeping its verified flag
pub async fn move_identity(
    conn: &mut SqliteConnection,
    from: Uuid,
    to: Uuid,
    identity: &MemberIdentity,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        UPDATE member_identities SET member_id = ?
        WHERE member_id = ? AND platform = ? AND type = ? AND value = ?
        "#,
    )
    .bind(to.to_string())
    .bind(from.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
