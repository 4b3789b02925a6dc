//! Organization, organization identity and work-experience rows

use cdp_common::time::{fmt_ts, now, parse_ts};
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{bool_to_int, json_text, parse_uuid};
use crate::error::{SinkError, SinkResult};
use crate::types::{
    MemberOrganization, Organization, OrganizationFields, OrganizationIdentity,
    OrganizationIdentityType,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

fn organization_from_row(row: &SqliteRow) -> SinkResult<Organization> {
    let id: String = row.get("id");
    let tenant_id: String = row.get("tenant_id");
    let fields: String = row.get("fields");
    let attributes: String = row.get("attributes");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Organization {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        display_name: row.get("display_name"),
        fields: serde_json::from_str(&fields)?,
        attributes: serde_json::from_str(&attributes)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn org_identity_from_row(row: &SqliteRow) -> SinkResult<OrganizationIdentity> {
    let identity_type: String = row.get("type");
    let verified: i64 = row.get("verified");
    Ok(OrganizationIdentity {
        platform: row.get("platform"),
        identity_type: identity_type.parse()?,
        value: row.get("value"),
        verified: verified != 0,
        source: row.get("source"),
    })
}

fn parse_date(raw: Option<String>) -> SinkResult<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, DATE_FORMAT)
            .map_err(|e| SinkError::Internal(format!("Invalid stored date '{}': {}", s, e)))
    })
    .transpose()
}

fn fmt_date(date: &Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format(DATE_FORMAT).to_string())
}

fn member_org_from_row(row: &SqliteRow) -> SinkResult<MemberOrganization> {
    let id: String = row.get("id");
    let member_id: String = row.get("member_id");
    let organization_id: String = row.get("organization_id");
    Ok(MemberOrganization {
        id: parse_uuid(&id)?,
        member_id: parse_uuid(&member_id)?,
        organization_id: parse_uuid(&organization_id)?,
        title: row.get("title"),
        date_start: parse_date(row.get("date_start"))?,
        date_end: parse_date(row.get("date_end"))?,
        source: row.get("source"),
    })
}

// ============================================================================
// Organizations
// ============================================================================

pub async fn insert_organization(
    conn: &mut SqliteConnection,
    organization: &Organization,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        INSERT INTO organizations (id, tenant_id, display_name, fields, attributes, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(organization.id.to_string())
    .bind(organization.tenant_id.to_string())
    .bind(&organization.display_name)
    .bind(json_text(&organization.fields)?)
    .bind(json_text(&organization.attributes)?)
    .bind(fmt_ts(&organization.created_at))
    .bind(fmt_ts(&organization.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn find_organization(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> SinkResult<Option<Organization>> {
    let row = sqlx::query(
        "SELECT id, tenant_id, display_name, fields, attributes, created_at, updated_at \
         FROM organizations WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(organization_from_row).transpose()
}

pub async fn update_organization(
    conn: &mut SqliteConnection,
    organization: &Organization,
) -> SinkResult<()> {
    sqlx::query(
        "UPDATE organizations SET display_name = ?, fields = ?, attributes = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&organization.display_name)
    .bind(json_text(&organization.fields)?)
    .bind(json_text(&organization.attributes)?)
    .bind(fmt_ts(&now()))
    .bind(organization.id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ============================================================================
// Organization identities
// ============================================================================

pub async fn identities_for_organization(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
) -> SinkResult<Vec<OrganizationIdentity>> {
    let rows = sqlx::query(
        "SELECT platform, type, value, verified, source FROM organization_identities \
         WHERE organization_id = ? ORDER BY created_at, platform, type, value",
    )
    .bind(organization_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(org_identity_from_row).collect()
}

/// Organization owning a verified identity tuple
pub async fn find_by_verified_identity(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    platform: &str,
    identity_type: OrganizationIdentityType,
    value: &str,
) -> SinkResult<Option<Uuid>> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT organization_id FROM organization_identities \
         WHERE tenant_id = ? AND platform = ? AND type = ? AND value = ? AND verified = 1",
    )
    .bind(tenant_id.to_string())
    .bind(platform)
    .bind(identity_type.as_str())
    .bind(value)
    .fetch_optional(&mut *conn)
    .await?;
    id.as_deref().map(parse_uuid).transpose()
}

/// Verified domain lookup ignoring the platform the domain was learned from
///
/// Primary domains win over alternative ones.
pub async fn find_by_verified_domain(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    domain: &str,
) -> SinkResult<Option<Uuid>> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT organization_id FROM organization_identities \
         WHERE tenant_id = ? AND type IN ('primary-domain', 'alternative-domain') \
         AND value = ? AND verified = 1 \
         ORDER BY type = 'alternative-domain', created_at LIMIT 1",
    )
    .bind(tenant_id.to_string())
    .bind(domain)
    .fetch_optional(&mut *conn)
    .await?;
    id.as_deref().map(parse_uuid).transpose()
}

/// Any organization carrying the (type, value) pair, verified or not
pub async fn find_by_identity_value(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    identity_type: OrganizationIdentityType,
    value: &str,
) -> SinkResult<Option<Uuid>> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT organization_id FROM organization_identities \
         WHERE tenant_id = ? AND type = ? AND value = ? \
         ORDER BY verified DESC, created_at LIMIT 1",
    )
    .bind(tenant_id.to_string())
    .bind(identity_type.as_str())
    .bind(value)
    .fetch_optional(&mut *conn)
    .await?;
    id.as_deref().map(parse_uuid).transpose()
}

pub async fn insert_org_identity(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    organization_id: Uuid,
    identity: &OrganizationIdentity,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        INSERT INTO organization_identities (
            id, organization_id, tenant_id, platform, type, value, verified, source, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(organization_id, platform, type, value) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(organization_id.to_string())
    .bind(tenant_id.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .bind(bool_to_int(identity.verified))
    .bind(&identity.source)
    .bind(fmt_ts(&now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_org_identity_verified(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
    identity: &OrganizationIdentity,
    verified: bool,
) -> SinkResult<()> {
    sqlx::query(
        "UPDATE organization_identities SET verified = ? \
         WHERE organization_id = ? AND platform = ? AND type = ? AND value = ?",
    )
    .bind(bool_to_int(verified))
    .bind(organization_id.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ============================================================================
// Member organizations (work experience)
// ============================================================================

pub async fn insert_member_organization(
    conn: &mut SqliteConnection,
    row: &MemberOrganization,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        INSERT INTO member_organizations (
            id, member_id, organization_id, title, date_start, date_end, source, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.id.to_string())
    .bind(row.member_id.to_string())
    .bind(row.organization_id.to_string())
    .bind(&row.title)
    .bind(fmt_date(&row.date_start))
    .bind(fmt_date(&row.date_end))
    .bind(&row.source)
    .bind(fmt_ts(&now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Active (not deleted) work experiences of a member
pub async fn member_organizations(
    conn: &mut SqliteConnection,
    member_id: Uuid,
) -> SinkResult<Vec<MemberOrganization>> {
    let rows = sqlx::query(
        "SELECT id, member_id, organization_id, title, date_start, date_end, source \
         FROM member_organizations WHERE member_id = ? AND deleted_at IS NULL \
         ORDER BY COALESCE(date_start, ''), created_at",
    )
    .bind(member_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(member_org_from_row).collect()
}

/// Whether the member was ever linked to the organization, deleted links included
pub async fn was_ever_linked(
    conn: &mut SqliteConnection,
    member_id: Uuid,
    organization_id: Uuid,
) -> SinkResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM member_organizations WHERE member_id = ? AND organization_id = ?",
    )
    .bind(member_id.to_string())
    .bind(organization_id.to_string())
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

pub async fn update_member_organization(
    conn: &mut SqliteConnection,
    row: &MemberOrganization,
) -> SinkResult<()> {
    sqlx::query(
        "UPDATE member_organizations SET member_id = ?, title = ?, date_start = ?, date_end = ?, source = ? \
         WHERE id = ?",
    )
    .bind(row.member_id.to_string())
    .bind(&row.title)
    .bind(fmt_date(&row.date_start))
    .bind(fmt_date(&row.date_end))
    .bind(&row.source)
    .bind(row.id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn soft_delete_member_organization(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> SinkResult<()> {
    sqlx::query("UPDATE member_organizations SET deleted_at = ? WHERE id = ?")
        .bind(fmt_ts(&now()))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_member_organization(conn: &mut SqliteConnection, id: Uuid) -> SinkResult<()> {
    sqlx::query("DELETE FROM member_organizations WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ============================================================================
// Legacy organization cache
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OrganizationCacheRow {
    pub id: Uuid,
    pub name: Option<String>,
    pub website: Option<String>,
    pub fields: OrganizationFields,
}

impl OrganizationCacheRow {
    pub fn non_null_count(&self) -> usize {
        self.fields.non_null_count() + usize::from(self.name.is_some())
    }
}

pub async fn insert_cache_row(pool: &SqlitePool, row: &OrganizationCacheRow) -> SinkResult<()> {
    sqlx::query(
        "INSERT INTO organization_caches (id, name, website, fields, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(row.id.to_string())
    .bind(&row.name)
    .bind(&row.website)
    .bind(json_text(&row.fields)?)
    .bind(fmt_ts(&now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Websites that appear on more than one cache row
pub async fn duplicate_cache_websites(pool: &SqlitePool, limit: i64) -> SinkResult<Vec<String>> {
    let websites = sqlx::query_scalar::<_, String>(
        "SELECT website FROM organization_caches WHERE website IS NOT NULL \
         GROUP BY website HAVING COUNT(*) > 1 ORDER BY website LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(websites)
}

pub async fn cache_rows_for_website(
    conn: &mut SqliteConnection,
    website: &str,
) -> SinkResult<Vec<OrganizationCacheRow>> {
    let rows = sqlx::query(
        "SELECT id, name, website, fields FROM organization_caches WHERE website = ? ORDER BY created_at, id",
    )
    .bind(website)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| -> SinkResult<OrganizationCacheRow> {
            let id: String = row.get("id");
            let fields: String = row.get("fields");
            Ok(OrganizationCacheRow {
                id: parse_uuid(&id)?,
                name: row.get("name"),
                website: row.get("website"),
                fields: serde_json::from_str(&fields)?,
            })
        })
        .collect()
}

pub async fn update_cache_row(
    conn: &mut SqliteConnection,
    row: &OrganizationCacheRow,
) -> SinkResult<()> {
    sqlx::query("UPDATE organization_caches SET name = ?, fields = ? WHERE id = ?")
        .bind(&row.name)
        .bind(json_text(&row.fields)?)
        .bind(row.id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Move cache links from `from` to `to`, dropping links `to` already has
pub async fn move_cache_links(conn: &mut SqliteConnection, from: Uuid, to: Uuid) -> SinkResult<()> {
    sqlx::query(
        "UPDATE OR IGNORE organization_cache_links SET organization_cache_id = ? WHERE organization_cache_id = ?",
    )
    .bind(to.to_string())
    .bind(from.to_string())
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM organization_cache_links WHERE organization_cache_id = ?")
        .bind(from.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_cache_row(conn: &mut SqliteConnection, id: Uuid) -> SinkResult<()> {
    sqlx::query("DELETE FROM organization_caches WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn link_cache(pool: &SqlitePool, cache_id: Uuid, organization_id: Uuid) -> SinkResult<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO organization_cache_links (organization_cache_id, organization_id) VALUES (?, ?)",
    )
    .bind(cache_id.to_string())
    .bind(organization_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn cache_links(pool: &SqlitePool, cache_id: Uuid) -> SinkResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT organization_id FROM organization_cache_links WHERE organization_cache_id = ? ORDER BY organization_id",
    )
    .bind(cache_id.to_string())
    .fetch_all(pool)
    .await?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}
