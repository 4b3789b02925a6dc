//! Per-source enrichment cache

use cdp_common::time::{fmt_ts, now, parse_ts};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{json_text, parse_uuid};
use crate::error::SinkResult;

/// Last raw payload fetched from one provider for one member
///
/// `data` is None when the provider was asked and had nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentCacheRow {
    pub member_id: Uuid,
    pub source: String,
    pub data: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl EnrichmentCacheRow {
    pub fn is_obsolete(&self, ttl: chrono::Duration, at: DateTime<Utc>) -> bool {
        self.updated_at + ttl < at
    }
}

fn cache_from_row(row: &SqliteRow) -> SinkResult<EnrichmentCacheRow> {
    let member_id: String = row.get("member_id");
    let data: Option<String> = row.get("data");
    let updated_at: String = row.get("updated_at");
    Ok(EnrichmentCacheRow {
        member_id: parse_uuid(&member_id)?,
        source: row.get("source"),
        data: data.as_deref().map(serde_json::from_str).transpose()?,
        updated_at: parse_ts(&updated_at)?,
    })
}

pub async fn find_cache(
    conn: &mut SqliteConnection,
    member_id: Uuid,
    source: &str,
) -> SinkResult<Option<EnrichmentCacheRow>> {
    let row = sqlx::query(
        "SELECT member_id, source, data, updated_at FROM enrichment_cache WHERE member_id = ? AND source = ?",
    )
    .bind(member_id.to_string())
    .bind(source)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(cache_from_row).transpose()
}

pub async fn caches_for_member(
    conn: &mut SqliteConnection,
    member_id: Uuid,
) -> SinkResult<Vec<EnrichmentCacheRow>> {
    let rows = sqlx::query(
        "SELECT member_id, source, data, updated_at FROM enrichment_cache WHERE member_id = ? ORDER BY source",
    )
    .bind(member_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(cache_from_row).collect()
}

/// Insert or replace a cache entry, refreshing its timestamp
pub async fn upsert_cache(
    conn: &mut SqliteConnection,
    member_id: Uuid,
    source: &str,
    data: Option<&Value>,
) -> SinkResult<()> {
    let ts = fmt_ts(&now());
    sqlx::query(
        r#"
        INSERT INTO enrichment_cache (member_id, source, data, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(member_id, source) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
        "#,
    )
    .bind(member_id.to_string())
    .bind(source)
    .bind(data.map(json_text).transpose()?)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Test support and operator tooling: backdate an entry
pub async fn set_cache_updated_at(
    conn: &mut SqliteConnection,
    member_id: Uuid,
    source: &str,
    updated_at: DateTime<Utc>,
) -> SinkResult<()> {
    sqlx::query("UPDATE enrichment_cache SET updated_at = ? WHERE member_id = ? AND source = ?")
        .bind(fmt_ts(&updated_at))
        .bind(member_id.to_string())
        .bind(source)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
