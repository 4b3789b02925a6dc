//! Integration result rows and their state transitions
//!
//! State changes are single conditional UPDATEs so that concurrent workers
//! (or a redelivered queue message) can never both claim the same result.

use cdp_common::events::ResultState;
use cdp_common::time::{fmt_ts, now, parse_opt_ts, parse_ts};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{json_text, parse_opt_uuid, parse_uuid};
use crate::error::SinkResult;
use crate::types::{IntegrationResult, NewResult};

const RESULT_COLUMNS: &str = "id, tenant_id, integration_id, platform, state, data, retries, \
     delayed_until, error, created_at, updated_at, processed_at";

fn result_from_row(row: &SqliteRow) -> SinkResult<IntegrationResult> {
    let id: String = row.get("id");
    let tenant_id: String = row.get("tenant_id");
    let state: String = row.get("state");
    let data: String = row.get("data");
    let error: Option<String> = row.get("error");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(IntegrationResult {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        integration_id: parse_opt_uuid(row.get("integration_id"))?,
        platform: row.get("platform"),
        state: state.parse()?,
        data: serde_json::from_str(&data)?,
        retries: row.get("retries"),
        delayed_until: parse_opt_ts(row.get("delayed_until"))?,
        error: error.as_deref().map(serde_json::from_str).transpose()?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        processed_at: parse_opt_ts(row.get("processed_at"))?,
    })
}

/// Store a new raw fact in PENDING state
pub async fn insert_result(pool: &SqlitePool, result: &NewResult) -> SinkResult<Uuid> {
    let id = Uuid::new_v4();
    let ts = fmt_ts(&now());
    sqlx::query(&format!(
        "INSERT INTO integration_results ({}) VALUES (?, ?, ?, ?, ?, ?, 0, NULL, NULL, ?, ?, NULL)",
        RESULT_COLUMNS
    ))
    .bind(id.to_string())
    .bind(result.tenant_id.to_string())
    .bind(result.integration_id.map(|id| id.to_string()))
    .bind(&result.platform)
    .bind(ResultState::Pending.as_str())
    .bind(json_text(&result.payload)?)
    .bind(&ts)
    .bind(&ts)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn find_result(pool: &SqlitePool, id: Uuid) -> SinkResult<Option<IntegrationResult>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM integration_results WHERE id = ?",
        RESULT_COLUMNS
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(result_from_row).transpose()
}

/// PENDING (or due DELAYED) → PROCESSING; false when someone else owns it
pub async fn claim_result(pool: &SqlitePool, id: Uuid) -> SinkResult<bool> {
    let ts = fmt_ts(&now());
    let result = sqlx::query(
        r#"
        UPDATE integration_results SET state = 'processing', updated_at = ?
        WHERE id = ?
          AND (state = 'pending' OR (state = 'delayed' AND delayed_until <= ?))
        "#,
    )
    .bind(&ts)
    .bind(id.to_string())
    .bind(&ts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_processed(pool: &SqlitePool, id: Uuid) -> SinkResult<()> {
    let ts = fmt_ts(&now());
    sqlx::query(
        r#"
        UPDATE integration_results
        SET state = 'processed', error = NULL, delayed_until = NULL, processed_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&ts)
    .bind(&ts)
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_delayed(
    pool: &SqlitePool,
    id: Uuid,
    retries: i64,
    delayed_until: DateTime<Utc>,
    error: &Value,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        UPDATE integration_results
        SET state = 'delayed', retries = ?, delayed_until = ?, error = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(retries)
    .bind(fmt_ts(&delayed_until))
    .bind(json_text(error)?)
    .bind(fmt_ts(&now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_error(pool: &SqlitePool, id: Uuid, retries: i64, error: &Value) -> SinkResult<()> {
    sqlx::query(
        r#"
        UPDATE integration_results
        SET state = 'error', retries = ?, delayed_until = NULL, error = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(retries)
    .bind(json_text(error)?)
    .bind(fmt_ts(&now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// DELAYED results whose delay has elapsed, oldest first
pub async fn due_delayed(pool: &SqlitePool, at: DateTime<Utc>, limit: i64) -> SinkResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM integration_results
        WHERE state = 'delayed' AND delayed_until <= ?
        ORDER BY delayed_until, id
        LIMIT ?
        "#,
    )
    .bind(fmt_ts(&at))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// Move a result from `from` back to PENDING; `reset_retries` is used by replay
pub async fn reset_to_pending(
    pool: &SqlitePool,
    id: Uuid,
    from: ResultState,
    reset_retries: bool,
) -> SinkResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE integration_results
        SET state = 'pending',
            retries = CASE WHEN ? THEN 0 ELSE retries END,
            error = CASE WHEN ? THEN NULL ELSE error END,
            delayed_until = NULL,
            updated_at = ?
        WHERE id = ? AND state = ?
        "#,
    )
    .bind(reset_retries)
    .bind(reset_retries)
    .bind(fmt_ts(&now()))
    .bind(id.to_string())
    .bind(from.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn ids_in_state(pool: &SqlitePool, state: ResultState, limit: i64) -> SinkResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM integration_results WHERE state = ? ORDER BY created_at, id LIMIT ?",
    )
    .bind(state.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// Put PROCESSING results not touched since `before` back to PENDING
///
/// Covers workers that died mid-result or failed to record the outcome.
pub async fn release_stale_processing(
    pool: &SqlitePool,
    before: DateTime<Utc>,
    limit: i64,
) -> SinkResult<Vec<Uuid>> {
    let cutoff = fmt_ts(&before);
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM integration_results
        WHERE state = 'processing' AND updated_at <= ?
        ORDER BY updated_at, id
        LIMIT ?
        "#,
    )
    .bind(&cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut released = Vec::with_capacity(ids.len());
    for id in ids {
        let result = sqlx::query(
            r#"
            UPDATE integration_results
            SET state = 'pending', delayed_until = NULL, updated_at = ?
            WHERE id = ? AND state = 'processing' AND updated_at <= ?
            "#,
        )
        .bind(fmt_ts(&now()))
        .bind(&id)
        .bind(&cutoff)
        .execute(pool)
        .await?;
        if result.rows_affected() == 1 {
            released.push(parse_uuid(&id)?);
        }
    }
    Ok(released)
}
