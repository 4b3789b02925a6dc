//! Activity rows
//!
//! (member_id, timestamp, type, platform) is unique; it is the key that keeps
//! merges and replays from duplicating activities.

use cdp_common::time::{fmt_ts, now, parse_ts};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{bool_to_int, json_text, parse_opt_uuid, parse_uuid};
use crate::error::SinkResult;
use crate::types::Activity;

const ACTIVITY_COLUMNS: &str = "id, tenant_id, member_id, object_member_id, object_member_username, \
     platform, type, timestamp, source_id, source_parent_id, username, attributes, sentiment, \
     body, title, channel, url, score, is_contribution, organization_id";

fn activity_from_row(row: &SqliteRow) -> SinkResult<Activity> {
    let id: String = row.get("id");
    let tenant_id: String = row.get("tenant_id");
    let member_id: String = row.get("member_id");
    let timestamp: String = row.get("timestamp");
    let attributes: String = row.get("attributes");
    let sentiment: Option<String> = row.get("sentiment");
    let is_contribution: i64 = row.get("is_contribution");

    Ok(Activity {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        member_id: parse_uuid(&member_id)?,
        object_member_id: parse_opt_uuid(row.get("object_member_id"))?,
        object_member_username: row.get("object_member_username"),
        platform: row.get("platform"),
        activity_type: row.get("type"),
        timestamp: parse_ts(&timestamp)?,
        source_id: row.get("source_id"),
        source_parent_id: row.get("source_parent_id"),
        username: row.get("username"),
        attributes: serde_json::from_str(&attributes)?,
        sentiment: sentiment.as_deref().map(serde_json::from_str).transpose()?,
        body: row.get("body"),
        title: row.get("title"),
        channel: row.get("channel"),
        url: row.get("url"),
        score: row.get("score"),
        is_contribution: is_contribution != 0,
        organization_id: parse_opt_uuid(row.get("organization_id"))?,
    })
}

/// Look up a previously stored copy of an incoming activity
pub async fn find_existing(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    timestamp: &DateTime<Utc>,
    source_id: &str,
    platform: &str,
    activity_type: &str,
    channel: Option<&str>,
) -> SinkResult<Option<Activity>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM activities \
         WHERE tenant_id = ? AND timestamp = ? AND source_id = ? AND platform = ? \
           AND type = ? AND channel IS ?",
        ACTIVITY_COLUMNS
    ))
    .bind(tenant_id.to_string())
    .bind(fmt_ts(timestamp))
    .bind(source_id)
    .bind(platform)
    .bind(activity_type)
    .bind(channel)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(activity_from_row).transpose()
}

pub async fn find_activity(conn: &mut SqliteConnection, id: Uuid) -> SinkResult<Option<Activity>> {
    let row = sqlx::query(&format!("SELECT {} FROM activities WHERE id = ?", ACTIVITY_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(activity_from_row).transpose()
}

/// Insert unless the member already has an activity with the same dedup key
pub async fn insert_activity(conn: &mut SqliteConnection, activity: &Activity) -> SinkResult<bool> {
    let ts = fmt_ts(&now());
    let result = sqlx::query(&format!(
        "INSERT INTO activities ({}, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(member_id, timestamp, type, platform) DO NOTHING",
        ACTIVITY_COLUMNS
    ))
    .bind(activity.id.to_string())
    .bind(activity.tenant_id.to_string())
    .bind(activity.member_id.to_string())
    .bind(activity.object_member_id.map(|id| id.to_string()))
    .bind(&activity.object_member_username)
    .bind(&activity.platform)
    .bind(&activity.activity_type)
    .bind(fmt_ts(&activity.timestamp))
    .bind(&activity.source_id)
    .bind(&activity.source_parent_id)
    .bind(&activity.username)
    .bind(json_text(&activity.attributes)?)
    .bind(activity.sentiment.as_ref().map(json_text).transpose()?)
    .bind(&activity.body)
    .bind(&activity.title)
    .bind(&activity.channel)
    .bind(&activity.url)
    .bind(activity.score)
    .bind(bool_to_int(activity.is_contribution))
    .bind(activity.organization_id.map(|id| id.to_string()))
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Overwrite the mutable content of a stored activity
pub async fn update_activity(conn: &mut SqliteConnection, activity: &Activity) -> SinkResult<()> {
    sqlx::query(
        r#"
        UPDATE activities SET
            object_member_id = ?,
            object_member_username = ?,
            source_parent_id = ?,
            username = ?,
            attributes = ?,
            sentiment = ?,
            body = ?,
            title = ?,
            url = ?,
            score = ?,
            is_contribution = ?,
            organization_id = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(activity.object_member_id.map(|id| id.to_string()))
    .bind(&activity.object_member_username)
    .bind(&activity.source_parent_id)
    .bind(&activity.username)
    .bind(json_text(&activity.attributes)?)
    .bind(activity.sentiment.as_ref().map(json_text).transpose()?)
    .bind(&activity.body)
    .bind(&activity.title)
    .bind(&activity.url)
    .bind(activity.score)
    .bind(bool_to_int(activity.is_contribution))
    .bind(activity.organization_id.map(|id| id.to_string()))
    .bind(fmt_ts(&now()))
    .bind(activity.id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_activity(conn: &mut SqliteConnection, id: Uuid) -> SinkResult<()> {
    sqlx::query("DELETE FROM activities WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn activities_for_member(
    conn: &mut SqliteConnection,
    member_id: Uuid,
) -> SinkResult<Vec<Activity>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM activities WHERE member_id = ? ORDER BY timestamp, platform, type",
        ACTIVITY_COLUMNS
    ))
    .bind(member_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(activity_from_row).collect()
}

pub async fn set_activity_member(
    conn: &mut SqliteConnection,
    id: Uuid,
    member_id: Uuid,
) -> SinkResult<()> {
    sqlx::query("UPDATE activities SET member_id = ?, updated_at = ? WHERE id = ?")
        .bind(member_id.to_string())
        .bind(fmt_ts(&now()))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Re-point activities that name `from` as their object member
pub async fn move_object_member(
    conn: &mut SqliteConnection,
    from: Uuid,
    to: Uuid,
) -> SinkResult<u64> {
    let result = sqlx::query("UPDATE activities SET object_member_id = ? WHERE object_member_id = ?")
        .bind(to.to_string())
        .bind(from.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn clear_object_member(conn: &mut SqliteConnection, member_id: Uuid) -> SinkResult<()> {
    sqlx::query("UPDATE activities SET object_member_id = NULL WHERE object_member_id = ?")
        .bind(member_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}
