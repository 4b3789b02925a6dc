//! Member rows

use cdp_common::time::{fmt_ts, now, parse_opt_ts, parse_ts};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{json_text, parse_uuid};
use crate::error::SinkResult;
use crate::types::{Attributes, Member, Reach};

const MEMBER_COLUMNS: &str = "id, tenant_id, display_name, emails, joined_at, score, reach, \
     attributes, manually_changed_fields, enrichment_last_tried_at, \
     enrichment_last_updated_at, created_at, updated_at";

/// Fields a member update may change; `None` leaves the column alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberChanges {
    pub display_name: Option<String>,
    pub emails: Option<Vec<String>>,
    pub joined_at: Option<DateTime<Utc>>,
    pub reach: Option<Reach>,
    pub attributes: Option<Attributes>,
}

impl MemberChanges {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.emails.is_none()
            && self.joined_at.is_none()
            && self.reach.is_none()
            && self.attributes.is_none()
    }
}

fn member_from_row(row: &SqliteRow) -> SinkResult<Member> {
    let id: String = row.get("id");
    let tenant_id: String = row.get("tenant_id");
    let emails: String = row.get("emails");
    let joined_at: String = row.get("joined_at");
    let reach: String = row.get("reach");
    let attributes: String = row.get("attributes");
    let manual: String = row.get("manually_changed_fields");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Member {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        display_name: row.get("display_name"),
        emails: serde_json::from_str(&emails)?,
        joined_at: parse_ts(&joined_at)?,
        score: row.get("score"),
        reach: serde_json::from_str(&reach)?,
        attributes: serde_json::from_str(&attributes)?,
        manually_changed_fields: serde_json::from_str(&manual)?,
        enrichment_last_tried_at: parse_opt_ts(row.get("enrichment_last_tried_at"))?,
        enrichment_last_updated_at: parse_opt_ts(row.get("enrichment_last_updated_at"))?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

pub async fn insert_member(conn: &mut SqliteConnection, member: &Member) -> SinkResult<()> {
    sqlx::query(
        r#"
        INSERT INTO members (
            id, tenant_id, display_name, emails, joined_at, score, reach,
            attributes, manually_changed_fields, enrichment_last_tried_at,
            enrichment_last_updated_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(member.id.to_string())
    .bind(member.tenant_id.to_string())
    .bind(&member.display_name)
    .bind(json_text(&member.emails)?)
    .bind(fmt_ts(&member.joined_at))
    .bind(member.score)
    .bind(json_text(&member.reach)?)
    .bind(json_text(&member.attributes)?)
    .bind(json_text(&member.manually_changed_fields)?)
    .bind(member.enrichment_last_tried_at.as_ref().map(fmt_ts))
    .bind(member.enrichment_last_updated_at.as_ref().map(fmt_ts))
    .bind(fmt_ts(&member.created_at))
    .bind(fmt_ts(&member.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn find_member(conn: &mut SqliteConnection, id: Uuid) -> SinkResult<Option<Member>> {
    let row = sqlx::query(&format!("SELECT {} FROM members WHERE id = ?", MEMBER_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(member_from_row).transpose()
}

/// Apply `changes`; returns false when there was nothing to write
pub async fn update_member(
    conn: &mut SqliteConnection,
    id: Uuid,
    changes: &MemberChanges,
) -> SinkResult<bool> {
    if changes.is_empty() {
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE members SET
            display_name = COALESCE(?, display_name),
            emails = COALESCE(?, emails),
            joined_at = COALESCE(?, joined_at),
            reach = COALESCE(?, reach),
            attributes = COALESCE(?, attributes),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&changes.display_name)
    .bind(changes.emails.as_ref().map(json_text).transpose()?)
    .bind(changes.joined_at.as_ref().map(fmt_ts))
    .bind(changes.reach.as_ref().map(json_text).transpose()?)
    .bind(changes.attributes.as_ref().map(json_text).transpose()?)
    .bind(fmt_ts(&now()))
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

/// Delete a member; dependents cascade through foreign keys
pub async fn delete_member(conn: &mut SqliteConnection, id: Uuid) -> SinkResult<bool> {
    let id = id.to_string();
    sqlx::query("DELETE FROM member_merge_edges WHERE member_id = ? OR other_member_id = ?")
        .bind(&id)
        .bind(&id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM members WHERE id = ?")
        .bind(&id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Members whose last enrichment attempt is missing or older than `tried_before`
pub async fn list_members_for_enrichment(
    pool: &SqlitePool,
    tried_before: DateTime<Utc>,
    limit: i64,
) -> SinkResult<Vec<Member>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM members \
         WHERE enrichment_last_tried_at IS NULL OR enrichment_last_tried_at < ? \
         ORDER BY COALESCE(enrichment_last_tried_at, '') ASC, created_at ASC \
         LIMIT ?",
        MEMBER_COLUMNS
    ))
    .bind(fmt_ts(&tried_before))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(member_from_row).collect()
}

pub async fn touch_enrichment(
    conn: &mut SqliteConnection,
    id: Uuid,
    updated: bool,
) -> SinkResult<()> {
    let ts = fmt_ts(&now());
    sqlx::query(
        r#"
        UPDATE members SET
            enrichment_last_tried_at = ?,
            enrichment_last_updated_at = CASE WHEN ? THEN ? ELSE enrichment_last_updated_at END
        WHERE id = ?
        "#,
    )
    .bind(&ts)
    .bind(updated)
    .bind(&ts)
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record a hand edit so later merges leave the field alone
pub async fn mark_manually_changed(
    conn: &mut SqliteConnection,
    id: Uuid,
    field: &str,
) -> SinkResult<()> {
    if let Some(member) = find_member(conn, id).await? {
        let mut fields = member.manually_changed_fields;
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
            sqlx::query("UPDATE members SET manually_changed_fields = ? WHERE id = ?")
                .bind(json_text(&fields)?)
                .bind(id.to_string())
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

/// Re-point tag, task and note links; links already on `to` are dropped
pub async fn move_member_links(conn: &mut SqliteConnection, from: Uuid, to: Uuid) -> SinkResult<()> {
    for table in ["member_tags", "member_tasks", "member_notes"] {
        sqlx::query(&format!(
            "UPDATE OR IGNORE {} SET member_id = ? WHERE member_id = ?",
            table
        ))
        .bind(to.to_string())
        .bind(from.to_string())
        .execute(&mut *conn)
        .await?;
        sqlx::query(&format!("DELETE FROM {} WHERE member_id = ?", table))
            .bind(from.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Audit row for a completed merge
pub async fn record_merge_action(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    primary_id: Uuid,
    secondary_id: Uuid,
) -> SinkResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO merge_actions (id, tenant_id, primary_id, secondary_id, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .bind(primary_id.to_string())
    .bind(secondary_id.to_string())
    .bind(fmt_ts(&now()))
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn count_merge_actions(conn: &mut SqliteConnection, primary_id: Uuid) -> SinkResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM merge_actions WHERE primary_id = ?")
        .bind(primary_id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub async fn add_tag(conn: &mut SqliteConnection, member_id: Uuid, tag_id: &str) -> SinkResult<()> {
    sqlx::query("INSERT OR IGNORE INTO member_tags (member_id, tag_id) VALUES (?, ?)")
        .bind(member_id.to_string())
        .bind(tag_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_tags(conn: &mut SqliteConnection, member_id: Uuid) -> SinkResult<Vec<String>> {
    let tags = sqlx::query_scalar::<_, String>(
        "SELECT tag_id FROM member_tags WHERE member_id = ? ORDER BY tag_id",
    )
    .bind(member_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_tables;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_tables(&pool).await.unwrap();
        pool
    }

    fn sample(tenant: Uuid) -> Member {
        let ts = now();
        let mut attributes = Attributes::new();
        attributes.insert("location".into(), json!({ "github": "Lisbon", "default": "Lisbon" }));
        Member {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            display_name: Some("Ada".into()),
            emails: vec!["ada@example.com".into()],
            joined_at: ts,
            score: None,
            reach: Reach::from([("total".to_string(), -1)]),
            attributes,
            manually_changed_fields: vec![],
            enrichment_last_tried_at: None,
            enrichment_last_updated_at: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_member() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let member = sample(Uuid::new_v4());
        insert_member(&mut conn, &member).await.unwrap();

        let loaded = find_member(&mut conn, member.id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("Ada"));
        assert_eq!(loaded.attributes, member.attributes);
        assert_eq!(loaded.reach.get("total"), Some(&-1));
    }

    #[tokio::test]
    async fn test_empty_update_is_skipped() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let member = sample(Uuid::new_v4());
        insert_member(&mut conn, &member).await.unwrap();

        assert!(!update_member(&mut conn, member.id, &MemberChanges::default()).await.unwrap());

        let changes = MemberChanges {
            display_name: Some("Ada L.".into()),
            ..Default::default()
        };
        assert!(update_member(&mut conn, member.id, &changes).await.unwrap());
        let loaded = find_member(&mut conn, member.id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("Ada L."));
        assert_eq!(loaded.emails, member.emails);
    }

    #[tokio::test]
    async fn test_members_due_for_enrichment() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let fresh = sample(Uuid::new_v4());
        let stale = sample(Uuid::new_v4());
        insert_member(&mut conn, &fresh).await.unwrap();
        insert_member(&mut conn, &stale).await.unwrap();
        touch_enrichment(&mut conn, fresh.id, false).await.unwrap();
        drop(conn);

        let due = list_members_for_enrichment(&pool, now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, stale.id);
    }
}
