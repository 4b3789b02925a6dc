//! Persisted toMerge / noMerge edges
//!
//! Each symmetric edge is stored as two directed rows.

use cdp_common::time::{fmt_ts, now};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::parse_uuid;
use crate::error::{SinkError, SinkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    ToMerge,
    NoMerge,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::ToMerge => "to_merge",
            EdgeKind::NoMerge => "no_merge",
        }
    }

    fn parse(raw: &str) -> SinkResult<Self> {
        match raw {
            "to_merge" => Ok(EdgeKind::ToMerge),
            "no_merge" => Ok(EdgeKind::NoMerge),
            other => Err(SinkError::Internal(format!("Unknown merge edge kind: {}", other))),
        }
    }
}

/// Directed edge rows touching any of `members`
pub async fn edges_touching(
    conn: &mut SqliteConnection,
    members: &[Uuid],
) -> SinkResult<Vec<(Uuid, Uuid, EdgeKind)>> {
    if members.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; members.len()].join(", ");
    let sql = format!(
        "SELECT member_id, other_member_id, kind FROM member_merge_edges \
         WHERE member_id IN ({0}) OR other_member_id IN ({0}) \
         ORDER BY member_id, other_member_id, kind",
        placeholders
    );
    let mut query = sqlx::query(&sql);
    for _ in 0..2 {
        for member in members {
            query = query.bind(member.to_string());
        }
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| -> SinkResult<(Uuid, Uuid, EdgeKind)> {
            let a: String = row.get("member_id");
            let b: String = row.get("other_member_id");
            let kind: String = row.get("kind");
            Ok((parse_uuid(&a)?, parse_uuid(&b)?, EdgeKind::parse(&kind)?))
        })
        .collect()
}

/// Replace every edge touching `members` with `edges`
pub async fn replace_edges_touching(
    conn: &mut SqliteConnection,
    members: &[Uuid],
    edges: &[(Uuid, Uuid, EdgeKind)],
) -> SinkResult<()> {
    for member in members {
        sqlx::query("DELETE FROM member_merge_edges WHERE member_id = ? OR other_member_id = ?")
            .bind(member.to_string())
            .bind(member.to_string())
            .execute(&mut *conn)
            .await?;
    }
    let ts = fmt_ts(&now());
    for (a, b, kind) in edges {
        sqlx::query(
            "INSERT OR IGNORE INTO member_merge_edges (member_id, other_member_id, kind, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(a.to_string())
        .bind(b.to_string())
        .bind(kind.as_str())
        .bind(&ts)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
