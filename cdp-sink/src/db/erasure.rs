//! Identities whose owners asked to be forgotten

use cdp_common::time::{fmt_ts, now};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::error::SinkResult;
use crate::types::MemberIdentity;

pub async fn record_erased(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    identity: &MemberIdentity,
) -> SinkResult<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO erased_identities (tenant_id, platform, type, value, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .bind(fmt_ts(&now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn is_erased(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    identity: &MemberIdentity,
) -> SinkResult<bool> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM erased_identities
        WHERE tenant_id = ? AND platform = ? AND type = ? AND value = ?
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(&identity.platform)
    .bind(identity.identity_type.as_str())
    .bind(&identity.value)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}
