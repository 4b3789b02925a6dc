//! Tenant attribute schema and platform priority

use cdp_common::time::{fmt_ts, now};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{bool_to_int, json_text};
use crate::attributes::{AttributeSetting, AttributeType};
use crate::error::SinkResult;

/// Platform priority used to pick attribute defaults; None when never configured
pub async fn priority_array(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
) -> SinkResult<Option<Vec<String>>> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT attribute_priority FROM tenant_settings WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    raw.as_deref()
        .map(serde_json::from_str::<Vec<String>>)
        .transpose()
        .map_err(Into::into)
}

pub async fn set_priority_array(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    priority: &[String],
) -> SinkResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_settings (tenant_id, attribute_priority) VALUES (?, ?)
        ON CONFLICT(tenant_id) DO UPDATE SET attribute_priority = excluded.attribute_priority
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(json_text(priority)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn attribute_settings(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
) -> SinkResult<Vec<AttributeSetting>> {
    let rows = sqlx::query(
        "SELECT name, label, type, options, can_delete, show FROM member_attribute_settings \
         WHERE tenant_id = ? ORDER BY created_at, name",
    )
    .bind(tenant_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> SinkResult<AttributeSetting> {
            let attribute_type: String = row.get("type");
            let options: String = row.get("options");
            let can_delete: i64 = row.get("can_delete");
            let show: i64 = row.get("show");
            Ok(AttributeSetting {
                name: row.get("name"),
                label: row.get("label"),
                attribute_type: attribute_type.parse::<AttributeType>()?,
                options: serde_json::from_str(&options)?,
                can_delete: can_delete != 0,
                show: show != 0,
            })
        })
        .collect()
}

/// Create a schema entry; an existing entry with the same name is kept untouched
pub async fn insert_attribute_setting(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    setting: &AttributeSetting,
) -> SinkResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO member_attribute_settings (
            id, tenant_id, name, label, type, options, can_delete, show, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tenant_id, name) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(tenant_id.to_string())
    .bind(&setting.name)
    .bind(&setting.label)
    .bind(setting.attribute_type.as_str())
    .bind(json_text(&setting.options)?)
    .bind(bool_to_int(setting.can_delete))
    .bind(bool_to_int(setting.show))
    .bind(fmt_ts(&now()))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
