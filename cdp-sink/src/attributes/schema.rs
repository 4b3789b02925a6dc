//! Per-tenant attribute schema registry

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::db;
use crate::error::{SinkError, SinkResult};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$").expect("valid email regex")
});

/// Syntactic local@domain check shared with identity normalization
pub fn is_valid_email(value: &str) -> bool {
    !value.is_empty() && EMAIL_RE.is_match(value)
}

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(-?(?:[1-9][0-9]*)?[0-9]{4})-(1[0-2]|0[1-9])-(3[01]|0[1-9]|[12][0-9])T(2[0-3]|[01][0-9]):([0-5][0-9]):([0-5][0-9])(\.[0-9]+)?(Z|[+-](?:2[0-3]|[01][0-9]):[0-5][0-9])?$",
    )
    .expect("valid date regex")
});

/// Closed set of attribute types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttributeType {
    Boolean,
    String,
    Date,
    Email,
    Url,
    Number,
    MultiSelect,
    Special,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Boolean => "boolean",
            AttributeType::String => "string",
            AttributeType::Date => "date",
            AttributeType::Email => "email",
            AttributeType::Url => "url",
            AttributeType::Number => "number",
            AttributeType::MultiSelect => "multi-select",
            AttributeType::Special => "special",
        }
    }

    /// Whether `value` is acceptable for this type
    pub fn accepts(&self, value: &Value, options: &[String]) -> bool {
        match self {
            AttributeType::Boolean => matches!(value, Value::Bool(_))
                || matches!(value.as_str(), Some("true") | Some("false")),
            AttributeType::String | AttributeType::Url => value.is_string(),
            AttributeType::Number => match value {
                Value::Number(_) => true,
                Value::String(s) => !s.trim().is_empty() && s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            AttributeType::Email => value
                .as_str()
                .map(is_valid_email)
                .unwrap_or(false),
            AttributeType::Date => match value {
                Value::Number(n) => n.as_f64().map(f64::is_finite).unwrap_or(false),
                Value::String(s) => DATE_RE.is_match(s) && is_real_datetime(s),
                _ => false,
            },
            AttributeType::MultiSelect => match value {
                Value::Array(items) => items.iter().all(|item| {
                    item.as_str()
                        .map(|s| options.iter().any(|o| o == s))
                        .unwrap_or(false)
                }),
                _ => false,
            },
            AttributeType::Special => true,
        }
    }
}

/// The pattern admits impossible calendar dates such as Feb 31
fn is_real_datetime(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(AttributeType::Boolean),
            "string" => Ok(AttributeType::String),
            "date" => Ok(AttributeType::Date),
            "email" => Ok(AttributeType::Email),
            "url" => Ok(AttributeType::Url),
            "number" => Ok(AttributeType::Number),
            "multi-select" => Ok(AttributeType::MultiSelect),
            "special" => Ok(AttributeType::Special),
            other => Err(SinkError::Validation(format!("Unknown attribute type: {}", other))),
        }
    }
}

/// One schema entry; the type never changes after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSetting {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub can_delete: bool,
    #[serde(default = "default_show")]
    pub show: bool,
}

fn default_show() -> bool {
    true
}

impl AttributeSetting {
    pub fn new(name: &str, label: &str, attribute_type: AttributeType) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            attribute_type,
            options: Vec::new(),
            can_delete: false,
            show: true,
        }
    }
}

/// name → setting lookup for one tenant
#[derive(Debug, Clone, Default)]
pub struct AttributeSchema {
    settings: HashMap<String, AttributeSetting>,
}

impl AttributeSchema {
    pub fn new(settings: impl IntoIterator<Item = AttributeSetting>) -> Self {
        Self {
            settings: settings.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub async fn load(conn: &mut SqliteConnection, tenant_id: Uuid) -> SinkResult<Self> {
        Ok(Self::new(db::settings::attribute_settings(conn, tenant_id).await?))
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSetting> {
        self.settings.get(name)
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

/// Attributes every tenant gets, shared by all integrations
pub fn default_attribute_bundle() -> Vec<AttributeSetting> {
    vec![
        AttributeSetting::new("bio", "Bio", AttributeType::String),
        AttributeSetting::new("location", "Location", AttributeType::String),
        AttributeSetting::new("jobTitle", "Job title", AttributeType::String),
        AttributeSetting::new("avatarUrl", "Avatar", AttributeType::Url),
        AttributeSetting::new("url", "Url", AttributeType::Url),
        AttributeSetting::new("company", "Company", AttributeType::String),
        AttributeSetting::new("isBot", "Bot", AttributeType::Boolean),
        AttributeSetting::new("isTeamMember", "Team member", AttributeType::Boolean),
        AttributeSetting::new("languages", "Languages", AttributeType::Special),
        AttributeSetting::new("since", "Member since", AttributeType::Date),
        AttributeSetting::new("emails", "Emails", AttributeType::Special),
        AttributeSetting::new("skills", "Skills", AttributeType::Special),
        AttributeSetting::new("yearsOfExperience", "Years of experience", AttributeType::Number),
    ]
}

/// Install `bundle` for a tenant; returns how many entries were new
pub async fn install_attribute_bundle(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    bundle: &[AttributeSetting],
) -> SinkResult<usize> {
    let mut created = 0;
    for setting in bundle {
        if db::settings::insert_attribute_setting(conn, tenant_id, setting).await? {
            created += 1;
        }
    }
    tracing::debug!(tenant_id = %tenant_id, created, "Attribute bundle installed");
    Ok(created)
}
