//! Domain types shared by every component of the sink

use cdp_common::events::ResultState;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{SinkError, SinkResult};

/// attribute name → (platform | "default") → value
pub type Attributes = serde_json::Map<String, Value>;

/// platform → audience size, plus `total` (-1 when unknown)
pub type Reach = BTreeMap<String, i64>;

/// Platform key used for values produced by the enrichment squasher
pub const ENRICHMENT_PLATFORM: &str = "enrichment";

/// Work-experience source for manually entered rows
pub const MANUAL_SOURCE: &str = "ui";

// ============================================================================
// Identities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberIdentityType {
    Username,
    Email,
}

impl MemberIdentityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberIdentityType::Username => "username",
            MemberIdentityType::Email => "email",
        }
    }
}

impl FromStr for MemberIdentityType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "username" => Ok(MemberIdentityType::Username),
            "email" => Ok(MemberIdentityType::Email),
            other => Err(SinkError::Validation(format!("Unknown member identity type: {}", other))),
        }
    }
}

impl fmt::Display for MemberIdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (platform, type, value) fact about a member
///
/// Verified identities are strong: each verified tuple owns at most one
/// member per tenant. Unverified ones are weak hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberIdentity {
    pub platform: String,
    #[serde(rename = "type")]
    pub identity_type: MemberIdentityType,
    pub value: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub source_id: Option<String>,
}

impl MemberIdentity {
    pub fn username(platform: &str, value: &str, verified: bool) -> Self {
        Self {
            platform: platform.to_string(),
            identity_type: MemberIdentityType::Username,
            value: value.to_string(),
            verified,
            source_id: None,
        }
    }

    pub fn email(platform: &str, value: &str, verified: bool) -> Self {
        Self {
            platform: platform.to_string(),
            identity_type: MemberIdentityType::Email,
            value: value.to_string(),
            verified,
            source_id: None,
        }
    }

    /// Same tuple regardless of the verified flag
    pub fn same_tuple(&self, other: &MemberIdentity) -> bool {
        self.platform == other.platform
            && self.identity_type == other.identity_type
            && self.value == other.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrganizationIdentityType {
    PrimaryDomain,
    AlternativeDomain,
    Username,
    AffiliatedProfile,
    Email,
}

impl OrganizationIdentityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationIdentityType::PrimaryDomain => "primary-domain",
            OrganizationIdentityType::AlternativeDomain => "alternative-domain",
            OrganizationIdentityType::Username => "username",
            OrganizationIdentityType::AffiliatedProfile => "affiliated-profile",
            OrganizationIdentityType::Email => "email",
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            OrganizationIdentityType::PrimaryDomain | OrganizationIdentityType::AlternativeDomain
        )
    }

    /// Lookup order used by find-or-create: domains first
    pub fn lookup_rank(&self) -> u8 {
        match self {
            OrganizationIdentityType::PrimaryDomain => 0,
            OrganizationIdentityType::AlternativeDomain => 1,
            OrganizationIdentityType::Username => 2,
            OrganizationIdentityType::Email => 3,
            OrganizationIdentityType::AffiliatedProfile => 4,
        }
    }
}

impl FromStr for OrganizationIdentityType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary-domain" => Ok(OrganizationIdentityType::PrimaryDomain),
            "alternative-domain" => Ok(OrganizationIdentityType::AlternativeDomain),
            "username" => Ok(OrganizationIdentityType::Username),
            "affiliated-profile" => Ok(OrganizationIdentityType::AffiliatedProfile),
            "email" => Ok(OrganizationIdentityType::Email),
            other => Err(SinkError::Validation(format!(
                "Unknown organization identity type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationIdentity {
    pub platform: String,
    #[serde(rename = "type")]
    pub identity_type: OrganizationIdentityType,
    pub value: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub source: Option<String>,
}

impl OrganizationIdentity {
    pub fn primary_domain(platform: &str, domain: &str, verified: bool) -> Self {
        Self {
            platform: platform.to_string(),
            identity_type: OrganizationIdentityType::PrimaryDomain,
            value: domain.to_string(),
            verified,
            source: None,
        }
    }

    pub fn same_tuple(&self, other: &OrganizationIdentity) -> bool {
        self.platform == other.platform
            && self.identity_type == other.identity_type
            && self.value == other.value
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub display_name: Option<String>,
    pub emails: Vec<String>,
    pub joined_at: DateTime<Utc>,
    pub score: Option<i64>,
    pub reach: Reach,
    pub attributes: Attributes,
    /// Paths such as `attributes.jobTitle` edited by hand
    pub manually_changed_fields: Vec<String>,
    pub enrichment_last_tried_at: Option<DateTime<Utc>>,
    pub enrichment_last_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub member_id: Uuid,
    pub object_member_id: Option<Uuid>,
    pub object_member_username: Option<String>,
    pub platform: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub source_parent_id: Option<String>,
    pub username: Option<String>,
    pub attributes: Value,
    pub sentiment: Option<Value>,
    pub body: Option<String>,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub url: Option<String>,
    pub score: Option<i64>,
    pub is_contribution: bool,
    pub organization_id: Option<Uuid>,
}

/// Scalar organization fields; merged field-by-field, never overwritten
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationFields {
    pub description: Option<String>,
    pub logo: Option<String>,
    pub location: Option<String>,
    pub industry: Option<String>,
    pub size: Option<String>,
    pub employees: Option<i64>,
    pub founded: Option<i64>,
    pub linkedin: Option<String>,
    pub crunchbase: Option<String>,
    pub twitter: Option<String>,
    pub github: Option<String>,
}

impl OrganizationFields {
    /// Copy every field missing here from `incoming`; returns whether anything changed
    pub fn fill_missing(&mut self, incoming: &OrganizationFields) -> bool {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) -> bool {
            if slot.is_none() && value.is_some() {
                *slot = value.clone();
                true
            } else {
                false
            }
        }

        let mut changed = false;
        changed |= fill(&mut self.description, &incoming.description);
        changed |= fill(&mut self.logo, &incoming.logo);
        changed |= fill(&mut self.location, &incoming.location);
        changed |= fill(&mut self.industry, &incoming.industry);
        changed |= fill(&mut self.size, &incoming.size);
        changed |= fill(&mut self.employees, &incoming.employees);
        changed |= fill(&mut self.founded, &incoming.founded);
        changed |= fill(&mut self.linkedin, &incoming.linkedin);
        changed |= fill(&mut self.crunchbase, &incoming.crunchbase);
        changed |= fill(&mut self.twitter, &incoming.twitter);
        changed |= fill(&mut self.github, &incoming.github);
        changed
    }

    pub fn non_null_count(&self) -> usize {
        [
            self.description.is_some(),
            self.logo.is_some(),
            self.location.is_some(),
            self.industry.is_some(),
            self.size.is_some(),
            self.employees.is_some(),
            self.founded.is_some(),
            self.linkedin.is_some(),
            self.crunchbase.is_some(),
            self.twitter.is_some(),
            self.github.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub display_name: String,
    pub fields: OrganizationFields,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Member ↔ organization link, i.e. one work-experience row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberOrganization {
    pub id: Uuid,
    pub member_id: Uuid,
    pub organization_id: Uuid,
    pub title: Option<String>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub source: Option<String>,
}

// ============================================================================
// Integration results and payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationPayload {
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub fields: OrganizationFields,
    pub identities: Vec<OrganizationIdentity>,
    pub attributes: Attributes,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberPayload {
    pub display_name: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub identities: Vec<MemberIdentity>,
    pub weak_identities: Vec<MemberIdentity>,
    pub attributes: Attributes,
    pub reach: Option<Reach>,
    pub organizations: Vec<OrganizationPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    #[serde(rename = "type")]
    pub activity_type: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    #[serde(default)]
    pub source_parent_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub object_member_username: Option<String>,
    pub member: MemberPayload,
    #[serde(default)]
    pub object_member: Option<MemberPayload>,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub sentiment: Option<Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub is_contribution: Option<bool>,
}

/// Typed contents of an integration result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultPayload {
    Activity(ActivityPayload),
    MemberUpdate(MemberPayload),
    OrganizationEnrich(OrganizationPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationResult {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub integration_id: Option<Uuid>,
    pub platform: String,
    pub state: ResultState,
    pub data: Value,
    pub retries: i64,
    pub delayed_until: Option<DateTime<Utc>>,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl IntegrationResult {
    pub fn payload(&self) -> SinkResult<ResultPayload> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| SinkError::Validation(format!("Malformed result payload: {}", e)))
    }
}

/// A new raw fact as produced by an integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewResult {
    pub tenant_id: Uuid,
    pub integration_id: Option<Uuid>,
    pub platform: String,
    pub payload: ResultPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_tagging() {
        let raw = json!({
            "type": "ACTIVITY",
            "data": {
                "type": "issue-comment",
                "timestamp": "2024-01-10T10:00:00Z",
                "sourceId": "c-1",
                "member": {
                    "identities": [
                        { "platform": "github", "type": "username", "value": "octo", "verified": true }
                    ]
                }
            }
        });
        match serde_json::from_value::<ResultPayload>(raw).unwrap() {
            ResultPayload::Activity(activity) => {
                assert_eq!(activity.activity_type, "issue-comment");
                assert_eq!(activity.member.identities[0].identity_type, MemberIdentityType::Username);
                assert!(activity.object_member.is_none());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_fill_missing_never_overwrites() {
        let mut existing = OrganizationFields {
            description: Some("Old".into()),
            ..Default::default()
        };
        let incoming = OrganizationFields {
            description: Some("New".into()),
            location: Some("Berlin".into()),
            ..Default::default()
        };
        assert!(existing.fill_missing(&incoming));
        assert_eq!(existing.description.as_deref(), Some("Old"));
        assert_eq!(existing.location.as_deref(), Some("Berlin"));
        assert!(!existing.fill_missing(&incoming));
        assert_eq!(existing.non_null_count(), 2);
    }

    #[test]
    fn test_identity_lookup_rank_puts_domains_first() {
        let mut types = vec![
            OrganizationIdentityType::Username,
            OrganizationIdentityType::AlternativeDomain,
            OrganizationIdentityType::PrimaryDomain,
        ];
        types.sort_by_key(|t| t.lookup_rank());
        assert_eq!(types[0], OrganizationIdentityType::PrimaryDomain);
        assert!(types[1].is_domain());
    }
}
