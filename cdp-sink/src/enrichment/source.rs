//! Provider adapter seam
//!
//! Each provider knows its own raw format; everything downstream of
//! `normalize` only sees [`NormalizedProfile`].

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SinkResult;
use crate::types::{
    Attributes, Member, MemberIdentity, MemberIdentityType, OrganizationIdentity, Reach,
};

/// One job in a provider's view of the member's career
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkExperience {
    pub organization_name: Option<String>,
    pub organization_description: Option<String>,
    pub identities: Vec<OrganizationIdentity>,
    pub title: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Provider that reported the entry
    pub source: String,
}

/// Provider data mapped onto the member model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizedProfile {
    pub identities: Vec<MemberIdentity>,
    /// attribute name → value, not yet keyed by platform
    pub attributes: Attributes,
    pub work_experiences: Vec<WorkExperience>,
    pub reach: Option<Reach>,
    /// Found by looking up one of the member's verified identities
    pub from_verified_source: bool,
}

impl NormalizedProfile {
    /// Profile handle on a social network platform, if the profile has one
    pub fn handle_on(&self, platform: &str) -> Option<&str> {
        self.identities
            .iter()
            .find(|i| i.platform == platform && i.identity_type == MemberIdentityType::Username)
            .map(|i| i.value.as_str())
    }
}

/// What a provider gets to look the member up with
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentInput {
    pub member_id: Uuid,
    pub tenant_id: Uuid,
    pub display_name: Option<String>,
    pub emails: Vec<String>,
    pub identities: Vec<MemberIdentity>,
    pub attributes: Attributes,
}

impl EnrichmentInput {
    pub fn new(member: &Member, identities: Vec<MemberIdentity>) -> Self {
        Self {
            member_id: member.id,
            tenant_id: member.tenant_id,
            display_name: member.display_name.clone(),
            emails: member.emails.clone(),
            identities,
            attributes: member.attributes.clone(),
        }
    }

    /// Verified username on `platform`
    pub fn verified_username(&self, platform: &str) -> Option<&str> {
        self.identities
            .iter()
            .find(|i| {
                i.verified && i.platform == platform && i.identity_type == MemberIdentityType::Username
            })
            .map(|i| i.value.as_str())
    }

    pub fn verified_emails(&self) -> impl Iterator<Item = &str> {
        self.identities
            .iter()
            .filter(|i| i.verified && i.identity_type == MemberIdentityType::Email)
            .map(|i| i.value.as_str())
    }
}

#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn name(&self) -> &str;

    /// How long a fetched payload stays fresh
    fn cache_ttl(&self) -> chrono::Duration;

    /// Scraper-style providers return several candidate profiles per member
    fn is_multi_profile(&self) -> bool {
        false
    }

    fn is_enrichable(&self, input: &EnrichmentInput) -> bool;

    async fn has_remaining_credits(&self) -> SinkResult<bool>;

    /// Raw provider payload; None when the provider knows nothing
    async fn fetch(&self, input: &EnrichmentInput) -> SinkResult<Option<Value>>;

    fn normalize(&self, raw: &Value) -> SinkResult<Vec<NormalizedProfile>>;
}
