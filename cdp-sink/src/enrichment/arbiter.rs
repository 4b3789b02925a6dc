//! Black-box arbitration for conflicting provider data
//!
//! The collaborator is asked to pick one value per attribute, or one
//! profile out of several candidates. Answers are validated before use and
//! any failure degrades to "no choice" instead of failing the enrichment.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::source::NormalizedProfile;
use crate::config::ArbitrationConfig;
use crate::error::{SinkError, SinkResult};

const USER_AGENT: &str = concat!("cdp-sink/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationTask {
    SquashAttributes,
    SelectProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrationRequest {
    pub task: ArbitrationTask,
    pub member_id: Uuid,
    pub payload: Value,
}

#[async_trait]
pub trait ArbitrationClient: Send + Sync {
    async fn complete(&self, request: &ArbitrationRequest) -> SinkResult<Value>;
}

/// Posts requests as JSON to a configured endpoint
pub struct HttpArbitrationClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpArbitrationClient {
    /// None when no endpoint is configured
    pub fn from_config(config: &ArbitrationConfig) -> SinkResult<Option<Self>> {
        let Some(endpoint) = config.endpoint.clone().filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Some(Self {
            http_client,
            endpoint,
            api_key: config.api_key.clone(),
        }))
    }
}

#[async_trait]
impl ArbitrationClient for HttpArbitrationClient {
    async fn complete(&self, request: &ArbitrationRequest) -> SinkResult<Value> {
        tracing::debug!(member_id = %request.member_id, task = ?request.task, "Calling arbitration endpoint");

        let mut builder = self.http_client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Arbitration(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(response.json().await?)
    }
}

/// Chosen value per attribute
///
/// Keys must come from the request. Nulls and values that were not among
/// the offered candidates are dropped.
pub fn validate_attribute_choices(
    requested: &BTreeMap<String, Vec<Value>>,
    response: &Value,
) -> SinkResult<BTreeMap<String, Value>> {
    let object = response
        .as_object()
        .ok_or_else(|| SinkError::Arbitration("attribute choice is not an object".to_string()))?;

    let mut chosen = BTreeMap::new();
    for (name, value) in object {
        let Some(candidates) = requested.get(name) else {
            return Err(SinkError::Arbitration(format!("unrequested attribute '{}'", name)));
        };
        if value.is_null() {
            continue;
        }
        if !candidates.contains(value) {
            tracing::warn!(attribute = %name, "Arbitration chose a value that was not offered, ignoring it");
            continue;
        }
        chosen.insert(name.clone(), value.clone());
    }
    Ok(chosen)
}

/// `{"profileIndex": n | null}` with n inside the candidate list
pub fn validate_profile_choice(candidates: usize, response: &Value) -> SinkResult<Option<usize>> {
    match response.get("profileIndex") {
        None | Some(Value::Null) => Ok(None),
        Some(index) => {
            let index = index
                .as_u64()
                .ok_or_else(|| SinkError::Arbitration(format!("invalid profile index {}", index)))?
                as usize;
            if index < candidates {
                Ok(Some(index))
            } else {
                Err(SinkError::Arbitration(format!(
                    "profile index {} out of range for {} candidates",
                    index, candidates
                )))
            }
        }
    }
}

#[derive(Clone)]
pub struct Arbiter {
    client: Arc<dyn ArbitrationClient>,
}

impl Arbiter {
    pub fn new(client: Arc<dyn ArbitrationClient>) -> Self {
        Self { client }
    }

    /// One value per conflicting attribute; empty on any failure
    pub async fn choose_attribute_values(
        &self,
        member_id: Uuid,
        candidates: &BTreeMap<String, Vec<Value>>,
    ) -> BTreeMap<String, Value> {
        let request = ArbitrationRequest {
            task: ArbitrationTask::SquashAttributes,
            member_id,
            payload: json!(candidates),
        };
        let outcome = match self.client.complete(&request).await {
            Ok(response) => validate_attribute_choices(candidates, &response),
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| {
            tracing::warn!(member_id = %member_id, error = %e, "Attribute arbitration failed, leaving attributes unset");
            BTreeMap::new()
        })
    }

    /// Which candidate profile belongs to the member, given what we already know
    pub async fn select_profile(
        &self,
        member_id: Uuid,
        member_context: &Value,
        profiles: &[NormalizedProfile],
    ) -> Option<usize> {
        let request = ArbitrationRequest {
            task: ArbitrationTask::SelectProfile,
            member_id,
            payload: json!({ "member": member_context, "profiles": profiles }),
        };
        let outcome = match self.client.complete(&request).await {
            Ok(response) => validate_profile_choice(profiles.len(), &response),
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| {
            tracing::warn!(member_id = %member_id, error = %e, "Profile arbitration failed, selecting none");
            None
        })
    }
}
