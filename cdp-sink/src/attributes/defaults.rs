use serde_json::Value;

use super::merge::is_empty_value;
use crate::error::{SinkError, SinkResult};
use crate::types::Attributes;

/// Key holding the canonical value of an attribute
pub const DEFAULT_KEY: &str = "default";

/// First platform of `priority` present in `platforms`, else the first of `platforms`
pub fn highest_priority_platform(platforms: &[String], priority: &[String]) -> SinkResult<String> {
    if priority.is_empty() {
        return Err(SinkError::PriorityArrayNotConfigured);
    }
    let first = platforms
        .first()
        .ok_or_else(|| SinkError::Validation("No platforms to choose from".to_string()))?;

    Ok(priority
        .iter()
        .find(|p| platforms.contains(*p))
        .unwrap_or(first)
        .clone())
}

/// Recompute the `default` entry of every attribute
///
/// Only platforms with a non-empty value compete. An attribute left with no
/// such platform is removed.
pub fn set_defaults(attributes: &Attributes, priority: &[String]) -> SinkResult<Attributes> {
    if priority.is_empty() {
        return Err(SinkError::PriorityArrayNotConfigured);
    }

    let mut out = Attributes::new();
    for (name, value) in attributes {
        let Value::Object(per_platform) = value else {
            out.insert(name.clone(), value.clone());
            continue;
        };

        let mut per_platform = per_platform.clone();
        per_platform.remove(DEFAULT_KEY);

        let platforms: Vec<String> = per_platform
            .iter()
            .filter(|(_, v)| !is_empty_value(v))
            .map(|(k, _)| k.clone())
            .collect();
        if platforms.is_empty() {
            continue;
        }

        let chosen = highest_priority_platform(&platforms, priority)?;
        if let Some(default) = per_platform.get(&chosen).cloned() {
            per_platform.insert(DEFAULT_KEY.to_string(), default);
        }
        out.insert(name.clone(), Value::Object(per_platform));
    }
    Ok(out)
}
