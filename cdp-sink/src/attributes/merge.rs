use serde_json::Value;

use crate::types::Attributes;

const MANUAL_PREFIX: &str = "attributes.";

/// null, blank strings, empty arrays and empty objects
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Merge `incoming` into `existing` keyed by attribute then platform
///
/// Incoming platform values replace stored ones wholesale (arrays are not
/// merged element-wise); null incoming values are ignored.
pub fn deep_merge(existing: &Attributes, incoming: &Attributes) -> Attributes {
    let mut merged = existing.clone();
    for (name, value) in incoming {
        match (merged.get_mut(name), value) {
            (Some(Value::Object(stored)), Value::Object(update)) => {
                for (platform, platform_value) in update {
                    if !platform_value.is_null() {
                        stored.insert(platform.clone(), platform_value.clone());
                    }
                }
            }
            (_, Value::Null) => {}
            (_, value) => {
                merged.insert(name.clone(), value.clone());
            }
        }
    }
    merged
}

/// Merge for an update; None when the result equals what is stored
///
/// Attributes listed as `attributes.<name>` in `manually_changed` keep
/// their stored value.
pub fn merge_for_update(
    existing: &Attributes,
    incoming: &Attributes,
    manually_changed: &[String],
) -> Option<Attributes> {
    let mut merged = deep_merge(existing, incoming);

    for field in manually_changed {
        if let Some(name) = field.strip_prefix(MANUAL_PREFIX) {
            if let Some(stored) = existing.get(name) {
                merged.insert(name.to_string(), stored.clone());
            }
        }
    }

    if merged == *existing {
        None
    } else {
        Some(merged)
    }
}

/// Strip double quotes that providers leak into free-text values
pub fn clean_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace('"', "").trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(clean_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), clean_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_merge_is_keyed_by_platform() {
        let existing = attrs(json!({ "location": { "github": "Porto", "default": "Porto" } }));
        let incoming = attrs(json!({ "location": { "slack": "Lisbon" }, "bio": { "slack": "hi" } }));
        let merged = deep_merge(&existing, &incoming);
        assert_eq!(
            merged["location"],
            json!({ "github": "Porto", "default": "Porto", "slack": "Lisbon" })
        );
        assert_eq!(merged["bio"], json!({ "slack": "hi" }));
    }

    #[test]
    fn test_arrays_are_replaced() {
        let existing = attrs(json!({ "skills": { "linkedin": ["rust", "go", "sql"] } }));
        let incoming = attrs(json!({ "skills": { "linkedin": ["c"] } }));
        let merged = deep_merge(&existing, &incoming);
        assert_eq!(merged["skills"]["linkedin"], json!(["c"]));
    }

    #[test]
    fn test_identical_update_is_noop() {
        let existing = attrs(json!({ "location": { "github": "Porto", "default": "Porto" } }));
        let incoming = attrs(json!({ "location": { "github": "Porto" } }));
        assert!(merge_for_update(&existing, &incoming, &[]).is_none());
    }

    #[test]
    fn test_manually_changed_attribute_kept() {
        let existing = attrs(json!({ "jobTitle": { "custom": "CTO", "default": "CTO" } }));
        let incoming = attrs(json!({ "jobTitle": { "github": "Engineer" } }));
        let manual = vec!["attributes.jobTitle".to_string()];
        assert!(merge_for_update(&existing, &incoming, &manual).is_none());

        let merged = merge_for_update(&existing, &incoming, &[]).unwrap();
        assert_eq!(merged["jobTitle"]["github"], "Engineer");
    }

    #[test]
    fn test_clean_value_strips_quotes() {
        assert_eq!(clean_value(&json!("\"Senior\" Engineer")), json!("Senior Engineer"));
        assert_eq!(clean_value(&json!(["\"a\"", 1])), json!(["a", 1]));
    }

    #[test]
    fn test_empty_values() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!("  ")));
        assert!(is_empty_value(&json!([])));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!(0)));
    }
}
