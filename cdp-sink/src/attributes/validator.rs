use serde_json::{Map, Value};
use tracing::warn;

use super::schema::AttributeSchema;
use crate::error::{SinkError, SinkResult};
use crate::types::Attributes;

/// Platform key for bare values that arrive without a platform
pub const CUSTOM_PLATFORM: &str = "custom";

/// Check incoming attributes against the tenant schema
///
/// Unknown names are dropped with a warning. A bare value (anything but an
/// object) is wrapped as `{platform_hint: value}`, or under `custom` when
/// no hint is given. A value of the wrong type fails the whole set.
pub fn validate(
    schema: &AttributeSchema,
    attributes: &Attributes,
    platform_hint: Option<&str>,
) -> SinkResult<Attributes> {
    let mut validated = Attributes::new();

    for (name, value) in attributes {
        let Some(setting) = schema.get(name) else {
            warn!(attribute = %name, "Attribute does not exist in tenant schema, dropping it");
            continue;
        };

        let per_platform = match value {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert(
                    platform_hint.unwrap_or(CUSTOM_PLATFORM).to_string(),
                    other.clone(),
                );
                map
            }
        };

        for (platform, platform_value) in &per_platform {
            if platform_value.is_null() {
                continue;
            }
            if !setting
                .attribute_type
                .accepts(platform_value, &setting.options)
            {
                return Err(SinkError::Validation(format!(
                    "Failed to validate attribute '{}' of type {} with value '{}' from '{}'",
                    name, setting.attribute_type, platform_value, platform
                )));
            }
        }

        validated.insert(name.clone(), Value::Object(per_platform));
    }

    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeSetting, AttributeType};
    use serde_json::json;

    fn schema() -> AttributeSchema {
        let mut skills = AttributeSetting::new("skills", "Skills", AttributeType::MultiSelect);
        skills.options = vec!["rust".into(), "sql".into()];
        AttributeSchema::new(vec![
            AttributeSetting::new("location", "Location", AttributeType::String),
            AttributeSetting::new("isBot", "Bot", AttributeType::Boolean),
            skills,
        ])
    }

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_unknown_attributes_are_dropped() {
        let out = validate(
            &schema(),
            &attrs(json!({ "location": { "github": "Porto" }, "shoeSize": { "github": 44 } })),
            Some("github"),
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("location"));
    }

    #[test]
    fn test_bare_scalar_wrapped_with_platform_hint() {
        let out = validate(&schema(), &attrs(json!({ "location": "Porto" })), Some("slack")).unwrap();
        assert_eq!(out["location"], json!({ "slack": "Porto" }));

        let out = validate(&schema(), &attrs(json!({ "location": "Porto" })), None).unwrap();
        assert_eq!(out["location"], json!({ "custom": "Porto" }));
    }

    #[test]
    fn test_bare_array_wrapped_too() {
        let out = validate(&schema(), &attrs(json!({ "skills": ["rust"] })), Some("linkedin")).unwrap();
        assert_eq!(out["skills"], json!({ "linkedin": ["rust"] }));
    }

    #[test]
    fn test_type_mismatch_is_validation_error() {
        let err = validate(&schema(), &attrs(json!({ "isBot": { "github": "maybe" } })), None)
            .unwrap_err();
        assert!(matches!(err, SinkError::Validation(_)));
    }

    #[test]
    fn test_null_platform_values_are_not_type_checked() {
        let out = validate(&schema(), &attrs(json!({ "isBot": { "github": null } })), None).unwrap();
        assert_eq!(out["isBot"], json!({ "github": null }));
    }
}
