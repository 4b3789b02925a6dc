//! Error diagnostics stored on failed integration results

use serde_json::{json, Value};
use std::error::Error as StdError;

use crate::error::SinkError;

/// One layer of an error chain: (message, kind)
fn layers(error: &SinkError) -> Vec<(String, &'static str)> {
    let mut out = Vec::new();
    let mut current = Some(error);

    while let Some(err) = current {
        match err {
            SinkError::Context { message, source } => {
                out.push((message.clone(), err.kind()));
                current = Some(source.as_ref());
            }
            other => {
                out.push((other.to_string(), other.kind()));
                let mut cause = StdError::source(other);
                while let Some(c) = cause {
                    let text = c.to_string();
                    let repeated = out.last().map(|(m, _)| m.contains(&text)).unwrap_or(false);
                    if !repeated {
                        out.push((text, "cause"));
                    }
                    cause = c.source();
                }
                current = None;
            }
        }
    }

    out
}

/// Diagnostic JSON kept in `integration_results.error`
///
/// `errorMessage` joins every layer of the chain with ` -> `.
pub fn error_diagnostic(location: &str, error: &SinkError, metadata: Value) -> Value {
    let layers = layers(error);
    let error_message = layers
        .iter()
        .map(|(message, _)| message.as_str())
        .collect::<Vec<_>>()
        .join(" -> ");
    let errors: Vec<Value> = layers
        .iter()
        .map(|(message, kind)| json!({ "errorMessage": message, "kind": kind }))
        .collect();

    json!({
        "location": location,
        "message": error.to_string(),
        "errorMessage": error_message,
        "errors": errors,
        "metadata": metadata,
    })
}
