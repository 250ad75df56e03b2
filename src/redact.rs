//! Deterministic payload redaction.
//!
//! Submission payloads may carry values that must never reach the store in
//! clear form (government identifiers, bearer credentials). The redactor
//! deep-clones the payload and replaces the value at every configured dotted
//! path with a fixed placeholder. Redaction is deterministic and idempotent.

use serde_json::{Map, Value};

/// Placeholder written over redacted values.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// Replaces values at configured dotted paths with [`REDACTED_PLACEHOLDER`].
///
/// Paths are relative to the submission payload: the first segment names the
/// section (`context` or `metadata`), the rest descend into the map. The
/// walk only descends where the path exists and the intermediate value is
/// itself a JSON object; arrays and scalars terminate the walk untouched.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    paths: Vec<Vec<String>>,
}

impl Redactor {
    pub fn new(paths: &[String]) -> Self {
        let paths = paths
            .iter()
            .map(|p| p.split('.').map(str::to_string).collect::<Vec<_>>())
            .filter(|segments: &Vec<String>| {
                segments.len() >= 2 && segments.iter().all(|s| !s.is_empty())
            })
            .collect();
        Self { paths }
    }

    /// Redact one payload section, returning a deep-cloned copy.
    ///
    /// `section` is matched against the first segment of each configured
    /// path; only the remaining segments are applied to `map`.
    pub fn redact_section(&self, section: &str, map: &Map<String, Value>) -> Map<String, Value> {
        let mut root = Value::Object(map.clone());
        for segments in &self.paths {
            if segments[0] == section {
                redact_path(&mut root, &segments[1..]);
            }
        }
        match root {
            Value::Object(map) => map,
            _ => unreachable!("redaction preserves the object root"),
        }
    }
}

fn redact_path(value: &mut Value, segments: &[String]) {
    let Some(map) = value.as_object_mut() else {
        return;
    };
    match segments {
        [] => {}
        [leaf] => {
            if map.contains_key(leaf) {
                map.insert(leaf.clone(), Value::String(REDACTED_PLACEHOLDER.to_string()));
            }
        }
        [head, rest @ ..] => {
            if let Some(child) = map.get_mut(head) {
                redact_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn redactor() -> Redactor {
        Redactor::new(&[
            "context.ssn".to_string(),
            "context.billing.card".to_string(),
            "metadata.authorization".to_string(),
        ])
    }

    #[test]
    fn test_redacts_nested_paths() {
        let context = as_map(json!({
            "ssn": "123-45-6789",
            "billing": {"card": "4111111111111111", "zip": "02134"},
            "note": "keep"
        }));

        let redacted = redactor().redact_section("context", &context);

        assert_eq!(redacted["ssn"], REDACTED_PLACEHOLDER);
        assert_eq!(redacted["billing"]["card"], REDACTED_PLACEHOLDER);
        assert_eq!(redacted["billing"]["zip"], "02134");
        assert_eq!(redacted["note"], "keep");
    }

    #[test]
    fn test_missing_paths_are_noops() {
        let context = as_map(json!({"note": "clean"}));
        let redacted = redactor().redact_section("context", &context);
        assert_eq!(Value::Object(redacted), json!({"note": "clean"}));
    }

    #[test]
    fn test_does_not_descend_through_scalars() {
        // `billing` is a string here, so `billing.card` must not apply.
        let context = as_map(json!({"billing": "opaque"}));
        let redacted = redactor().redact_section("context", &context);
        assert_eq!(redacted["billing"], "opaque");
    }

    #[test]
    fn test_redaction_is_idempotent() {
        let context = as_map(json!({
            "ssn": "123-45-6789",
            "billing": {"card": "4111"}
        }));

        let once = redactor().redact_section("context", &context);
        let twice = redactor().redact_section("context", &once);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_sections_are_independent() {
        let metadata = as_map(json!({"authorization": "Bearer abc", "ssn": "x"}));
        let redacted = redactor().redact_section("metadata", &metadata);

        assert_eq!(redacted["authorization"], REDACTED_PLACEHOLDER);
        // `context.ssn` must not leak into the metadata section.
        assert_eq!(redacted["ssn"], "x");
    }
}
