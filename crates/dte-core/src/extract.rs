//! Field extraction from OpenRTB request documents
//!
//! Field paths use dot and bracket notation (`$.imp[0].banner.w`). The
//! document is parsed once; every configured path is then resolved against
//! the parsed tree. Fields absent from the document resolve to the empty
//! string so downstream transformers always see one value per declared path.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;

/// OpenRTB request id path, extracted for logging alongside the features.
pub const EXTERNAL_FIELD_REQUEST_ID: &str = "$.id";

/// `$.imp[0].banner.w` becomes `["imp", "[0]", "banner", "w"]`.
fn path_tokens(field: &str) -> Vec<String> {
    let stripped = field.strip_prefix("$.").unwrap_or(field);
    stripped
        .replace('[', ".[")
        .split('.')
        .map(str::to_string)
        .collect()
}

fn lookup<'a>(root: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for token in tokens {
        if let Some(index) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            let index: usize = index.parse().ok()?;
            current = current.as_array()?.get(index)?;
        } else {
            current = current.as_object()?.get(token.as_str())?;
        }
    }
    Some(current)
}

/// String form of a leaf regardless of its JSON type. Strings yield their
/// content, everything else its JSON text.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve every field path against the raw request document.
pub fn extract_fields(
    open_rtb_request: &str,
    fields: &[String],
) -> Result<HashMap<String, String>> {
    let document: Value =
        serde_json::from_str(open_rtb_request).context("error parsing OpenRTB request")?;

    let mut field_value_map = HashMap::with_capacity(fields.len());
    for field in fields {
        let tokens = path_tokens(field);
        let value = lookup(&document, &tokens)
            .map(value_text)
            .unwrap_or_default();
        field_value_map.insert(field.clone(), value);
    }
    Ok(field_value_map)
}

/// Fast path for callers that pre-extracted the request into a map: keep the
/// supplied values for the requested fields and default the rest to the
/// empty string, without touching the raw request.
pub fn top_up_fields(
    supplied: &HashMap<String, String>,
    fields: &[String],
) -> HashMap<String, String> {
    fields
        .iter()
        .map(|field| {
            (
                field.clone(),
                supplied.get(field).cloned().unwrap_or_default(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN_RTB_REQUEST: &str = r#"{
        "id": "req-123",
        "device": {"geo": {"country": "US"}, "ua": "Mozilla/5.0"},
        "imp": [
            {"banner": {"w": 300, "h": 250}},
            {"video": {"mimes": ["video/mp4"]}}
        ],
        "app": {"bundle": "com.example.game"},
        "test": true
    }"#;

    fn fields(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn tokenizes_bracket_notation() {
        assert_eq!(path_tokens("$.imp[0].banner.w"), vec!["imp", "[0]", "banner", "w"]);
        assert_eq!(path_tokens("$.device.geo.country"), vec!["device", "geo", "country"]);
        assert_eq!(path_tokens("$.id"), vec!["id"]);
    }

    #[test]
    fn extracts_nested_and_indexed_fields() {
        let map = extract_fields(
            OPEN_RTB_REQUEST,
            &fields(&[
                "$.id",
                "$.device.geo.country",
                "$.imp[0].banner.w",
                "$.imp[1].video.mimes[0]",
            ]),
        )
        .unwrap();

        assert_eq!(map["$.id"], "req-123");
        assert_eq!(map["$.device.geo.country"], "US");
        assert_eq!(map["$.imp[0].banner.w"], "300");
        assert_eq!(map["$.imp[1].video.mimes[0]"], "video/mp4");
    }

    #[test]
    fn non_string_leaves_keep_their_json_text() {
        let map = extract_fields(
            OPEN_RTB_REQUEST,
            &fields(&["$.test", "$.imp[0].banner", "$.imp[1].video.mimes"]),
        )
        .unwrap();

        assert_eq!(map["$.test"], "true");
        assert_eq!(map["$.imp[0].banner"], r#"{"h":250,"w":300}"#);
        assert_eq!(map["$.imp[1].video.mimes"], r#"["video/mp4"]"#);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let map = extract_fields(
            OPEN_RTB_REQUEST,
            &fields(&["$.site.domain", "$.imp[5].banner.w", "$.device.geo.country"]),
        )
        .unwrap();

        assert_eq!(map["$.site.domain"], "");
        assert_eq!(map["$.imp[5].banner.w"], "");
        assert_eq!(map["$.device.geo.country"], "US");
    }

    #[test]
    fn malformed_request_is_an_error() {
        assert!(extract_fields("{truncated", &fields(&["$.id"])).is_err());
    }

    #[test]
    fn top_up_keeps_supplied_values_and_defaults_missing() {
        let supplied = HashMap::from([
            ("$.device.geo.country".to_string(), "DE".to_string()),
            ("$.unrelated".to_string(), "dropped".to_string()),
        ]);
        let map = top_up_fields(
            &supplied,
            &fields(&["$.device.geo.country", "$.app.bundle"]),
        );

        assert_eq!(map.len(), 2);
        assert_eq!(map["$.device.geo.country"], "DE");
        assert_eq!(map["$.app.bundle"], "");
    }
}
