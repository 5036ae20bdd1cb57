//! Whitelist-based payload sanitizer.
//!
//! Some source clients emit fields upstream providers reject (unknown keys,
//! nulls in non-nullable slots, literal "undefined" strings). Before a body
//! leaves the gateway it is filtered against a per-(provider, model-family)
//! spec; everything off the whitelist is dropped and logged at debug level.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Any,
    Object,
    Array,
    String,
    Number,
    Boolean,
}

#[derive(Debug)]
pub struct FieldSpec {
    pub kind: FieldType,
    pub nullable: bool,
    pub children: Option<HashMap<&'static str, FieldSpec>>,
    pub items: Option<Box<FieldSpec>>,
}

impl FieldSpec {
    pub fn any() -> Self {
        Self {
            kind: FieldType::Any,
            nullable: false,
            children: None,
            items: None,
        }
    }

    pub fn of(kind: FieldType) -> Self {
        Self {
            kind,
            nullable: false,
            children: None,
            items: None,
        }
    }

    pub fn object(children: HashMap<&'static str, FieldSpec>) -> Self {
        Self {
            kind: FieldType::Object,
            nullable: false,
            children: Some(children),
            items: None,
        }
    }

    pub fn array_of(item: FieldSpec) -> Self {
        Self {
            kind: FieldType::Array,
            nullable: false,
            children: None,
            items: Some(Box::new(item)),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug)]
pub struct PayloadSpec {
    pub name: &'static str,
    pub fields: HashMap<&'static str, FieldSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Removed,
    Nullified,
}

#[derive(Debug)]
pub struct ValidationEntry {
    pub path: String,
    pub action: Action,
    pub reason: &'static str,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub spec_name: &'static str,
    pub entries: Vec<ValidationEntry>,
}

impl ValidationReport {
    fn add(&mut self, path: String, action: Action, reason: &'static str) {
        self.entries.push(ValidationEntry {
            path,
            action,
            reason,
        });
    }

    pub fn changed(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn log_debug(&self) {
        if self.entries.is_empty() {
            return;
        }
        debug!(
            spec = self.spec_name,
            changes = self.entries.len(),
            "payload sanitizer applied changes"
        );
        for entry in &self.entries {
            debug!(path = %entry.path, action = ?entry.action, reason = entry.reason, "sanitized");
        }
    }
}

/// Sanitize `payload` against `spec`. Returns the possibly-rewritten bytes
/// and a report of every change. Unparsable payloads pass through untouched.
pub fn sanitize_payload(payload: &[u8], spec: &PayloadSpec) -> (Vec<u8>, ValidationReport) {
    let mut report = ValidationReport {
        spec_name: spec.name,
        ..Default::default()
    };
    if payload.is_empty() {
        return (payload.to_vec(), report);
    }
    let Ok(Value::Object(data)) = serde_json::from_slice::<Value>(payload) else {
        return (payload.to_vec(), report);
    };

    let cleaned = sanitize_object(data, &spec.fields, "", &mut report);
    if !report.changed() {
        return (payload.to_vec(), report);
    }
    match serde_json::to_vec(&Value::Object(cleaned)) {
        Ok(bytes) => (bytes, report),
        Err(_) => (payload.to_vec(), report),
    }
}

fn sanitize_object(
    data: Map<String, Value>,
    allowed: &HashMap<&'static str, FieldSpec>,
    path: &str,
    report: &mut ValidationReport,
) -> Map<String, Value> {
    let mut result = Map::with_capacity(data.len());
    for (key, value) in data {
        let field_path = join_path(path, &key);
        let Some(spec) = allowed.get(key.as_str()) else {
            report.add(field_path, Action::Removed, "not in whitelist");
            continue;
        };
        if value.is_null() {
            if spec.nullable {
                result.insert(key, Value::Null);
            } else {
                report.add(field_path, Action::Removed, "null not allowed");
            }
            continue;
        }
        if let Some(cleaned) = sanitize_value(value, spec, &field_path, report) {
            result.insert(key, cleaned);
        }
    }
    result
}

fn sanitize_value(
    value: Value,
    spec: &FieldSpec,
    path: &str,
    report: &mut ValidationReport,
) -> Option<Value> {
    if spec.kind == FieldType::Any {
        return sanitize_any(value, path, report);
    }
    match spec.kind {
        FieldType::Object => match value {
            Value::Object(obj) => match &spec.children {
                Some(children) => Some(Value::Object(sanitize_object(obj, children, path, report))),
                None => sanitize_any(Value::Object(obj), path, report),
            },
            _ => {
                report.add(path.to_string(), Action::Removed, "expected object");
                None
            }
        },
        FieldType::Array => match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    if item.is_null() {
                        continue;
                    }
                    let item_path = format!("{path}[{i}]");
                    let cleaned = match &spec.items {
                        Some(item_spec) => sanitize_value(item, item_spec, &item_path, report),
                        None => sanitize_any(item, &item_path, report),
                    };
                    if let Some(cleaned) = cleaned {
                        out.push(cleaned);
                    }
                }
                Some(Value::Array(out))
            }
            _ => {
                report.add(path.to_string(), Action::Removed, "expected array");
                None
            }
        },
        FieldType::String => match value {
            Value::String(_) => Some(value),
            _ => {
                report.add(path.to_string(), Action::Removed, "expected string");
                None
            }
        },
        FieldType::Number => match value {
            Value::Number(_) => Some(value),
            _ => {
                report.add(path.to_string(), Action::Removed, "expected number");
                None
            }
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Some(value),
            _ => {
                report.add(path.to_string(), Action::Removed, "expected boolean");
                None
            }
        },
        FieldType::Any => Some(value),
    }
}

fn sanitize_any(value: Value, path: &str, report: &mut ValidationReport) -> Option<Value> {
    match value {
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (key, item) in obj {
                let field_path = join_path(path, &key);
                if item.is_null() {
                    report.add(field_path, Action::Removed, "null value in untyped object");
                    continue;
                }
                if let Some(cleaned) = sanitize_any(item, &field_path, report) {
                    out.insert(key, cleaned);
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                if item.is_null() {
                    continue;
                }
                if let Some(cleaned) = sanitize_any(item, &format!("{path}[{i}]"), report) {
                    out.push(cleaned);
                }
            }
            Some(Value::Array(out))
        }
        Value::String(text) => {
            if text == "[undefined]" || text == "undefined" {
                report.add(path.to_string(), Action::Removed, "undefined value");
                return None;
            }
            Some(Value::String(text))
        }
        other => Some(other),
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Whitelist for plain Gemini generateContent bodies.
pub fn gemini_request_spec() -> PayloadSpec {
    let mut generation_config = HashMap::new();
    for key in [
        "temperature",
        "topP",
        "topK",
        "maxOutputTokens",
        "candidateCount",
        "seed",
        "presencePenalty",
        "frequencyPenalty",
    ] {
        generation_config.insert(key, FieldSpec::of(FieldType::Number));
    }
    generation_config.insert("stopSequences", FieldSpec::array_of(FieldSpec::of(FieldType::String)));
    generation_config.insert("responseMimeType", FieldSpec::of(FieldType::String));
    generation_config.insert("responseSchema", FieldSpec::any());
    generation_config.insert("thinkingConfig", FieldSpec::any());

    let mut fields = HashMap::new();
    fields.insert("contents", FieldSpec::array_of(FieldSpec::any()));
    fields.insert("systemInstruction", FieldSpec::any());
    fields.insert("system_instruction", FieldSpec::any());
    fields.insert("generationConfig", FieldSpec::object(generation_config));
    fields.insert("tools", FieldSpec::array_of(FieldSpec::any()));
    fields.insert("toolConfig", FieldSpec::any());
    fields.insert("safetySettings", FieldSpec::array_of(FieldSpec::any()));
    fields.insert("cachedContent", FieldSpec::of(FieldType::String));

    PayloadSpec {
        name: "gemini",
        fields,
    }
}

/// Whitelist for the Gemini CLI `{project, request, model}` envelope.
pub fn gemini_cli_wrapper_spec() -> PayloadSpec {
    let mut fields = HashMap::new();
    fields.insert("project", FieldSpec::of(FieldType::String));
    fields.insert("model", FieldSpec::of(FieldType::String));
    fields.insert("request", FieldSpec::any());
    fields.insert("user_prompt_id", FieldSpec::of(FieldType::String));
    fields.insert("session_id", FieldSpec::of(FieldType::String));
    PayloadSpec {
        name: "gemini_cli",
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_are_dropped() {
        let spec = gemini_request_spec();
        let payload = serde_json::to_vec(&json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "bogusField": 1,
        }))
        .unwrap();
        let (cleaned, report) = sanitize_payload(&payload, &spec);
        let value: Value = serde_json::from_slice(&cleaned).unwrap();
        assert!(value.get("bogusField").is_none());
        assert!(value.get("contents").is_some());
        assert!(report.changed());
        assert_eq!(report.entries[0].path, "bogusField");
    }

    #[test]
    fn nulls_removed_from_non_nullable_positions() {
        let spec = gemini_request_spec();
        let payload = serde_json::to_vec(&json!({
            "generationConfig": {"temperature": null, "topP": 0.9},
        }))
        .unwrap();
        let (cleaned, report) = sanitize_payload(&payload, &spec);
        let value: Value = serde_json::from_slice(&cleaned).unwrap();
        assert!(value["generationConfig"].get("temperature").is_none());
        assert_eq!(value["generationConfig"]["topP"], 0.9);
        assert!(report.changed());
    }

    #[test]
    fn undefined_strings_stripped_inside_untyped_values() {
        let spec = gemini_request_spec();
        let payload = serde_json::to_vec(&json!({
            "contents": [{"role": "user", "parts": [{"text": "undefined"}, {"text": "real"}]}],
        }))
        .unwrap();
        let (cleaned, _) = sanitize_payload(&payload, &spec);
        let value: Value = serde_json::from_slice(&cleaned).unwrap();
        let parts = value["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].get("text").is_none());
        assert_eq!(parts[1]["text"], "real");
    }

    #[test]
    fn type_mismatch_drops_field() {
        let spec = gemini_request_spec();
        let payload = serde_json::to_vec(&json!({
            "cachedContent": 42,
        }))
        .unwrap();
        let (cleaned, report) = sanitize_payload(&payload, &spec);
        let value: Value = serde_json::from_slice(&cleaned).unwrap();
        assert!(value.get("cachedContent").is_none());
        assert_eq!(report.entries[0].reason, "expected string");
    }

    #[test]
    fn clean_payload_passes_through_byte_identical() {
        let spec = gemini_request_spec();
        let payload = serde_json::to_vec(&json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
        }))
        .unwrap();
        let (cleaned, report) = sanitize_payload(&payload, &spec);
        assert_eq!(cleaned, payload);
        assert!(!report.changed());
    }
}
