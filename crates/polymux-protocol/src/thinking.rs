//! Gemini thinking-model normalization.
//!
//! Clients select reasoning behavior through model-name suffixes
//! (`-nothinking`, `-reasoning`, `-thinking-<N>`). These normalize to the
//! base model plus an explicit thinking config before family resolution.
//! Gemini 3 models replace the integer `thinkingBudget` with a
//! `thinking_level` enum; conversion in both directions lives here.

use serde_json::{json, Value};

use crate::ir::ThinkingConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingSuffix {
    pub base_model: String,
    pub budget: Option<i64>,
    pub include_thoughts: Option<bool>,
}

/// Parse a `-nothinking` / `-reasoning` / `-thinking-<N>` suffix. Returns
/// None when the model carries no suffix (or is not a gemini model).
pub fn parse_thinking_suffix(model: &str) -> Option<ThinkingSuffix> {
    if model.is_empty() {
        return None;
    }
    let lower = model.to_ascii_lowercase();
    if !lower.starts_with("gemini-") {
        return None;
    }

    if lower.ends_with("-nothinking") {
        let base = &model[..model.len() - "-nothinking".len()];
        // 2.5 Pro cannot fully disable thinking; 128 is its floor.
        let budget = if lower.starts_with("gemini-2.5-pro") { 128 } else { 0 };
        return Some(ThinkingSuffix {
            base_model: base.to_string(),
            budget: Some(budget),
            include_thoughts: Some(false),
        });
    }

    if lower.ends_with("-reasoning") {
        let base = &model[..model.len() - "-reasoning".len()];
        return Some(ThinkingSuffix {
            base_model: base.to_string(),
            budget: Some(-1),
            include_thoughts: Some(true),
        });
    }

    let idx = lower.rfind("-thinking-")?;
    let digits = &model[idx + "-thinking-".len()..];
    if digits.is_empty() {
        return None;
    }
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let value: i64 = digits[..end].parse().ok()?;
    Some(ThinkingSuffix {
        base_model: model[..idx].to_string(),
        budget: Some(value),
        include_thoughts: None,
    })
}

/// Normalize a model name: strip the thinking suffix and fold it into the
/// request's thinking config. Returns the base model name.
pub fn normalize_model(model: &str, thinking: &mut Option<ThinkingConfig>) -> String {
    let Some(suffix) = parse_thinking_suffix(model) else {
        return model.to_string();
    };
    let config = thinking.get_or_insert_with(ThinkingConfig::default);
    if config.budget.is_none() {
        config.budget = suffix.budget;
    }
    if config.include_thoughts.is_none() {
        config.include_thoughts = suffix.include_thoughts;
    }
    suffix.base_model
}

pub fn is_gemini3(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.starts_with("gemini-3")
}

fn is_flash(model: &str) -> bool {
    model.to_ascii_lowercase().contains("flash")
}

/// Map an integer budget onto the Gemini 3 level enum. Flash supports all
/// four levels; Pro only LOW and HIGH.
pub fn budget_to_level(model: &str, budget: i64) -> &'static str {
    let flash = is_flash(model);
    if budget <= 128 {
        if flash {
            "MINIMAL"
        } else {
            "LOW"
        }
    } else if budget <= 1024 {
        "LOW"
    } else if budget <= 8192 {
        if flash {
            "MEDIUM"
        } else {
            "HIGH"
        }
    } else {
        "HIGH"
    }
}

pub fn level_to_budget(level: &str) -> Option<i64> {
    match level.to_ascii_lowercase().as_str() {
        "minimal" => Some(128),
        "low" => Some(128),
        "medium" => Some(8192),
        "high" => Some(32768),
        _ => None,
    }
}

pub fn default_level(model: &str) -> &'static str {
    if is_flash(model) {
        "MEDIUM"
    } else {
        "HIGH"
    }
}

/// Rewrite `generationConfig.thinkingConfig` in a Gemini body for the target
/// model family: budget -> level for Gemini 3, level -> budget for earlier
/// models. `path_prefix` handles the CLI's `request.` envelope.
pub fn reshape_thinking_config(body: &mut Value, model: &str, path_prefix: &str) {
    let pointer = if path_prefix.is_empty() {
        "/generationConfig/thinkingConfig".to_string()
    } else {
        format!("/{path_prefix}/generationConfig/thinkingConfig")
    };
    let Some(config) = body.pointer_mut(&pointer) else {
        return;
    };
    let Some(obj) = config.as_object_mut() else {
        return;
    };

    if is_gemini3(model) {
        if let Some(budget) = obj.remove("thinkingBudget").and_then(|v| v.as_i64()) {
            if !obj.contains_key("thinkingLevel") && !obj.contains_key("thinking_level") {
                obj.insert(
                    "thinkingLevel".to_string(),
                    json!(budget_to_level(model, budget)),
                );
            }
        }
    } else {
        let level = obj
            .remove("thinkingLevel")
            .or_else(|| obj.remove("thinking_level"))
            .and_then(|v| v.as_str().map(|s| s.to_string()));
        if let Some(level) = level {
            if !obj.contains_key("thinkingBudget") {
                if let Some(budget) = level_to_budget(&level) {
                    obj.insert("thinkingBudget".to_string(), json!(budget));
                }
            }
        }
    }
}

/// Thinking capability by model family; used to strip configs upstream would
/// reject.
pub fn model_supports_thinking(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    if !lower.starts_with("gemini-") {
        return true;
    }
    !(lower.starts_with("gemini-1") || lower.starts_with("gemini-2.0"))
}

/// Drop `thinkingConfig` wherever it appears when the model cannot think.
pub fn strip_thinking_if_unsupported(body: &mut Value, model: &str) {
    if model_supports_thinking(model) {
        return;
    }
    for pointer in ["/generationConfig", "/request/generationConfig"] {
        if let Some(config) = body.pointer_mut(pointer) {
            if let Some(obj) = config.as_object_mut() {
                obj.remove("thinkingConfig");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_grammar() {
        let parsed = parse_thinking_suffix("gemini-2.5-flash-nothinking").unwrap();
        assert_eq!(parsed.base_model, "gemini-2.5-flash");
        assert_eq!(parsed.budget, Some(0));
        assert_eq!(parsed.include_thoughts, Some(false));

        // 2.5 Pro floors at 128 instead of 0.
        let parsed = parse_thinking_suffix("gemini-2.5-pro-nothinking").unwrap();
        assert_eq!(parsed.budget, Some(128));

        let parsed = parse_thinking_suffix("gemini-2.5-flash-reasoning").unwrap();
        assert_eq!(parsed.budget, Some(-1));
        assert_eq!(parsed.include_thoughts, Some(true));

        let parsed = parse_thinking_suffix("gemini-2.5-flash-thinking-4096").unwrap();
        assert_eq!(parsed.base_model, "gemini-2.5-flash");
        assert_eq!(parsed.budget, Some(4096));

        assert!(parse_thinking_suffix("gemini-2.5-flash").is_none());
        assert!(parse_thinking_suffix("claude-sonnet-4-5-thinking-1").is_none());
        assert!(parse_thinking_suffix("gemini-2.5-flash-thinking-").is_none());
    }

    #[test]
    fn budget_level_mapping_respects_family() {
        assert_eq!(budget_to_level("gemini-3-flash", 100), "MINIMAL");
        assert_eq!(budget_to_level("gemini-3-pro", 100), "LOW");
        assert_eq!(budget_to_level("gemini-3-flash", 4000), "MEDIUM");
        assert_eq!(budget_to_level("gemini-3-pro", 4000), "HIGH");
        assert_eq!(budget_to_level("gemini-3-flash", 50000), "HIGH");
        assert_eq!(default_level("gemini-3-flash"), "MEDIUM");
        assert_eq!(default_level("gemini-3-pro"), "HIGH");
    }

    #[test]
    fn reshape_converts_budget_for_gemini3() {
        let mut body = serde_json::json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 4096}},
        });
        reshape_thinking_config(&mut body, "gemini-3-flash", "");
        let config = &body["generationConfig"]["thinkingConfig"];
        assert!(config.get("thinkingBudget").is_none());
        assert_eq!(config["thinkingLevel"], "MEDIUM");
    }

    #[test]
    fn reshape_converts_level_for_older_models() {
        let mut body = serde_json::json!({
            "request": {"generationConfig": {"thinkingConfig": {"thinkingLevel": "high"}}},
        });
        reshape_thinking_config(&mut body, "gemini-2.5-pro", "request");
        let config = &body["request"]["generationConfig"]["thinkingConfig"];
        assert_eq!(config["thinkingBudget"], 32768);
        assert!(config.get("thinkingLevel").is_none());
    }

    #[test]
    fn strip_for_non_thinking_models() {
        let mut body = serde_json::json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 1}, "topP": 0.9},
        });
        strip_thinking_if_unsupported(&mut body, "gemini-2.0-flash");
        assert!(body["generationConfig"].get("thinkingConfig").is_none());
        assert_eq!(body["generationConfig"]["topP"], 0.9);
    }

    #[test]
    fn normalize_folds_suffix_into_config() {
        let mut thinking = None;
        let base = normalize_model("gemini-2.5-flash-reasoning", &mut thinking);
        assert_eq!(base, "gemini-2.5-flash");
        let config = thinking.unwrap();
        assert_eq!(config.budget, Some(-1));
        assert_eq!(config.include_thoughts, Some(true));
    }
}
