//! Canonical model families.
//!
//! A client-facing canonical name resolves to one or more provider-specific
//! model IDs with a priority. Only families whose IDs differ between
//! providers need an entry; same-ID models route without translation.
//! The table is immutable after first use, so lookups need no lock.

use std::collections::HashMap;
use std::sync::OnceLock;

use rand::seq::SliceRandom;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyMember {
    pub provider: &'static str,
    pub model_id: &'static str,
    /// 1 = highest. Equal priorities are load balanced.
    pub priority: u8,
}

fn families() -> &'static HashMap<&'static str, Vec<FamilyMember>> {
    static TABLE: OnceLock<HashMap<&'static str, Vec<FamilyMember>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(
            "claude-sonnet-4-5",
            vec![
                member("antigravity", "gemini-claude-sonnet-4-5", 1),
                member("claude", "claude-sonnet-4-5-20250929", 2),
            ],
        );
        table.insert(
            "claude-sonnet-4-5-thinking",
            vec![
                member("claude", "claude-sonnet-4-5-thinking", 1),
                member("antigravity", "gemini-claude-sonnet-4-5-thinking", 2),
            ],
        );
        table.insert(
            "claude-opus-4-5",
            vec![member("claude", "claude-opus-4-5-20251101", 1)],
        );
        table.insert(
            "claude-opus-4-5-thinking",
            vec![
                member("antigravity", "gemini-claude-opus-4-5-thinking", 1),
                member("claude", "claude-opus-4-5-thinking", 2),
            ],
        );
        table.insert(
            "claude-sonnet-4",
            vec![member("claude", "claude-sonnet-4-20250514", 1)],
        );
        table.insert(
            "claude-3-7-sonnet",
            vec![member("claude", "claude-3-7-sonnet-20250219", 1)],
        );
        table.insert(
            "gpt-5.1-codex-max",
            vec![
                member("copilot", "gpt-5.1-codex-max", 1),
                member("codex", "gpt-5.1-codex-max", 2),
            ],
        );
        table
    })
}

fn member(provider: &'static str, model_id: &'static str, priority: u8) -> FamilyMember {
    FamilyMember {
        provider,
        model_id,
        priority,
    }
}

pub fn is_canonical(model: &str) -> bool {
    families().contains_key(model)
}

/// All members of a family, sorted by priority. Empty if unknown.
pub fn family_members(canonical: &str) -> Vec<FamilyMember> {
    let Some(entries) = families().get(canonical) else {
        return Vec::new();
    };
    let mut sorted = entries.clone();
    sorted.sort_by_key(|m| m.priority);
    sorted
}

/// Providers able to serve `canonical`, restricted to `available`, ordered by
/// priority; equal-priority groups are shuffled so identical deployments do
/// not all hammer the same provider first.
pub fn resolve_providers(canonical: &str, available: &[String]) -> Option<Vec<String>> {
    let entries = families().get(canonical)?;

    let mut groups: Vec<(u8, Vec<&'static str>)> = Vec::new();
    for entry in entries {
        if !available.iter().any(|p| p == entry.provider) {
            continue;
        }
        match groups.iter_mut().find(|(priority, _)| *priority == entry.priority) {
            Some((_, members)) => members.push(entry.provider),
            None => groups.push((entry.priority, vec![entry.provider])),
        }
    }
    if groups.is_empty() {
        return None;
    }
    groups.sort_by_key(|(priority, _)| *priority);

    let mut rng = rand::rng();
    let mut result = Vec::new();
    for (_, mut members) in groups {
        if members.len() > 1 {
            members.shuffle(&mut rng);
        }
        result.extend(members.into_iter().map(|p| p.to_string()));
    }
    Some(result)
}

/// Translate a canonical model to the provider-specific ID; identity when no
/// family entry applies.
pub fn translate_model(canonical: &str, provider: &str) -> String {
    if let Some(entries) = families().get(canonical) {
        for entry in entries {
            if entry.provider == provider {
                return entry.model_id.to_string();
            }
        }
    }
    canonical.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_hits_family_and_falls_back_to_identity() {
        assert_eq!(
            translate_model("claude-sonnet-4-5", "claude"),
            "claude-sonnet-4-5-20250929"
        );
        assert_eq!(
            translate_model("claude-sonnet-4-5", "antigravity"),
            "gemini-claude-sonnet-4-5"
        );
        assert_eq!(translate_model("gemini-2.5-pro", "gemini"), "gemini-2.5-pro");
    }

    #[test]
    fn members_sorted_by_priority() {
        let members = family_members("claude-opus-4-5-thinking");
        assert_eq!(members[0].provider, "antigravity");
        assert_eq!(members[1].provider, "claude");
        assert!(family_members("nonexistent").is_empty());
    }

    #[test]
    fn resolve_respects_priority_order() {
        let available = vec!["claude".to_string(), "antigravity".to_string()];
        let providers = resolve_providers("claude-sonnet-4-5", &available).unwrap();
        assert_eq!(providers, vec!["antigravity", "claude"]);
    }

    #[test]
    fn resolve_filters_unavailable_providers() {
        let available = vec!["claude".to_string()];
        let providers = resolve_providers("claude-sonnet-4-5", &available).unwrap();
        assert_eq!(providers, vec!["claude"]);

        assert!(resolve_providers("claude-sonnet-4-5", &[]).is_none());
        assert!(resolve_providers("unknown-model", &available).is_none());
    }
}
