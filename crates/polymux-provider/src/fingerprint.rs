//! Outgoing client fingerprints.
//!
//! Each credential presents one consistent CLI identity to upstream,
//! chosen deterministically from a preset list by a hash of the auth ID.
//! Per-field overrides come from auth attributes, then metadata.

use polymux_auth::Auth;
use polymux_common::fnv32a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeFingerprint {
    pub user_agent: &'static str,
    /// X-Stainless-Package-Version
    pub package_version: &'static str,
    /// X-Stainless-Runtime-Version (Node.js version)
    pub runtime_version: &'static str,
    /// X-Stainless-Os
    pub os: &'static str,
    /// X-Stainless-Arch
    pub arch: &'static str,
}

const PRESETS: &[ClaudeFingerprint] = &[
    ClaudeFingerprint {
        user_agent: "claude-cli/1.0.83 (external, cli)",
        package_version: "0.55.1",
        runtime_version: "v24.3.0",
        os: "MacOS",
        arch: "arm64",
    },
    ClaudeFingerprint {
        user_agent: "claude-cli/1.0.83 (external, cli)",
        package_version: "0.55.1",
        runtime_version: "v22.12.0",
        os: "Linux",
        arch: "x64",
    },
    ClaudeFingerprint {
        user_agent: "claude-cli/1.0.82 (external, cli)",
        package_version: "0.54.2",
        runtime_version: "v22.17.0",
        os: "MacOS",
        arch: "x64",
    },
    ClaudeFingerprint {
        user_agent: "claude-cli/1.0.80 (external, cli)",
        package_version: "0.53.0",
        runtime_version: "v20.18.0",
        os: "Windows",
        arch: "x64",
    },
    ClaudeFingerprint {
        user_agent: "claude-cli/1.0.83 (external, cli)",
        package_version: "0.55.1",
        runtime_version: "v22.11.0",
        os: "Linux",
        arch: "arm64",
    },
];

/// Resolved header values after overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFingerprint {
    pub user_agent: String,
    pub package_version: String,
    pub runtime_version: String,
    pub os: String,
    pub arch: String,
}

/// Stable per auth ID: key rotation must not change the presented identity.
pub fn preset_for(auth_id: &str) -> &'static ClaudeFingerprint {
    if auth_id.is_empty() {
        return &PRESETS[0];
    }
    let idx = fnv32a(auth_id) as usize % PRESETS.len();
    &PRESETS[idx]
}

pub fn resolve(auth: &Auth) -> ResolvedFingerprint {
    let preset = preset_for(&auth.id);
    let mut resolved = ResolvedFingerprint {
        user_agent: preset.user_agent.to_string(),
        package_version: preset.package_version.to_string(),
        runtime_version: preset.runtime_version.to_string(),
        os: preset.os.to_string(),
        arch: preset.arch.to_string(),
    };

    if let Some(ua) = override_value(auth, "user_agent") {
        resolved.user_agent = ua;
    }
    if let Some(os) = override_value(auth, "stainless_os") {
        resolved.os = os;
    }
    if let Some(arch) = override_value(auth, "stainless_arch") {
        resolved.arch = arch;
    }
    if let Some(version) = override_value(auth, "stainless_package_version") {
        resolved.package_version = version;
    }
    if let Some(version) = override_value(auth, "stainless_runtime_version") {
        resolved.runtime_version = version;
    }
    resolved
}

fn override_value(auth: &Auth, key: &str) -> Option<String> {
    if let Some(value) = auth.attributes.get(key) {
        if !value.trim().is_empty() {
            return Some(value.clone());
        }
    }
    auth.metadata
        .extra
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
}

pub fn apply_headers(headers: &mut Vec<(String, String)>, fp: &ResolvedFingerprint) {
    crate::header_set(headers, "User-Agent", fp.user_agent.clone());
    crate::header_set(headers, "X-Stainless-Package-Version", fp.package_version.clone());
    crate::header_set(headers, "X-Stainless-Runtime-Version", fp.runtime_version.clone());
    crate::header_set(headers, "X-Stainless-Os", fp.os.clone());
    crate::header_set(headers, "X-Stainless-Arch", fp.arch.clone());
    crate::header_set(headers, "X-Stainless-Lang", "js");
    crate::header_set(headers, "X-Stainless-Runtime", "node");
}
