//! Plugin manifest parsing and validation.
//!
//! A plugin directory carries a `plugin.json` manifest. Validation
//! rejects schema violations, bad compatibility ranges, and declared
//! entrypoint files that do not exist; duplicate ids are rejected at the
//! bridge level where the whole set is visible.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::permissions::{Permission, SignatureBlob, TrustLevel};
use crate::error::{JupiterError, Result};
use crate::types::JUPITER_VERSION;

pub const MANIFEST_FILE: &str = "plugin.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    Core,
    System,
    Tool,
}

/// Dependency on another plugin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencySpec {
    pub id: String,
    /// Version range the dependency must satisfy (`*`, `1.2.3`, `>=1.2`,
    /// `^1.2`).
    #[serde(default = "any_version")]
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

fn any_version() -> String {
    "*".to_string()
}

/// CLI verb a plugin contributes; mounted as `p:<plugin_id>:<verb>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CliContribution {
    pub verb: String,
    #[serde(default)]
    pub about: String,
}

/// UI panel descriptor forwarded to the web UI.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UiPanel {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub version: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    /// Host compatibility range.
    #[serde(default = "any_version")]
    pub compatibility: String,
    /// Entrypoint name -> file relative to the plugin dir.
    #[serde(default)]
    pub entrypoints: BTreeMap<String, String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Event topics (wire names) the plugin subscribes to.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub config_schema_version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Trust the author claims; actual trust comes from the signature.
    #[serde(default)]
    pub declared_trust: Option<TrustLevel>,
    #[serde(default)]
    pub signature: Option<SignatureBlob>,
    #[serde(default)]
    pub cli: Vec<CliContribution>,
    /// HTTP route prefix under `/plugins/<id>/...`.
    #[serde(default)]
    pub api_prefix: Option<String>,
    #[serde(default)]
    pub ui_panels: Vec<UiPanel>,
}

const KNOWN_ENTRYPOINTS: &[&str] = &["init", "shutdown", "health", "metrics", "api", "cli", "ui"];

impl PluginManifest {
    /// Parse and validate the manifest in `plugin_dir`.
    pub fn load(plugin_dir: &Path) -> Result<Self> {
        let path = plugin_dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| JupiterError::Parse(format!("{}: {e}", path.display())))?;
        let manifest: PluginManifest = serde_json::from_str(&text)
            .map_err(|e| JupiterError::Parse(format!("{}: {e}", path.display())))?;
        manifest.validate(plugin_dir)?;
        Ok(manifest)
    }

    pub fn validate(&self, plugin_dir: &Path) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(JupiterError::Parse("manifest id is empty".to_string()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(JupiterError::Parse(format!(
                "manifest id has invalid characters: {}",
                self.id
            )));
        }
        if parse_version(&self.version).is_none() {
            return Err(JupiterError::Parse(format!(
                "plugin {}: bad version {:?}",
                self.id, self.version
            )));
        }
        if !range_is_well_formed(&self.compatibility) {
            return Err(JupiterError::Parse(format!(
                "plugin {}: bad compatibility range {:?}",
                self.id, self.compatibility
            )));
        }
        if !version_in_range(JUPITER_VERSION, &self.compatibility) {
            return Err(JupiterError::Parse(format!(
                "plugin {}: incompatible with jupiter {JUPITER_VERSION} (wants {})",
                self.id, self.compatibility
            )));
        }
        for (name, file) in &self.entrypoints {
            if !KNOWN_ENTRYPOINTS.contains(&name.as_str()) {
                return Err(JupiterError::Parse(format!(
                    "plugin {}: unknown entrypoint {name:?}",
                    self.id
                )));
            }
            if !plugin_dir.join(file).is_file() {
                return Err(JupiterError::Parse(format!(
                    "plugin {}: entrypoint {name} declares missing file {file}",
                    self.id
                )));
            }
        }
        for topic in &self.subscriptions {
            if !crate::events::Topic::ALL.iter().any(|t| t.as_str() == topic) {
                return Err(JupiterError::Parse(format!(
                    "plugin {}: unknown topic {topic:?}",
                    self.id
                )));
            }
        }
        for dependency in &self.dependencies {
            if !range_is_well_formed(&dependency.version) {
                return Err(JupiterError::Parse(format!(
                    "plugin {}: bad dependency range {:?} on {}",
                    self.id, dependency.version, dependency.id
                )));
            }
        }
        Ok(())
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.trim().splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

fn range_is_well_formed(range: &str) -> bool {
    let range = range.trim();
    if range == "*" {
        return true;
    }
    let body = range
        .strip_prefix(">=")
        .or_else(|| range.strip_prefix('^'))
        .unwrap_or(range);
    parse_version(body).is_some()
}

/// Minimal range matcher: `*`, exact `a.b.c`, `>=a.b.c`, `^a.b.c`
/// (same major, at least the given minor/patch).
pub fn version_in_range(version: &str, range: &str) -> bool {
    let Some(v) = parse_version(version) else {
        return false;
    };
    let range = range.trim();
    if range == "*" {
        return true;
    }
    if let Some(body) = range.strip_prefix(">=") {
        return parse_version(body).map(|min| v >= min).unwrap_or(false);
    }
    if let Some(body) = range.strip_prefix('^') {
        return parse_version(body)
            .map(|min| v.0 == min.0 && v >= min)
            .unwrap_or(false);
    }
    parse_version(range).map(|exact| v == exact).unwrap_or(false)
}
