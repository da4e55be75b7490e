//! Configuration for Jupiter.
//!
//! Two YAML layers: a user-wide `~/.jupiter/global_config.yaml` and a
//! per-project `<root>/<basename>.jupiter.yaml`. The project file wins on
//! every key it sets. Missing files produce defaults; malformed files are
//! reported as `validation_error` rather than silently ignored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{JupiterError, Result};

/// Role attached to an API token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Admin,
}

/// A bearer token with its role.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub role: Role,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub tokens: Vec<TokenEntry>,
    /// Master switch for `/run` and `jupiter run`.
    pub allow_run: bool,
    /// Whitelist: prefix match on argv[0], or exact match on the full argv
    /// joined with spaces.
    pub allowed_commands: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub scan_seconds: u64,
    pub analyze_seconds: u64,
    pub run_seconds: u64,
    pub http_idle_seconds: u64,
    pub license_seconds: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            scan_seconds: 600,
            analyze_seconds: 600,
            run_seconds: 300,
            http_idle_seconds: 60,
            license_seconds: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Worker pool size; 0 selects available parallelism.
    pub workers: usize,
    pub parallel_scan: bool,
    pub max_file_size_bytes: u64,
    pub timeouts: TimeoutsConfig,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            parallel_scan: true,
            max_file_size_bytes: crate::types::DEFAULT_MAX_FILE_SIZE,
            timeouts: TimeoutsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugin ids enabled at startup; empty means "all discovered".
    pub enabled_ids: Vec<String>,
    /// Per-plugin config slices handed to `init` through the locator.
    pub per_plugin_overrides: serde_json::Map<String, serde_json::Value>,
}

/// CI gate thresholds; None disables the gate.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    pub fail_on_complexity: Option<u32>,
    pub fail_on_duplication: Option<usize>,
    pub fail_on_unused: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    pub base_url: String,
    pub device_type: String,
    pub timeout_seconds: u64,
    pub device_key: String,
    /// Seconds after the last successful check during which operation
    /// continues in degraded mode.
    pub grace_seconds: u64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            device_type: "server".to_string(),
            timeout_seconds: 5,
            device_key: String::new(),
            grace_seconds: 3600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Ignore globs applied to every scan, before `.jupiterignore`.
    pub ignore_globs: Vec<String>,
    /// Extensions never written to the analysis cache.
    pub volatile_extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_globs: Vec::new(),
            volatile_extensions: vec![
                "tmp".to_string(),
                "log".to_string(),
                "pyc".to_string(),
                "swp".to_string(),
            ],
        }
    }
}

/// Root configuration structure.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JupiterConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub plugins: PluginsConfig,
    pub ci: CiConfig,
    pub license: LicenseConfig,
    pub scan: ScanConfig,
    pub developer_mode: bool,
    pub allow_unsigned_local_plugins: bool,
}

impl JupiterConfig {
    /// Path of the per-project config file: `<root>/<basename>.jupiter.yaml`.
    pub fn project_config_path(root: &Path) -> PathBuf {
        let basename = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        root.join(format!("{basename}.jupiter.yaml"))
    }

    /// Path of the user-wide config file.
    pub fn global_config_path() -> PathBuf {
        user_dir().join("global_config.yaml")
    }

    /// Load config for a project: defaults <- global <- project.
    pub fn load(root: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(JupiterConfig::default())
            .map_err(|e| JupiterError::Internal(e.to_string()))?;
        for path in [Self::global_config_path(), Self::project_config_path(root)] {
            if let Some(layer) = read_yaml_layer(&path)? {
                merge_values(&mut merged, layer);
            }
        }
        serde_json::from_value(merged)
            .map_err(|e| JupiterError::Validation(format!("invalid config: {e}")))
    }

    /// Persist the per-project config file.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = Self::project_config_path(root);
        let text = serde_yaml::to_string(self)?;
        crate::cache::write_atomic(&path, text.as_bytes())
            .map_err(|e| JupiterError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Role for a presented bearer token, if any token matches.
    pub fn role_for_token(&self, token: &str) -> Option<Role> {
        self.security
            .tokens
            .iter()
            .find(|t| t.token == token)
            .map(|t| t.role)
    }

    /// The config slice handed to a plugin's `init`.
    pub fn plugin_slice(&self, plugin_id: &str) -> serde_json::Value {
        self.plugins
            .per_plugin_overrides
            .get(plugin_id)
            .cloned()
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()))
    }
}

/// User-wide Jupiter directory (`~/.jupiter`), honoring `JUPITER_HOME`
/// for tests and containers.
pub fn user_dir() -> PathBuf {
    if let Ok(custom) = std::env::var("JUPITER_HOME") {
        let custom = custom.trim();
        if !custom.is_empty() {
            return PathBuf::from(custom);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".jupiter")
}

fn read_yaml_layer(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| JupiterError::Internal(format!("read {}: {e}", path.display())))?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let yaml: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| JupiterError::Validation(format!("{}: {e}", path.display())))?;
    let json = serde_json::to_value(yaml)
        .map_err(|e| JupiterError::Validation(format!("{}: {e}", path.display())))?;
    Ok(Some(json))
}

/// Deep-merge `overlay` into `base`; objects merge per key, everything
/// else is replaced.
fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = JupiterConfig::default();
        assert_eq!(config.server.port, 8765);
        assert!(!config.security.allow_run);
        assert_eq!(config.performance.timeouts.license_seconds, 5);
        assert!(config.scan.volatile_extensions.contains(&"pyc".to_string()));
        assert!(!config.developer_mode);
    }

    #[test]
    fn project_file_overrides_defaults() {
        let tmp = TempDir::new().expect("tmp dir");
        let root = tmp.path().join("myproj");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(
            root.join("myproj.jupiter.yaml"),
            "server:\n  port: 9100\nsecurity:\n  allow_run: true\n  tokens:\n    - token: t-admin\n      role: admin\n",
        )
        .expect("write config");

        let config = JupiterConfig::load(&root).expect("load");
        assert_eq!(config.server.port, 9100);
        assert!(config.security.allow_run);
        // Untouched keys keep defaults
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.role_for_token("t-admin"), Some(Role::Admin));
        assert_eq!(config.role_for_token("nope"), None);
    }

    #[test]
    fn malformed_yaml_is_a_validation_error() {
        let tmp = TempDir::new().expect("tmp dir");
        let root = tmp.path().join("bad");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("bad.jupiter.yaml"), "server: [not-a-map").expect("write");
        let err = JupiterConfig::load(&root).expect_err("should fail");
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = TempDir::new().expect("tmp dir");
        let root = tmp.path().join("proj");
        std::fs::create_dir_all(&root).expect("mkdir");
        let mut config = JupiterConfig::default();
        config.ci.fail_on_complexity = Some(10);
        config.save(&root).expect("save");

        let loaded = JupiterConfig::load(&root).expect("load");
        assert_eq!(loaded.ci.fail_on_complexity, Some(10));
    }

    #[test]
    fn roles_order_admin_above_viewer() {
        assert!(Role::Admin > Role::Viewer);
    }
}
