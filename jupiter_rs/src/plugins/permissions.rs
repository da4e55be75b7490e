//! Permission model, signature verification, trust levels and the
//! append-only audit log.
//!
//! Enforcement is cooperative: services reached through the locator
//! check `plugin_has(permission)`; a plugin bypassing the locator is out
//! of contract, not out of reach (see the isolation notes in DESIGN.md).

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Role;
use crate::error::{JupiterError, Result};

/// Closed permission set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    FsRead,
    FsWrite,
    RunCommands,
    NetworkOutbound,
    AccessLicense,
    ConfigAccess,
    EmitEvents,
}

/// Trust derived from the signature and signer key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Official,
    Verified,
    Community,
}

/// Plugin installation policy mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    Strict,
    Permissive,
    Dev,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallDecision {
    Allow,
    AllowWithWarning,
    Refuse,
}

/// Signature blob: signer key id + digest over the canonical hash of
/// the plugin's files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureBlob {
    pub key_id: String,
    pub digest: String,
}

/// Registered signer keys.
#[derive(Clone, Debug, Default)]
pub struct TrustedKeys {
    pub official: HashSet<String>,
    pub verified: HashSet<String>,
}

impl TrustedKeys {
    pub fn builtin() -> Self {
        let mut official = HashSet::new();
        official.insert("jupiter-core".to_string());
        Self {
            official,
            verified: HashSet::new(),
        }
    }
}

/// Canonical digest of a plugin directory: sha256 over the sorted
/// project-relative paths and file bytes. The manifest itself is
/// excluded so signing can embed the blob in it.
pub fn canonical_digest(plugin_dir: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = Vec::new();
    collect_files(plugin_dir, plugin_dir, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for rel in &files {
        if rel.file_name().is_some_and(|n| n == "plugin.json") {
            continue;
        }
        hasher.update(rel.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update(b"\0");
        hasher.update(std::fs::read(plugin_dir.join(rel))?);
        hasher.update(b"\0");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else if path.is_file() {
            out.push(path.strip_prefix(base).unwrap_or(&path).to_path_buf());
        }
    }
    Ok(())
}

/// Derive the trust level for a plugin directory. A missing or
/// non-matching signature is `community`.
pub fn trust_level(
    signature: Option<&SignatureBlob>,
    plugin_dir: &Path,
    keys: &TrustedKeys,
) -> TrustLevel {
    let Some(signature) = signature else {
        return TrustLevel::Community;
    };
    let digest = match canonical_digest(plugin_dir) {
        Ok(d) => d,
        Err(_) => return TrustLevel::Community,
    };
    if digest != signature.digest {
        return TrustLevel::Community;
    }
    if keys.official.contains(&signature.key_id) {
        TrustLevel::Official
    } else if keys.verified.contains(&signature.key_id) {
        TrustLevel::Verified
    } else {
        TrustLevel::Community
    }
}

/// Installation policy matrix.
pub fn install_decision(
    mode: InstallMode,
    trust: TrustLevel,
    unsigned_local: bool,
    allow_unsigned_local_plugins: bool,
) -> InstallDecision {
    if unsigned_local && trust == TrustLevel::Community {
        return if allow_unsigned_local_plugins {
            InstallDecision::AllowWithWarning
        } else {
            InstallDecision::Refuse
        };
    }
    match (mode, trust) {
        (_, TrustLevel::Official) | (_, TrustLevel::Verified) => InstallDecision::Allow,
        (InstallMode::Strict, TrustLevel::Community) => InstallDecision::Refuse,
        (InstallMode::Permissive, TrustLevel::Community)
        | (InstallMode::Dev, TrustLevel::Community) => InstallDecision::AllowWithWarning,
    }
}

/// Append-only audit log at `<root>/.jupiter/audit.log`, one JSON line
/// per privileged operation.
pub struct AuditLog {
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub role: Option<Role>,
    pub token_id: Option<String>,
    pub action: String,
    pub target: String,
    pub result: String,
}

impl AuditLog {
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(".jupiter").join("audit.log"),
        }
    }

    pub fn append(
        &self,
        role: Option<Role>,
        token_id: Option<&str>,
        action: &str,
        target: &str,
        result: &str,
    ) -> Result<()> {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            role,
            token_id: token_id.map(str::to_string),
            action: action.to_string(),
            target: target.to_string(),
            result: result.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| JupiterError::Internal(format!("audit log: {e}")))?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)
            .map_err(|e| JupiterError::Internal(format!("audit log: {e}")))?;
        Ok(())
    }

    /// Parsed entries, oldest first (diagnostics only).
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Ok(Vec::new());
        };
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
