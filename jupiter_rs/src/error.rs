//! Error taxonomy shared by the engine, the API facade and the CLI.
//!
//! Every variant carries a stable wire code; the API facade maps it to
//! the HTTP envelope `{error:{code,message,details}}`.

use thiserror::Error;

/// Typed error for all engine operations.
#[derive(Debug, Error)]
pub enum JupiterError {
    /// Bad input from a caller (4xx).
    #[error("{0}")]
    Validation(String),
    /// Missing/invalid token or insufficient role.
    #[error("{0}")]
    Auth(String),
    /// Snapshot/plugin/path does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Run disallowed, permission missing, or license gating.
    #[error("{0}")]
    PolicyDenied(String),
    /// Malformed source or manifest; surfaced per file/plugin, not fatal.
    #[error("parse error: {0}")]
    Parse(String),
    /// Discarded cache entry; logged, never surfaced to API callers.
    #[error("cache error: {0}")]
    Cache(String),
    /// Remote backend unreachable or timed out.
    #[error("connector error: {0}")]
    Connector(String),
    /// Licensing service reachable but says invalid.
    #[error("license error: {0}")]
    License(String),
    /// Uncaught condition; always logged with a correlation id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl JupiterError {
    /// Stable wire code used in the HTTP error envelope and CLI JSON.
    pub fn code(&self) -> &'static str {
        match self {
            JupiterError::Validation(_) => "validation_error",
            JupiterError::Auth(_) => "auth_error",
            JupiterError::NotFound(_) => "not_found",
            JupiterError::PolicyDenied(_) => "policy_denied",
            JupiterError::Parse(_) => "parse_error",
            JupiterError::Cache(_) => "cache_error",
            JupiterError::Connector(_) => "connector_error",
            JupiterError::License(_) => "license_error",
            JupiterError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the API facade responds with.
    pub fn http_status(&self) -> u16 {
        match self {
            JupiterError::Validation(_) => 400,
            JupiterError::Auth(_) => 403,
            JupiterError::NotFound(_) => 404,
            JupiterError::PolicyDenied(_) => 403,
            JupiterError::Parse(_) => 422,
            JupiterError::Cache(_) => 500,
            JupiterError::Connector(_) => 502,
            JupiterError::License(_) => 403,
            JupiterError::Internal(_) => 500,
        }
    }

    /// CLI exit code: 1 domain failure, 2 bad usage, 3 connector/network.
    pub fn exit_code(&self) -> i32 {
        match self {
            JupiterError::Validation(_) => 2,
            JupiterError::Connector(_) => 3,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for JupiterError {
    fn from(err: std::io::Error) -> Self {
        JupiterError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for JupiterError {
    fn from(err: serde_json::Error) -> Self {
        JupiterError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for JupiterError {
    fn from(err: serde_yaml::Error) -> Self {
        JupiterError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JupiterError>;
