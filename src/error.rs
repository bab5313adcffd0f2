//! Error types for the hair system.
//!
//! Resource creation and asset validation return `HairResult`. Per-frame
//! degradation (missing bone matrices, a missing collision mesh, capacity
//! overflow) is logged and never raised.

use crate::device::ResourceState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HairError {
    #[error("invalid hair asset '{asset}': {reason}")]
    InvalidAsset { asset: String, reason: String },

    #[error("invalid collision mesh '{mesh}': {reason}")]
    InvalidMesh { mesh: String, reason: String },

    #[error("failed to create {kind} '{label}': {reason}")]
    ResourceCreation {
        kind: &'static str,
        label: String,
        reason: String,
    },

    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },

    #[error("invalid state transition on '{label}': expected {expected:?}, tracked {actual:?}")]
    InvalidTransition {
        label: String,
        expected: ResourceState,
        actual: ResourceState,
    },

    #[error("shader preprocessing failed for '{shader}': {reason}")]
    Shader { shader: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("readback of '{label}' failed: {reason}")]
    Readback { label: String, reason: String },

    #[error("no GPU adapter available: {0}")]
    NoAdapter(String),

    #[error("{component}: {message}")]
    System { component: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type HairResult<T> = Result<T, HairError>;

impl HairError {
    pub fn invalid_asset(asset: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAsset {
            asset: asset.into(),
            reason: reason.into(),
        }
    }

    pub fn resource_creation(
        kind: &'static str,
        label: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ResourceCreation {
            kind,
            label: label.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_handle(kind: &'static str, id: u32) -> Self {
        Self::UnknownHandle { kind, id }
    }
}

impl From<toml::de::Error> for HairError {
    fn from(error: toml::de::Error) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<toml::ser::Error> for HairError {
    fn from(error: toml::ser::Error) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<serde_json::Error> for HairError {
    fn from(error: serde_json::Error) -> Self {
        Self::Config(error.to_string())
    }
}

/// Attaches a component context to foreign errors and missing values.
pub trait HairErrorContext<T> {
    fn hair_context(self, context: &str) -> HairResult<T>;
}

impl<T> HairErrorContext<T> for Option<T> {
    fn hair_context(self, context: &str) -> HairResult<T> {
        self.ok_or_else(|| HairError::System {
            component: "hair".to_string(),
            message: format!("{} is missing", context),
        })
    }
}

impl<T, E> HairErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn hair_context(self, context: &str) -> HairResult<T> {
        self.map_err(|e| HairError::System {
            component: "hair".to_string(),
            message: format!("{}: {}", context, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_context_names_the_missing_value() {
        let missing: Option<u32> = None;
        let err = missing.hair_context("bone palette").unwrap_err();
        assert!(err.to_string().contains("bone palette"));
    }

    #[test]
    fn toml_errors_become_config_errors() {
        let parsed: Result<toml::Value, _> = toml::from_str("= broken");
        let err: HairError = parsed.unwrap_err().into();
        assert!(matches!(err, HairError::Config(_)));
    }
}
