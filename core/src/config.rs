//! Configuration for an interception context.
//!
//! Values come from serde (any format the caller likes) or from the process
//! environment. Unparsable environment values fall back to the defaults with
//! a warning rather than failing startup: interception must never be what
//! breaks a page.

use serde::{Deserialize, Serialize};

use crate::interposer::InstallMode;

/// URL fragment that exempts a request from interception.
pub const DEFAULT_BYPASS_MARKER: &str = "__nf_internal__";

pub const ENV_BYPASS_MARKER: &str = "NETFILTER_BYPASS_MARKER";
pub const ENV_INSTALL_MODE: &str = "NETFILTER_INSTALL_MODE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Requests whose URL contains this are passed straight through.
    /// An empty marker disables the bypass.
    pub bypass_marker: String,
    pub install_mode: InstallMode,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            bypass_marker: DEFAULT_BYPASS_MARKER.to_string(),
            install_mode: InstallMode::default(),
        }
    }
}

impl InterceptConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(marker) = lookup(ENV_BYPASS_MARKER) {
            config.bypass_marker = marker;
        }
        if let Some(mode) = lookup(ENV_INSTALL_MODE) {
            match parse_token::<InstallMode>(&mode) {
                Some(mode) => config.install_mode = mode,
                None => tracing::warn!(value = %mode, "ignoring unknown {ENV_INSTALL_MODE}"),
            }
        }
        config
    }
}

/// Parse a snake_case enum token through its serde representation.
pub(crate) fn parse_token<T: serde::de::DeserializeOwned>(token: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(token.trim().to_ascii_lowercase())).ok()
}
