//! Sign-in configuration loaded from TOML or built in code.
//!
//! ```toml
//! default_handler_name = "graph"
//! auto_sign_in = true
//!
//! [handlers.graph]
//! connection_name = "graph-connection"
//! title = "Sign in to Microsoft Graph"
//! obo_connection_name = "graph-obo"
//! obo_scopes = ["User.Read"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PENDING_FLOW_TTL_SECONDS: u64 = 900;
pub const DEFAULT_FLOW_TIMEOUT_SECONDS: u64 = 900;
const DEFAULT_SIGN_IN_TITLE: &str = "Sign in";
const DEFAULT_SIGN_IN_TEXT: &str = "Please sign in to continue.";

fn default_true() -> bool {
    true
}

fn default_pending_flow_ttl_seconds() -> u64 {
    DEFAULT_PENDING_FLOW_TTL_SECONDS
}

fn default_flow_timeout_seconds() -> u64 {
    DEFAULT_FLOW_TIMEOUT_SECONDS
}

fn default_sign_in_title() -> String {
    DEFAULT_SIGN_IN_TITLE.to_string()
}

fn default_sign_in_text() -> String {
    DEFAULT_SIGN_IN_TEXT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `AuthorizationSettings` used across turnstile components.
pub struct AuthorizationSettings {
    #[serde(default)]
    pub default_handler_name: Option<String>,
    #[serde(default = "default_true")]
    pub auto_sign_in: bool,
    #[serde(default = "default_pending_flow_ttl_seconds")]
    pub pending_flow_ttl_seconds: u64,
    /// Template with `{handler}` and `{cause}` placeholders.
    #[serde(default)]
    pub sign_in_failure_message: Option<String>,
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `HandlerSettings` used across turnstile components.
pub struct HandlerSettings {
    pub connection_name: String,
    #[serde(default = "default_sign_in_title")]
    pub title: String,
    #[serde(default = "default_sign_in_text")]
    pub text: String,
    #[serde(default)]
    pub obo_connection_name: Option<String>,
    #[serde(default)]
    pub obo_scopes: Vec<String>,
    #[serde(default = "default_flow_timeout_seconds")]
    pub flow_timeout_seconds: u64,
}

impl HandlerSettings {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
            title: default_sign_in_title(),
            text: default_sign_in_text(),
            obo_connection_name: None,
            obo_scopes: Vec::new(),
            flow_timeout_seconds: DEFAULT_FLOW_TIMEOUT_SECONDS,
        }
    }
}

impl AuthorizationSettings {
    pub fn new(handlers: BTreeMap<String, HandlerSettings>) -> Self {
        Self {
            default_handler_name: None,
            auto_sign_in: true,
            pending_flow_ttl_seconds: DEFAULT_PENDING_FLOW_TTL_SECONDS,
            sign_in_failure_message: None,
            handlers,
        }
    }

    /// Configured default, or the first handler by name.
    pub fn resolved_default_handler_name(&self) -> Option<&str> {
        self.default_handler_name
            .as_deref()
            .or_else(|| self.handlers.keys().next().map(String::as_str))
    }
}

pub fn load_authorization_settings(path: &Path) -> Result<AuthorizationSettings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read authorization settings {}", path.display()))?;
    parse_authorization_settings(&raw)
        .with_context(|| format!("invalid authorization settings {}", path.display()))
}

pub fn parse_authorization_settings(raw: &str) -> Result<AuthorizationSettings> {
    let mut parsed = toml::from_str::<AuthorizationSettings>(raw)
        .context("failed to parse authorization settings")?;
    normalize_authorization_settings(&mut parsed)?;
    Ok(parsed)
}

pub fn normalize_authorization_settings(settings: &mut AuthorizationSettings) -> Result<()> {
    if settings.handlers.is_empty() {
        bail!("authorization settings must declare at least one handler");
    }
    let mut seen = HashSet::new();
    for (name, handler) in settings.handlers.iter_mut() {
        let normalized = name.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            bail!("handler names must not be blank");
        }
        if !seen.insert(normalized) {
            bail!("duplicate handler name '{name}' (names are case-insensitive)");
        }
        handler.connection_name = handler.connection_name.trim().to_string();
        if handler.connection_name.is_empty() {
            bail!("handler '{name}' must set a non-empty connection_name");
        }
        handler.obo_connection_name = handler
            .obo_connection_name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        if handler.obo_scopes.iter().any(|scope| scope.trim().is_empty()) {
            bail!("handler '{name}' declares a blank obo scope");
        }
        if handler.flow_timeout_seconds == 0 {
            bail!("handler '{name}' flow_timeout_seconds must be greater than 0");
        }
    }
    settings.default_handler_name = settings
        .default_handler_name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if let Some(default_name) = settings.default_handler_name.as_deref() {
        if !settings.handlers.contains_key(default_name) {
            bail!("default handler '{default_name}' is not declared under [handlers]");
        }
    }
    Ok(())
}
