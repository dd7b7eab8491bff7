//! Config schema for the relay binary.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Account id used when bindings do not name one.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub database: DatabaseConfig,
    pub governor: GovernorConfig,
    pub dedup: DedupConfig,
    pub delivery: DeliverySettings,
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    /// Platform accounts keyed by id; bindings refer to them by that id.
    pub accounts: BTreeMap<String, AccountConfig>,
    pub bindings: Vec<BindingConfig>,
}

/// SQLite storage for the Identity Map and the outcome log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `threadrelay.db` in the user data dir.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Added on top of the wait the platform asks for.
    pub safety_margin_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            safety_margin_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Inbound events remembered for duplicate suppression.
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Delivery fallback chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Try forwarding/copying by reference before re-uploading.
    pub native_transfer: bool,
    /// Prefix recreated content with `🚀 {chat} — {sender}:`.
    pub attribution_header: bool,
    /// Post a notice into the destination when nothing could be delivered.
    pub failure_notice: bool,
    /// Text for media that could only be relayed as text. `{kind}` is
    /// replaced with the media kind.
    pub placeholder_text: String,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            native_transfer: true,
            attribution_header: true,
            failure_notice: true,
            placeholder_text: "📎 {kind} could not be relayed".into(),
        }
    }
}

/// Keep-alive and health HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    /// Address to bind to. Defaults to "0.0.0.0" so hosting health checks
    /// can reach it.
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".into(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install a Prometheus recorder and serve `/metrics`.
    pub enabled: bool,
    /// Labels added to every metric.
    pub labels: HashMap<String, String>,
}

/// One platform account (bot) the relay connects as.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<Secret<String>>,
    /// Long-polling timeout passed to `getUpdates`.
    pub poll_timeout_secs: u32,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            token: None,
            poll_timeout_secs: 30,
        }
    }
}

impl AccountConfig {
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(Secret::new(token.into())),
            ..Self::default()
        }
    }

    /// Whether a non-blank token is configured.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().trim().is_empty())
    }
}

/// An origin chat and where its content is relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    #[serde(default = "default_account")]
    pub account: String,
    pub origin_chat_id: i64,
    /// Receives top-level posts.
    pub posts_chat_id: i64,
    /// Receives thread replies. Falls back to `posts_chat_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments_chat_id: Option<i64>,
    /// Discussion chat of the origin. Discovered from the platform when
    /// omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion_chat_id: Option<i64>,
}

fn default_account() -> String {
    DEFAULT_ACCOUNT.into()
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
