use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    secrecy::Secret,
    tracing::{debug, info, warn},
};

use crate::{
    env_subst::substitute_env,
    schema::{BindingConfig, DEFAULT_ACCOUNT, RelayConfig},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "threadrelay.toml",
    "threadrelay.yaml",
    "threadrelay.yml",
    "threadrelay.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./threadrelay.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/threadrelay/threadrelay.{toml,yaml,yml,json}` (user-global)
///
/// Returns `RelayConfig::default()` if no config file is found.
pub fn discover_and_load() -> anyhow::Result<RelayConfig> {
    match find_config_file() {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            load_config(&path)
        },
        None => {
            debug!("no config file found, using defaults");
            Ok(RelayConfig::default())
        },
    }
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/threadrelay/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "threadrelay").map(|d| d.config_dir().to_path_buf())
}

/// Returns the user data directory, where the database lives by default.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "threadrelay")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Database file: the configured path, else `threadrelay.db` in [`data_dir`].
pub fn database_path(config: &RelayConfig) -> PathBuf {
    config
        .database
        .path
        .clone()
        .unwrap_or_else(|| data_dir().join("threadrelay.db"))
}

/// Overlay the environment on a loaded config.
///
/// Understands the single-bot layout of older deployments: `BOT_TOKEN`
/// becomes the token of the `default` account, and every chat in
/// `SOURCE_CHAT_IDS` is bound to `DEST_CHAT_ID` unless already bound.
/// `PORT` overrides the HTTP port.
pub fn apply_env_overrides(config: RelayConfig) -> RelayConfig {
    apply_env_overrides_with(config, |name| std::env::var(name).ok())
}

fn apply_env_overrides_with(
    mut config: RelayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> RelayConfig {
    if let Some(token) = lookup("BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
        let account = config
            .accounts
            .entry(DEFAULT_ACCOUNT.to_string())
            .or_default();
        if !account.has_token() {
            account.token = Some(Secret::new(token));
        }
    }

    if let Some(port) = lookup("PORT") {
        match port.trim().parse() {
            Ok(port) => config.server.port = port,
            Err(e) => warn!(value = %port, error = %e, "ignoring invalid PORT"),
        }
    }

    let destination = lookup("DEST_CHAT_ID").and_then(|raw| match raw.trim().parse::<i64>() {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(value = %raw, error = %e, "ignoring invalid DEST_CHAT_ID");
            None
        },
    });
    if let (Some(destination), Some(sources)) = (destination, lookup("SOURCE_CHAT_IDS")) {
        for origin in parse_chat_list(&sources) {
            if config.bindings.iter().any(|b| b.origin_chat_id == origin) {
                continue;
            }
            config.bindings.push(BindingConfig {
                account: DEFAULT_ACCOUNT.into(),
                origin_chat_id: origin,
                posts_chat_id: destination,
                comments_chat_id: None,
                companion_chat_id: None,
            });
        }
    }

    config
}

/// Parse `[-1001, -1002]`, `-1001,-1002` or whitespace-separated ids.
fn parse_chat_list(raw: &str) -> Vec<i64> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(value = s, "ignoring invalid chat id in SOURCE_CHAT_IDS");
                None
            },
        })
        .collect()
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
