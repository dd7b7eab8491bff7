//! Configuration validation.
//!
//! Checks a config file against the known schema (flagging unknown or
//! misspelled keys), then checks the parsed config for bindings that cannot
//! work: unknown accounts, missing tokens, chats relaying into themselves.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use crate::schema::RelayConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "account",
    /// "binding", "dedup", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "bindings[0].posts_chat_id"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} [{}] {}", self.severity, self.category, self.message)
        } else {
            write!(
                f,
                "{} [{}] {}: {}",
                self.severity, self.category, self.path, self.message
            )
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

/// Expected shape of the configuration.
enum KnownKeys {
    /// A struct with fixed field names.
    Struct(HashMap<&'static str, KnownKeys>),
    /// A map with dynamic keys (accounts, labels) whose values have a known
    /// shape.
    Map(Box<KnownKeys>),
    /// An array of typed items.
    Array(Box<KnownKeys>),
    /// Scalar value: stop recursion.
    Leaf,
}

/// Mirror of every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Map, Struct};

    Struct(HashMap::from([
        ("database", Struct(HashMap::from([("path", Leaf)]))),
        (
            "governor",
            Struct(HashMap::from([("safety_margin_ms", Leaf)])),
        ),
        ("dedup", Struct(HashMap::from([("capacity", Leaf)]))),
        (
            "delivery",
            Struct(HashMap::from([
                ("native_transfer", Leaf),
                ("attribution_header", Leaf),
                ("failure_notice", Leaf),
                ("placeholder_text", Leaf),
            ])),
        ),
        (
            "server",
            Struct(HashMap::from([
                ("enabled", Leaf),
                ("bind", Leaf),
                ("port", Leaf),
            ])),
        ),
        (
            "metrics",
            Struct(HashMap::from([
                ("enabled", Leaf),
                ("labels", Map(Box::new(Leaf))),
            ])),
        ),
        (
            "accounts",
            Map(Box::new(Struct(HashMap::from([
                ("token", Leaf),
                ("poll_timeout_secs", Leaf),
            ])))),
        ),
        (
            "bindings",
            Array(Box::new(Struct(HashMap::from([
                ("account", Leaf),
                ("origin_chat_id", Leaf),
                ("posts_chat_id", Leaf),
                ("comments_chat_id", Leaf),
                ("companion_chat_id", Leaf),
            ])))),
        ),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at `path`, or the discovered config file when
/// `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let format = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("toml")
        .to_string();
    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) => validate_str(&crate::env_subst::substitute_env(&content), &format),
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate raw config text in `format` ("toml", "yaml"/"yml", "json").
#[must_use]
pub fn validate_str(raw: &str, format: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    // 1. Syntax
    let value = match parse_value(raw, format) {
        Ok(v) => v,
        Err(message) => {
            diagnostics.push(Diagnostic::new(Severity::Error, "syntax", "", message));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 2. Unknown fields
    check_unknown_fields(&value, &build_schema_map(), "", &mut diagnostics);

    // 3. Types, then semantics on the parsed config
    match serde_json::from_value::<RelayConfig>(value) {
        Ok(config) => diagnostics.extend(validate_config(&config).diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn parse_value(raw: &str, format: &str) -> Result<serde_json::Value, String> {
    match format {
        "toml" => toml::from_str::<toml::Value>(raw)
            .map_err(|e| format!("TOML syntax error: {e}"))
            .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str::<serde_json::Value>(raw)
            .map(|v| if v.is_null() { serde_json::json!({}) } else { v })
            .map_err(|e| format!("YAML syntax error: {e}")),
        "json" => serde_json::from_str(raw).map_err(|e| format!("JSON syntax error: {e}")),
        other => Err(format!("unsupported config format: .{other}")),
    }
}

/// Walk the value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &serde_json::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let child_path = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };

    match (value, schema) {
        (serde_json::Value::Object(table), KnownKeys::Struct(fields)) => {
            let known: Vec<&str> = fields.keys().copied().collect();
            for (key, child) in table {
                let path = child_path(key);
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child, child_schema, &path, diagnostics);
                    continue;
                }
                let message = match suggest(key, &known, 3) {
                    Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                    None => "unknown field".to_string(),
                };
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "unknown-field",
                    path,
                    message,
                ));
            }
        },
        (serde_json::Value::Object(table), KnownKeys::Map(value_schema)) => {
            for (key, child) in table {
                check_unknown_fields(child, value_schema, &child_path(key), diagnostics);
            }
        },
        (serde_json::Value::Array(items), KnownKeys::Array(item_schema)) => {
            for (i, item) in items.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        // Type mismatches are reported by deserialization.
        _ => {},
    }
}

/// Semantic checks on a parsed (and env-overridden) config.
#[must_use]
pub fn validate_config(config: &RelayConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();

    if config.bindings.is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "binding",
            "bindings",
            "no bindings configured; nothing will be relayed",
        ));
    }

    if config.dedup.capacity == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "dedup",
            "dedup.capacity",
            "capacity 0 is treated as 1",
        ));
    }

    let mut used_accounts = HashSet::new();
    let mut origins = HashSet::new();
    for (i, binding) in config.bindings.iter().enumerate() {
        let path = format!("bindings[{i}]");
        used_accounts.insert(binding.account.as_str());

        if !config.accounts.contains_key(&binding.account) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "account",
                format!("{path}.account"),
                format!("unknown account \"{}\"", binding.account),
            ));
        }
        if binding.posts_chat_id == 0 {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "binding",
                format!("{path}.posts_chat_id"),
                "posts destination is required",
            ));
        }
        if binding.posts_chat_id == binding.origin_chat_id
            || binding.comments_chat_id == Some(binding.origin_chat_id)
        {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "binding",
                path.clone(),
                format!("chat {} cannot relay into itself", binding.origin_chat_id),
            ));
        }
        if !origins.insert(binding.origin_chat_id) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "binding",
                format!("{path}.origin_chat_id"),
                format!("chat {} is bound more than once", binding.origin_chat_id),
            ));
        }
        if binding.comments_chat_id == Some(binding.posts_chat_id) {
            diagnostics.push(Diagnostic::new(
                Severity::Info,
                "binding",
                format!("{path}.comments_chat_id"),
                "same as posts_chat_id; can be omitted",
            ));
        }
    }

    for (id, account) in &config.accounts {
        let path = format!("accounts.{id}");
        if !used_accounts.contains(id.as_str()) {
            diagnostics.push(Diagnostic::new(
                Severity::Info,
                "account",
                path,
                "not used by any binding",
            ));
        } else if !account.has_token() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "account",
                format!("{path}.token"),
                "missing token",
            ));
        }
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}
