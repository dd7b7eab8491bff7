//! Configuration loading, validation and env substitution.
//!
//! Config files: `threadrelay.toml`, `threadrelay.yaml` or `threadrelay.json`,
//! searched in `./` then `~/.config/threadrelay/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, data_dir, database_path, discover_and_load, load_config,
    },
    schema::{
        AccountConfig, BindingConfig, DEFAULT_ACCOUNT, DatabaseConfig, DedupConfig,
        DeliverySettings, GovernorConfig, MetricsConfig, RelayConfig, ServerConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_config, validate_str},
};
