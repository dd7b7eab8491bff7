use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    anyhow::{Context, Result},
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

use {
    threadrelay_config::{
        BindingConfig, DeliverySettings, RelayConfig, Severity, apply_env_overrides,
        database_path, discover_and_load, load_config, validate_config,
    },
    threadrelay_core::{
        DedupGuard, DeliveryConfig, DestinationTarget, ListenerPool, OutcomeLog, RateGovernor,
        SourceBinding,
    },
    threadrelay_metrics::{MetricsRecorderConfig, init_metrics},
    threadrelay_store::{SqliteIdentityMap, SqliteOutcomeLog},
    threadrelay_telegram::TelegramSessionProvider,
};

use crate::server::{self, AppState};

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Load the config file (explicit or discovered) and overlay the environment.
pub fn load(path: Option<&Path>) -> Result<RelayConfig> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => discover_and_load()?,
    };
    Ok(apply_env_overrides(config))
}

pub fn source_binding(binding: &BindingConfig) -> SourceBinding {
    SourceBinding {
        account_id: binding.account.clone(),
        origin_chat_id: binding.origin_chat_id,
        companion_chat_id: binding.companion_chat_id,
        posts: DestinationTarget::new("posts", binding.posts_chat_id),
        comments: binding
            .comments_chat_id
            .map(|id| DestinationTarget::new("comments", id)),
    }
}

pub fn delivery_config(settings: &DeliverySettings) -> DeliveryConfig {
    DeliveryConfig {
        native_transfer: settings.native_transfer,
        attribution_header: settings.attribution_header,
        failure_notice: settings.failure_notice,
        placeholder_text: settings.placeholder_text.clone(),
    }
}

pub async fn run(options: RunOptions) -> Result<()> {
    let config = load(options.config.as_deref())?;

    let report = validate_config(&config);
    for d in &report.diagnostics {
        match d.severity {
            Severity::Error => error!(category = d.category, path = %d.path, "{}", d.message),
            Severity::Warning => warn!(category = d.category, path = %d.path, "{}", d.message),
            Severity::Info => info!(category = d.category, path = %d.path, "{}", d.message),
        }
    }
    if report.has_errors() {
        anyhow::bail!(
            "configuration has {} error(s); run `threadrelay check` for details",
            report.count(Severity::Error)
        );
    }

    let db_path = database_path(&config);
    let db = threadrelay_store::open(&db_path)
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config
            .metrics
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })?;

    let outcomes: Arc<dyn OutcomeLog> = Arc::new(SqliteOutcomeLog::new(db.clone()));
    let pool = Arc::new(
        ListenerPool::new(
            Arc::new(TelegramSessionProvider::from_config(&config)),
            Arc::new(SqliteIdentityMap::new(db.clone())),
            Arc::clone(&outcomes),
        )
        .with_dedup(Arc::new(DedupGuard::new(config.dedup.capacity)))
        .with_governor(RateGovernor::new(Duration::from_millis(
            config.governor.safety_margin_ms,
        )))
        .with_delivery_config(delivery_config(&config.delivery)),
    );

    let mut active = 0usize;
    for binding in &config.bindings {
        match pool.register(source_binding(binding)).await {
            Ok(state) => {
                active += 1;
                info!(
                    account_id = binding.account,
                    origin_chat_id = binding.origin_chat_id,
                    state = %state,
                    "binding registered"
                );
            },
            // One bad binding must not take the others down.
            Err(e) => error!(
                account_id = binding.account,
                origin_chat_id = binding.origin_chat_id,
                error = %e,
                "failed to register binding"
            ),
        }
    }
    info!(
        bindings = config.bindings.len(),
        active, "relay started"
    );

    let shutdown = CancellationToken::new();
    let server_task = if config.server.enabled {
        let bind = options.bind.unwrap_or(config.server.bind);
        let port = options.port.unwrap_or(config.server.port);
        let addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .with_context(|| format!("invalid bind address {bind}:{port}"))?;
        let state = AppState {
            pool: Arc::clone(&pool),
            outcomes,
            metrics,
        };
        Some(tokio::spawn(server::serve(addr, state, shutdown.clone())))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    shutdown.cancel();
    pool.shutdown().await;
    if let Some(task) = server_task {
        match task.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => error!(error = %e, "health endpoint failed"),
            Err(e) => error!(error = %e, "health endpoint task panicked"),
        }
    }
    db.close().await;
    info!("threadrelay stopped");
    Ok(())
}
