//! Metrics recorder initialization.

use {anyhow::Result, tracing::info};

/// Handle to the installed recorder.
#[derive(Clone)]
pub struct MetricsHandle {
    #[cfg(feature = "prometheus")]
    prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format. Empty without the
    /// `prometheus` feature.
    #[must_use]
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.prometheus_handle.render()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsRecorderConfig {
    pub enabled: bool,
    /// Labels added to every metric (e.g. `instance`).
    pub global_labels: Vec<(String, String)>,
}

/// Install the global recorder. Call once at startup.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics(config: MetricsRecorderConfig) -> Result<Option<MetricsHandle>> {
    if !config.enabled {
        info!("metrics collection is disabled");
        return Ok(None);
    }

    #[cfg(feature = "prometheus")]
    {
        let mut builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        for (key, value) in config.global_labels {
            builder = builder.add_global_label(key, value);
        }
        // Installs globally without spawning an HTTP listener; the relay's own
        // server renders the handle.
        let prometheus_handle = builder.install_recorder()?;
        info!("prometheus metrics recorder installed");
        Ok(Some(MetricsHandle { prometheus_handle }))
    }

    #[cfg(not(feature = "prometheus"))]
    {
        let _ = config.global_labels;
        info!("metrics requested but the prometheus feature is not compiled in");
        Ok(None)
    }
}
