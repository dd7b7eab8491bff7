//! Metrics collection and export for threadrelay.
//!
//! Counters and gauges are recorded through the `metrics` crate facade, so
//! recording is a no-op until a recorder is installed. With the `prometheus`
//! feature, [`init_metrics`] installs a Prometheus recorder whose handle
//! renders the `/metrics` endpoint.
//!
//! ```rust,ignore
//! use threadrelay_metrics::{counter, relay};
//!
//! counter!(relay::DELIVERIES_TOTAL, "strategy" => "text_only").increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
