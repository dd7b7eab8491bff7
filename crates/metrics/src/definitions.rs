//! Metric names and label keys.
//!
//! Every metric the relay records is named here so the exported set is
//! documented in one place.

/// Relay engine metrics
pub mod relay {
    /// Messages delivered, labelled by `strategy`
    pub const DELIVERIES_TOTAL: &str = "threadrelay_deliveries_total";
    /// Messages for which every delivery strategy failed
    pub const DELIVERY_FAILURES_TOTAL: &str = "threadrelay_delivery_failures_total";
    /// Rate-limit signals absorbed by the governor, labelled by `operation`
    pub const RATE_LIMITED_TOTAL: &str = "threadrelay_rate_limited_total";
    /// Inbound events dropped as duplicates
    pub const DEDUP_SUPPRESSED_TOTAL: &str = "threadrelay_dedup_suppressed_total";
    /// Original posts delivered late so a reply could be anchored
    pub const BACKFILLS_TOTAL: &str = "threadrelay_backfills_total";
    /// Number of running account listeners
    pub const ACTIVE_LISTENERS: &str = "threadrelay_active_listeners";
}

/// Telegram session metrics
pub mod telegram {
    /// Updates received from long polling
    pub const UPDATES_RECEIVED_TOTAL: &str = "threadrelay_telegram_updates_received_total";
    /// Failed `getUpdates` calls
    pub const POLLING_ERRORS_TOTAL: &str = "threadrelay_telegram_polling_errors_total";
    /// Media files downloaded for re-upload
    pub const DOWNLOADS_TOTAL: &str = "threadrelay_telegram_downloads_total";
}

/// HTTP endpoint metrics
pub mod http {
    /// Requests served, labelled by `endpoint`
    pub const REQUESTS_TOTAL: &str = "threadrelay_http_requests_total";
}

/// Common label keys
pub mod labels {
    pub const ACCOUNT_ID: &str = "account_id";
    pub const ENDPOINT: &str = "endpoint";
    pub const OPERATION: &str = "operation";
    pub const STRATEGY: &str = "strategy";
}
