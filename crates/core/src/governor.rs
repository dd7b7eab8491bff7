//! The single retry point for outbound platform calls.

use std::{future::Future, time::Duration};

use tracing::warn;

#[cfg(feature = "metrics")]
use threadrelay_metrics::{counter, relay as relay_metrics};

use crate::error::PlatformError;

/// Default margin added on top of the platform's requested wait.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(500);

/// Absorbs one rate-limit signal per call by waiting and retrying once.
#[derive(Debug, Clone, Copy)]
pub struct RateGovernor {
    safety_margin: Duration,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_MARGIN)
    }
}

impl RateGovernor {
    #[must_use]
    pub fn new(safety_margin: Duration) -> Self {
        Self { safety_margin }
    }

    #[must_use]
    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Run `request`, retrying exactly once after a rate-limit signal.
    ///
    /// A second rate-limit signal comes back as
    /// [`PlatformError::RateLimitPersisted`]; other errors pass through.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        mut request: F,
    ) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let wait = match request().await {
            Ok(value) => return Ok(value),
            Err(PlatformError::RateLimited { wait }) => wait,
            Err(err) => return Err(err),
        };

        #[cfg(feature = "metrics")]
        counter!(relay_metrics::RATE_LIMITED_TOTAL, "operation" => operation).increment(1);

        warn!(
            operation,
            retry_after_ms = wait.as_millis() as u64,
            "rate limited, waiting before retry"
        );
        tokio::time::sleep(wait + self.safety_margin).await;

        match request().await {
            Ok(value) => Ok(value),
            Err(PlatformError::RateLimited { wait }) => {
                warn!(
                    operation,
                    retry_after_ms = wait.as_millis() as u64,
                    "rate limit persisted after retry"
                );
                Err(PlatformError::RateLimitPersisted { wait })
            },
            Err(err) => Err(err),
        }
    }
}
