use std::{collections::BTreeMap, sync::Arc};

use {async_trait::async_trait, tracing::warn};

use {
    threadrelay_config::{AccountConfig, RelayConfig},
    threadrelay_core::{Error, Result, Session, SessionProvider},
};

use crate::{
    session::TelegramSession,
    state::{DEFAULT_OBSERVED_CAPACITY, ObservedMessages},
};

/// Opens bot sessions for the accounts in the relay configuration.
pub struct TelegramSessionProvider {
    accounts: BTreeMap<String, AccountConfig>,
    observed_capacity: usize,
}

impl TelegramSessionProvider {
    pub fn new(accounts: BTreeMap<String, AccountConfig>) -> Self {
        Self {
            accounts,
            observed_capacity: DEFAULT_OBSERVED_CAPACITY,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.accounts.clone())
    }

    /// How many observed messages each account keeps for backfills.
    #[must_use]
    pub fn with_observed_capacity(mut self, capacity: usize) -> Self {
        self.observed_capacity = capacity;
        self
    }

    fn account(&self, account_id: &str) -> Result<&AccountConfig> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| Error::unknown_account(account_id))
    }
}

#[async_trait]
impl SessionProvider for TelegramSessionProvider {
    async fn connect(&self, account_id: &str) -> Result<Session> {
        let account = self.account(account_id)?;
        let Some(token) = account.token.as_ref().filter(|_| account.has_token()) else {
            return Err(Error::configuration(format!(
                "account '{account_id}' has no bot token"
            )));
        };

        let observed = Arc::new(ObservedMessages::new(self.observed_capacity));
        let session =
            TelegramSession::connect(account_id, token, account.poll_timeout_secs, observed)
                .await
                .map_err(|e| {
                    warn!(account_id, error = %e, "telegram connect failed");
                    Error::from(e)
                })?;
        let session = Arc::new(session);

        Ok(Session {
            account_id: account_id.to_string(),
            sender: session.clone(),
            origin: session.clone(),
            events: session,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let provider = TelegramSessionProvider::new(BTreeMap::new());
        let err = provider.connect("main").await.unwrap_err();
        assert!(matches!(err, Error::UnknownAccount { .. }));
    }

    #[tokio::test]
    async fn account_without_token_is_a_configuration_error() {
        let mut accounts = BTreeMap::new();
        accounts.insert("main".to_string(), AccountConfig::default());
        let provider = TelegramSessionProvider::new(accounts);

        let err = provider.connect("main").await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.is_configuration());
    }
}
