use std::sync::Mutex;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{
    Result,
    types::{ChatId, MessageId},
};

/// Which step of the fallback chain produced the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    NativeTransfer,
    ContentRecreation,
    TextOnly,
    /// Every strategy failed; a notice may have been posted.
    FailureNotice,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeTransfer => "native_transfer",
            Self::ContentRecreation => "content_recreation",
            Self::TextOnly => "text_only",
            Self::FailureNotice => "failure_notice",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native_transfer" => Ok(Self::NativeTransfer),
            "content_recreation" => Ok(Self::ContentRecreation),
            "text_only" => Ok(Self::TextOnly),
            "failure_notice" => Ok(Self::FailureNotice),
            other => Err(crate::Error::configuration(format!(
                "unknown delivery strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Delivered,
    Failed,
}

impl OutcomeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for OutcomeStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::configuration(format!(
                "unknown outcome status: {other}"
            ))),
        }
    }
}

/// Append-only audit record of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub timestamp: DateTime<Utc>,
    pub origin_chat_id: ChatId,
    pub message_id: MessageId,
    pub destination_chat_id: ChatId,
    pub destination_message_id: Option<MessageId>,
    pub strategy: Strategy,
    pub status: OutcomeStatus,
    /// Last error seen when the delivery failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append-only log of delivery outcomes, read by audit and dashboard
/// consumers.
#[async_trait]
pub trait OutcomeLog: Send + Sync {
    async fn append(&self, outcome: DeliveryOutcome) -> Result<()>;

    /// Most recent outcomes first.
    async fn recent(&self, limit: u32) -> Result<Vec<DeliveryOutcome>>;

    /// Most recent outcomes for one origin chat first.
    async fn list_by_origin(&self, origin_chat_id: ChatId, limit: u32)
    -> Result<Vec<DeliveryOutcome>>;
}

/// In-memory outcome log. No persistence.
#[derive(Default)]
pub struct InMemoryOutcomeLog {
    entries: Mutex<Vec<DeliveryOutcome>>,
}

impl InMemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outcome in append order.
    pub fn snapshot(&self) -> Vec<DeliveryOutcome> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl OutcomeLog for InMemoryOutcomeLog {
    async fn append(&self, outcome: DeliveryOutcome) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outcome);
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<DeliveryOutcome>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn list_by_origin(
        &self,
        origin_chat_id: ChatId,
        limit: u32,
    ) -> Result<Vec<DeliveryOutcome>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .rev()
            .filter(|o| o.origin_chat_id == origin_chat_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(origin: ChatId, message_id: MessageId, status: OutcomeStatus) -> DeliveryOutcome {
        DeliveryOutcome {
            timestamp: Utc::now(),
            origin_chat_id: origin,
            message_id,
            destination_chat_id: 500,
            destination_message_id: (status == OutcomeStatus::Delivered).then_some(message_id + 1000),
            strategy: Strategy::TextOnly,
            status,
            detail: None,
        }
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let log = InMemoryOutcomeLog::new();
        for id in 1..=5 {
            log.append(outcome(100, id, OutcomeStatus::Delivered))
                .await
                .unwrap();
        }
        let recent = log.recent(2).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|o| o.message_id).collect();
        assert_eq!(ids, vec![5, 4]);
    }

    #[tokio::test]
    async fn list_by_origin_filters() {
        let log = InMemoryOutcomeLog::new();
        log.append(outcome(100, 1, OutcomeStatus::Delivered))
            .await
            .unwrap();
        log.append(outcome(200, 2, OutcomeStatus::Failed))
            .await
            .unwrap();
        let only = log.list_by_origin(200, 10).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].status, OutcomeStatus::Failed);
        assert_eq!(only[0].destination_message_id, None);
    }

    #[test]
    fn strategy_names_round_trip_through_str() {
        for strategy in [
            Strategy::NativeTransfer,
            Strategy::ContentRecreation,
            Strategy::TextOnly,
            Strategy::FailureNotice,
        ] {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), strategy);
        }
        assert!("carrier_pigeon".parse::<Strategy>().is_err());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_value(outcome(100, 1, OutcomeStatus::Delivered)).unwrap();
        assert_eq!(json["strategy"], "text_only");
        assert_eq!(json["status"], "delivered");
        assert!(json.get("detail").is_none());
    }
}
