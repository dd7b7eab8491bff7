use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::SqlitePool,
    threadrelay_core::{ChatId, DeliveryOutcome, OutcomeLog, Result as RelayResult},
};

use crate::error::{Error, into_relay};

/// Outcome log persisted in `delivery_outcomes`. Rows are only ever
/// appended.
pub struct SqliteOutcomeLog {
    pool: SqlitePool,
}

impl SqliteOutcomeLog {
    /// Migrations must already be run on `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    timestamp_ms: i64,
    origin_chat_id: i64,
    message_id: i64,
    destination_chat_id: i64,
    destination_message_id: Option<i64>,
    strategy: String,
    status: String,
    detail: Option<String>,
}

impl TryFrom<OutcomeRow> for DeliveryOutcome {
    type Error = Error;

    fn try_from(row: OutcomeRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| Error::corrupt_row("delivery_outcomes", message);
        Ok(Self {
            timestamp: DateTime::<Utc>::from_timestamp_millis(row.timestamp_ms)
                .ok_or_else(|| corrupt(format!("bad timestamp {}", row.timestamp_ms)))?,
            origin_chat_id: row.origin_chat_id,
            message_id: row.message_id,
            destination_chat_id: row.destination_chat_id,
            destination_message_id: row.destination_message_id,
            strategy: row.strategy.parse().map_err(|e| corrupt(format!("{e}")))?,
            status: row.status.parse().map_err(|e| corrupt(format!("{e}")))?,
            detail: row.detail,
        })
    }
}

const SELECT_OUTCOMES: &str = "SELECT timestamp_ms, origin_chat_id, message_id, destination_chat_id,
        destination_message_id, strategy, status, detail
     FROM delivery_outcomes";

fn decode(rows: Vec<OutcomeRow>) -> RelayResult<Vec<DeliveryOutcome>> {
    rows.into_iter()
        .map(|row| DeliveryOutcome::try_from(row).map_err(|e| into_relay("decode outcome", e)))
        .collect()
}

#[async_trait]
impl OutcomeLog for SqliteOutcomeLog {
    async fn append(&self, outcome: DeliveryOutcome) -> RelayResult<()> {
        sqlx::query(
            "INSERT INTO delivery_outcomes
                 (timestamp_ms, origin_chat_id, message_id, destination_chat_id,
                  destination_message_id, strategy, status, detail)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(outcome.timestamp.timestamp_millis())
        .bind(outcome.origin_chat_id)
        .bind(outcome.message_id)
        .bind(outcome.destination_chat_id)
        .bind(outcome.destination_message_id)
        .bind(outcome.strategy.as_str())
        .bind(outcome.status.as_str())
        .bind(&outcome.detail)
        .execute(&self.pool)
        .await
        .map_err(|e| into_relay("append outcome", e))?;
        Ok(())
    }

    async fn recent(&self, limit: u32) -> RelayResult<Vec<DeliveryOutcome>> {
        let rows: Vec<OutcomeRow> =
            sqlx::query_as(&format!("{SELECT_OUTCOMES} ORDER BY id DESC LIMIT ?"))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| into_relay("list outcomes", e))?;
        decode(rows)
    }

    async fn list_by_origin(
        &self,
        origin_chat_id: ChatId,
        limit: u32,
    ) -> RelayResult<Vec<DeliveryOutcome>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(&format!(
            "{SELECT_OUTCOMES} WHERE origin_chat_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(origin_chat_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| into_relay("list outcomes by origin", e))?;
        decode(rows)
    }
}
