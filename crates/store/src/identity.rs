use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::SqlitePool,
    threadrelay_core::{
        ChatId, IdentityMap, MessageId, MessageRecord, RecordKey, Result as RelayResult,
    },
};

use crate::error::{Error, into_relay};

/// Identity Map persisted in `message_records`.
///
/// Concurrent inserts for one key converge through the primary key: the
/// first row wins and later inserts read it back.
pub struct SqliteIdentityMap {
    pool: SqlitePool,
}

impl SqliteIdentityMap {
    /// Migrations must already be run on `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    origin_chat_id: i64,
    origin_message_id: i64,
    destination_chat_id: i64,
    destination_message_id: i64,
    created_at_ms: i64,
}

impl TryFrom<RecordRow> for MessageRecord {
    type Error = Error;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let created_at = DateTime::<Utc>::from_timestamp_millis(row.created_at_ms).ok_or_else(
            || Error::corrupt_row("message_records", format!("bad timestamp {}", row.created_at_ms)),
        )?;
        Ok(Self {
            key: RecordKey::new(
                row.origin_chat_id,
                row.origin_message_id,
                row.destination_chat_id,
            ),
            destination_message_id: row.destination_message_id,
            created_at,
        })
    }
}

#[async_trait]
impl IdentityMap for SqliteIdentityMap {
    async fn get(&self, key: &RecordKey) -> RelayResult<Option<MessageId>> {
        sqlx::query_scalar(
            "SELECT destination_message_id FROM message_records
             WHERE origin_chat_id = ? AND origin_message_id = ? AND destination_chat_id = ?",
        )
        .bind(key.origin_chat_id)
        .bind(key.origin_message_id)
        .bind(key.destination_chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| into_relay("look up message record", e))
    }

    async fn insert_if_absent(
        &self,
        key: &RecordKey,
        destination_message_id: MessageId,
    ) -> RelayResult<MessageId> {
        sqlx::query(
            "INSERT INTO message_records
                 (origin_chat_id, origin_message_id, destination_chat_id, destination_message_id, created_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (origin_chat_id, origin_message_id, destination_chat_id) DO NOTHING",
        )
        .bind(key.origin_chat_id)
        .bind(key.origin_message_id)
        .bind(key.destination_chat_id)
        .bind(destination_message_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| into_relay("insert message record", e))?;

        self.get(key).await?.ok_or_else(|| {
            into_relay(
                "insert message record",
                Error::corrupt_row("message_records", "row vanished after insert"),
            )
        })
    }

    async fn records_for_origin(
        &self,
        origin_chat_id: ChatId,
        origin_message_id: MessageId,
    ) -> RelayResult<Vec<MessageRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT origin_chat_id, origin_message_id, destination_chat_id, destination_message_id, created_at_ms
             FROM message_records
             WHERE origin_chat_id = ? AND origin_message_id = ?
             ORDER BY destination_chat_id",
        )
        .bind(origin_chat_id)
        .bind(origin_message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| into_relay("list message records", e))?;

        rows.into_iter()
            .map(|row| MessageRecord::try_from(row).map_err(|e| into_relay("decode message record", e)))
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    async fn map() -> SqliteIdentityMap {
        SqliteIdentityMap::new(crate::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn insert_then_get() {
        let map = map().await;
        let key = RecordKey::new(-1001, 1, -1002);
        assert_eq!(map.get(&key).await.unwrap(), None);
        assert_eq!(map.insert_if_absent(&key, 77).await.unwrap(), 77);
        assert_eq!(map.get(&key).await.unwrap(), Some(77));
    }

    #[tokio::test]
    async fn existing_record_wins() {
        let map = map().await;
        let key = RecordKey::new(-1001, 1, -1002);
        map.insert_if_absent(&key, 77).await.unwrap();
        assert_eq!(map.insert_if_absent(&key, 78).await.unwrap(), 77);
    }

    #[tokio::test]
    async fn concurrent_inserts_converge() {
        let map = Arc::new(map().await);
        let key = RecordKey::new(-1001, 5, -1003);
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let map = Arc::clone(&map);
                tokio::spawn(async move { map.insert_if_absent(&key, 100 + i).await.unwrap() })
            })
            .collect();
        let mut winners = Vec::new();
        for task in tasks {
            winners.push(task.await.unwrap());
        }
        winners.dedup();
        assert_eq!(winners.len(), 1);
    }

    #[tokio::test]
    async fn records_for_origin_orders_by_destination() {
        let map = map().await;
        map.insert_if_absent(&RecordKey::new(-1001, 1, -1003), 30)
            .await
            .unwrap();
        map.insert_if_absent(&RecordKey::new(-1001, 1, -1002), 20)
            .await
            .unwrap();
        map.insert_if_absent(&RecordKey::new(-1001, 2, -1002), 21)
            .await
            .unwrap();

        let records = map.records_for_origin(-1001, 1).await.unwrap();
        let destinations: Vec<_> = records.iter().map(|r| r.key.destination_chat_id).collect();
        assert_eq!(destinations, vec![-1003, -1002]);
        assert_eq!(records[0].destination_message_id, 30);
    }

    #[tokio::test]
    async fn records_survive_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let key = RecordKey::new(-1001, 9, -1002);
        {
            let map = SqliteIdentityMap::new(crate::open(&path).await.unwrap());
            map.insert_if_absent(&key, 900).await.unwrap();
        }
        let map = SqliteIdentityMap::new(crate::open(&path).await.unwrap());
        assert_eq!(map.get(&key).await.unwrap(), Some(900));
    }
}
