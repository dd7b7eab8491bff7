use std::{collections::HashMap, sync::Mutex};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::Serialize,
};

use crate::{
    Result,
    types::{ChatId, MessageId},
};

/// Identity Map key: one origin message in one destination chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RecordKey {
    pub origin_chat_id: ChatId,
    pub origin_message_id: MessageId,
    pub destination_chat_id: ChatId,
}

impl RecordKey {
    #[must_use]
    pub fn new(
        origin_chat_id: ChatId,
        origin_message_id: MessageId,
        destination_chat_id: ChatId,
    ) -> Self {
        Self {
            origin_chat_id,
            origin_message_id,
            destination_chat_id,
        }
    }
}

/// A persisted mapping from an origin message to the message created for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRecord {
    pub key: RecordKey,
    pub destination_message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

/// Durable mapping from origin messages to their destination copies.
///
/// Records are never mutated once written. Concurrent inserts for the same
/// key converge on a single winner.
#[async_trait]
pub trait IdentityMap: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<MessageId>>;

    /// Insert unless a record exists; returns the stored (winning) id.
    async fn insert_if_absent(
        &self,
        key: &RecordKey,
        destination_message_id: MessageId,
    ) -> Result<MessageId>;

    /// Every destination copy of one origin message.
    async fn records_for_origin(
        &self,
        origin_chat_id: ChatId,
        origin_message_id: MessageId,
    ) -> Result<Vec<MessageRecord>>;
}

/// In-memory map backed by `HashMap`. No persistence; for tests and
/// ephemeral runs.
#[derive(Default)]
pub struct InMemoryIdentityMap {
    records: Mutex<HashMap<RecordKey, MessageRecord>>,
}

impl InMemoryIdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdentityMap for InMemoryIdentityMap {
    async fn get(&self, key: &RecordKey) -> Result<Option<MessageId>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).map(|r| r.destination_message_id))
    }

    async fn insert_if_absent(
        &self,
        key: &RecordKey,
        destination_message_id: MessageId,
    ) -> Result<MessageId> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(*key).or_insert_with(|| MessageRecord {
            key: *key,
            destination_message_id,
            created_at: Utc::now(),
        });
        Ok(record.destination_message_id)
    }

    async fn records_for_origin(
        &self,
        origin_chat_id: ChatId,
        origin_message_id: MessageId,
    ) -> Result<Vec<MessageRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<MessageRecord> = records
            .values()
            .filter(|r| {
                r.key.origin_chat_id == origin_chat_id
                    && r.key.origin_message_id == origin_message_id
            })
            .cloned()
            .collect();
        found.sort_by_key(|r| r.key.destination_chat_id);
        Ok(found)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    #[tokio::test]
    async fn insert_then_get() {
        let map = InMemoryIdentityMap::new();
        let key = RecordKey::new(100, 1, 500);
        assert_eq!(map.get(&key).await.unwrap(), None);
        assert_eq!(map.insert_if_absent(&key, 9001).await.unwrap(), 9001);
        assert_eq!(map.get(&key).await.unwrap(), Some(9001));
    }

    #[tokio::test]
    async fn second_insert_returns_existing_value() {
        let map = InMemoryIdentityMap::new();
        let key = RecordKey::new(100, 1, 500);
        map.insert_if_absent(&key, 1).await.unwrap();
        assert_eq!(map.insert_if_absent(&key, 2).await.unwrap(), 1);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_converge() {
        let map = Arc::new(InMemoryIdentityMap::new());
        let key = RecordKey::new(100, 1, 600);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let map = Arc::clone(&map);
                tokio::spawn(async move { map.insert_if_absent(&key, i).await.unwrap() })
            })
            .collect();
        let mut winners = Vec::new();
        for h in handles {
            winners.push(h.await.unwrap());
        }
        winners.dedup();
        assert_eq!(winners.len(), 1);
    }

    #[tokio::test]
    async fn records_for_origin_lists_all_destinations() {
        let map = InMemoryIdentityMap::new();
        map.insert_if_absent(&RecordKey::new(100, 1, 600), 20)
            .await
            .unwrap();
        map.insert_if_absent(&RecordKey::new(100, 1, 500), 10)
            .await
            .unwrap();
        map.insert_if_absent(&RecordKey::new(100, 2, 500), 11)
            .await
            .unwrap();

        let records = map.records_for_origin(100, 1).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.destination_message_id).collect();
        assert_eq!(ids, vec![10, 20]);
    }
}
