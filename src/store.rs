// =============================================================================
// Store Adapter — sorted-set keyed store with pub/sub, over a Redis-
// compatible backend
// =============================================================================
//
// The Reconciler achieves replacement semantics with `remove_by_score`
// followed by `add`; this two-step is not atomic but is safe under the
// single-writer-per-key invariant documented in SPEC_FULL.md §5.
// =============================================================================

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::IngestError;

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn range_by_score(&self, key: &str, lo: i64, hi: i64) -> Result<Vec<Vec<u8>>, IngestError>;
    async fn remove_by_score(&self, key: &str, lo: i64, hi: i64) -> Result<(), IngestError>;
    async fn add(&self, key: &str, member: &str, score: i64) -> Result<(), IngestError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), IngestError>;
}

/// Production `StoreAdapter` backed by a multiplexed async Redis connection.
/// Reconnection on transient disconnects is handled by the underlying
/// `redis` client's connection manager semantics.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, IngestError> {
        let client = redis::Client::open(url).map_err(IngestError::Store)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(IngestError::Store)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StoreAdapter for RedisStore {
    async fn range_by_score(&self, key: &str, lo: i64, hi: i64) -> Result<Vec<Vec<u8>>, IngestError> {
        let mut conn = self.conn.clone();
        let members: Vec<Vec<u8>> = conn.zrangebyscore(key, lo, hi).await.map_err(IngestError::Store)?;
        Ok(members)
    }

    async fn remove_by_score(&self, key: &str, lo: i64, hi: i64) -> Result<(), IngestError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrembyscore(key, lo, hi).await.map_err(IngestError::Store)?;
        Ok(())
    }

    async fn add(&self, key: &str, member: &str, score: i64) -> Result<(), IngestError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, member, score).await.map_err(IngestError::Store)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), IngestError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await.map_err(IngestError::Store)?;
        Ok(())
    }
}

/// In-memory `StoreAdapter` double used by the reconciliation unit tests
/// (S1-S7 in SPEC_FULL.md §8) so they run without a live Redis.
#[derive(Default)]
pub struct InMemoryStore {
    sorted_sets: parking_lot::Mutex<std::collections::HashMap<String, Vec<(i64, Vec<u8>)>>>,
    published: parking_lot::Mutex<Vec<(String, String)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every `(channel, payload)` published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    async fn range_by_score(&self, key: &str, lo: i64, hi: i64) -> Result<Vec<Vec<u8>>, IngestError> {
        let sets = self.sorted_sets.lock();
        let mut out: Vec<(i64, Vec<u8>)> = sets
            .get(key)
            .map(|members| {
                members
                    .iter()
                    .filter(|(score, _)| *score >= lo && *score <= hi)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|(score, _)| *score);
        Ok(out.into_iter().map(|(_, member)| member).collect())
    }

    async fn remove_by_score(&self, key: &str, lo: i64, hi: i64) -> Result<(), IngestError> {
        let mut sets = self.sorted_sets.lock();
        if let Some(members) = sets.get_mut(key) {
            members.retain(|(score, _)| *score < lo || *score > hi);
        }
        Ok(())
    }

    async fn add(&self, key: &str, member: &str, score: i64) -> Result<(), IngestError> {
        let mut sets = self.sorted_sets.lock();
        sets.entry(key.to_string())
            .or_default()
            .push((score, member.as_bytes().to_vec()));
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), IngestError> {
        self.published.lock().push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replace_semantics_via_remove_then_add() {
        let store = InMemoryStore::new();
        store.add("K", "v1", 100).await.unwrap();
        store.remove_by_score("K", 100, 100).await.unwrap();
        store.add("K", "v2", 100).await.unwrap();

        let members = store.range_by_score("K", 0, 1000).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0], b"v2".to_vec());
    }

    #[tokio::test]
    async fn range_by_score_is_sorted() {
        let store = InMemoryStore::new();
        store.add("K", "c", 300).await.unwrap();
        store.add("K", "a", 100).await.unwrap();
        store.add("K", "b", 200).await.unwrap();

        let members = store.range_by_score("K", 0, 1000).await.unwrap();
        assert_eq!(members, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn publish_records_channel_and_payload() {
        let store = InMemoryStore::new();
        store.publish("X:BARS", "{}").await.unwrap();
        assert_eq!(store.published(), vec![("X:BARS".to_string(), "{}".to_string())]);
    }
}
