use std::sync::Arc;
use tracing::warn;

use crate::core::crypto::{SessionKey, open_json};
use crate::core::error::OracleError;
use crate::core::model::Message;
use crate::interfaces::storage::ContentStore;

/// Fetch one stored message and open it with `key`.
pub async fn fetch_message(
    storage: &dyn ContentStore,
    cid: &str,
    key: &SessionKey,
) -> Result<Message, OracleError> {
    let blob = storage.get(cid).await?;
    let envelope = std::str::from_utf8(&blob)
        .map_err(|_| OracleError::Malformed(format!("message {} is not an envelope", cid)))?;
    open_json(envelope, key)
}

/// Rebuilds conversation context by following `parentId` links backward.
pub struct HistoryWalker {
    storage: Arc<dyn ContentStore>,
    limit: usize,
}

impl HistoryWalker {
    pub fn new(storage: Arc<dyn ContentStore>, limit: usize) -> Self {
        Self { storage, limit }
    }

    /// Messages oldest-first, ending with the one at `start`. At most
    /// `limit` are returned. A fetch or decrypt failure ends the walk early
    /// and keeps what was already read.
    pub async fn walk(&self, start: Option<&str>, key: &SessionKey) -> Vec<Message> {
        let mut chain: Vec<Message> = Vec::new();
        let mut cursor = start.filter(|cid| !cid.is_empty()).map(str::to_string);

        while let Some(cid) = cursor.take() {
            if chain.len() >= self.limit {
                break;
            }
            match fetch_message(self.storage.as_ref(), &cid, key).await {
                Ok(message) => {
                    cursor = message.parent_id.clone().filter(|p| !p.is_empty());
                    chain.push(message);
                }
                Err(e) => {
                    warn!(%cid, depth = chain.len(), "History walk stopped early: {}", e);
                    break;
                }
            }
        }

        chain.reverse();
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::seal_json;
    use crate::core::model::Role;
    use crate::interfaces::storage::{CONTENT_MESSAGE, tags_for};
    use crate::test_support::MemoryStore;

    async fn store_chain(storage: &MemoryStore, key: &SessionKey, n: usize) -> Vec<String> {
        let mut cids = Vec::new();
        let mut parent: Option<String> = None;
        for i in 0..n {
            let message = Message::user(
                format!("m{}", i),
                "1".into(),
                parent.clone(),
                i as u64,
                format!("turn {}", i),
            );
            let envelope = seal_json(&message, key).unwrap();
            let cid = storage
                .put(envelope.into_bytes(), &tags_for(CONTENT_MESSAGE, 1, "1"))
                .await
                .unwrap();
            parent = Some(cid.clone());
            cids.push(cid);
        }
        cids
    }

    #[tokio::test]
    async fn walk_returns_oldest_first() {
        let storage = Arc::new(MemoryStore::default());
        let key = SessionKey::generate();
        let cids = store_chain(&storage, &key, 3).await;

        let walker = HistoryWalker::new(storage, 20);
        let history = walker.walk(cids.last().map(String::as_str), &key).await;
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 0", "turn 1", "turn 2"]);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn walk_is_bounded_by_limit() {
        let storage = Arc::new(MemoryStore::default());
        let key = SessionKey::generate();
        let cids = store_chain(&storage, &key, 5).await;

        let walker = HistoryWalker::new(storage, 2);
        let history = walker.walk(cids.last().map(String::as_str), &key).await;
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 3", "turn 4"]);
    }

    #[tokio::test]
    async fn missing_parent_returns_partial_history() {
        let storage = Arc::new(MemoryStore::default());
        let key = SessionKey::generate();
        let cids = store_chain(&storage, &key, 3).await;
        storage.remove(&cids[0]);

        let walker = HistoryWalker::new(storage, 20);
        let history = walker.walk(cids.last().map(String::as_str), &key).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "turn 1");
    }

    #[tokio::test]
    async fn wrong_key_yields_empty_history() {
        let storage = Arc::new(MemoryStore::default());
        let cids = store_chain(&storage, &SessionKey::generate(), 2).await;

        let walker = HistoryWalker::new(storage, 20);
        let history = walker
            .walk(cids.last().map(String::as_str), &SessionKey::generate())
            .await;
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn no_start_means_no_history() {
        let walker = HistoryWalker::new(Arc::new(MemoryStore::default()), 20);
        assert!(walker.walk(None, &SessionKey::generate()).await.is_empty());
        assert!(walker.walk(Some(""), &SessionKey::generate()).await.is_empty());
    }
}
