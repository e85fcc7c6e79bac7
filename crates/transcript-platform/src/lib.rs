//! Message store contract consumed by the transcript runtime, plus an
//! in-memory implementation for tests and demos.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use transcript_core::{Message, TranscriptError, TranscriptErrorCategory, WindowMetrics};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("message store unavailable: {0}")]
    Unavailable(String),
    #[error("message store backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for TranscriptError {
    fn from(err: StoreError) -> Self {
        let (category, code) = match &err {
            StoreError::NotFound(_) => (TranscriptErrorCategory::NotFound, "store_not_found"),
            StoreError::Unavailable(_) => (TranscriptErrorCategory::Store, "store_unavailable"),
            StoreError::Backend(_) => (TranscriptErrorCategory::Store, "store_failure"),
        };
        TranscriptError::new(category, code, err.to_string())
    }
}

/// Persistent message history as seen by the window engine.
///
/// Pages come back in any order; the engine sorts them.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Up to `limit` messages strictly older than `before_message_id`.
    async fn load_older(
        &self,
        conversation_id: &str,
        before_message_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Up to `limit` messages strictly newer than `after_message_id`.
    async fn load_newer(
        &self,
        conversation_id: &str,
        after_message_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// The newest `limit` messages, or `limit` messages centred on
    /// `around_message_id`.
    async fn load_newest(
        &self,
        conversation_id: &str,
        around_message_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Conversation-wide boundary and unread metrics.
    async fn metrics(&self, conversation_id: &str) -> Result<WindowMetrics, StoreError>;

    /// Mark every message up to and including `upto_message_id` as read.
    async fn mark_read(
        &self,
        conversation_id: &str,
        upto_message_id: &str,
    ) -> Result<(), StoreError>;
}

/// Thread-safe in-memory [`MessageStore`].
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    data: Arc<RwLock<HashMap<String, Vec<Message>>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace messages, keeping each conversation sorted.
    pub fn insert_many(
        &self,
        messages: impl IntoIterator<Item = Message>,
    ) -> Result<(), StoreError> {
        let mut data = self.write()?;
        for message in messages {
            let conversation = data.entry(message.conversation_id.clone()).or_default();
            match conversation.iter_mut().find(|existing| existing.id == message.id) {
                Some(existing) => *existing = message,
                None => conversation.push(message),
            }
        }
        for conversation in data.values_mut() {
            conversation.sort_by(|a, b| {
                a.sort_key()
                    .cmp(&b.sort_key())
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        Ok(())
    }

    pub fn insert(&self, message: Message) -> Result<(), StoreError> {
        self.insert_many([message])
    }

    pub fn delete(&self, conversation_id: &str, message_id: &str) -> Result<(), StoreError> {
        let mut data = self.write()?;
        let conversation = data
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation '{conversation_id}'")))?;
        let before = conversation.len();
        conversation.retain(|message| message.id != message_id);
        if conversation.len() == before {
            return Err(StoreError::NotFound(format!("message '{message_id}'")));
        }
        Ok(())
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        let data = self.data.read().ok()?;
        data.get(conversation_id)?
            .iter()
            .find(|message| message.id == message_id)
            .cloned()
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.data
            .read()
            .map(|data| data.get(conversation_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, conversation_id: &str) -> bool {
        self.len(conversation_id) == 0
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<Message>>>, StoreError> {
        self.data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))
    }

    /// Run `f` over one conversation's sorted history.
    fn with_conversation<T>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&[Message]) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        let history = data.get(conversation_id).map(Vec::as_slice).unwrap_or(&[]);
        f(history)
    }
}

fn position_of(history: &[Message], message_id: &str) -> Result<usize, StoreError> {
    history
        .iter()
        .position(|message| message.id == message_id)
        .ok_or_else(|| StoreError::NotFound(format!("message '{message_id}'")))
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn load_older(
        &self,
        conversation_id: &str,
        before_message_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_conversation(conversation_id, |history| {
            let end = position_of(history, before_message_id)?;
            let start = end.saturating_sub(limit);
            Ok(history[start..end].to_vec())
        })
    }

    async fn load_newer(
        &self,
        conversation_id: &str,
        after_message_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_conversation(conversation_id, |history| {
            let start = position_of(history, after_message_id)? + 1;
            let end = start.saturating_add(limit).min(history.len());
            Ok(history[start..end].to_vec())
        })
    }

    async fn load_newest(
        &self,
        conversation_id: &str,
        around_message_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_conversation(conversation_id, |history| {
            let end = match around_message_id {
                Some(id) => {
                    let center = position_of(history, id)?;
                    center
                        .saturating_sub(limit / 2)
                        .saturating_add(limit)
                        .min(history.len())
                }
                None => history.len(),
            };
            let start = end.saturating_sub(limit);
            Ok(history[start..end].to_vec())
        })
    }

    async fn metrics(&self, conversation_id: &str) -> Result<WindowMetrics, StoreError> {
        self.with_conversation(conversation_id, |history| {
            let unread: Vec<&Message> = history.iter().filter(|message| message.is_unread).collect();
            Ok(WindowMetrics {
                newest: history.last().map(Message::pointer),
                oldest: history.first().map(Message::pointer),
                oldest_unseen: unread.first().map(|message| message.pointer()),
                total_unseen: unread.len() as u64,
            })
        })
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        upto_message_id: &str,
    ) -> Result<(), StoreError> {
        let mut data = self.write()?;
        let history = data
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation '{conversation_id}'")))?;
        let upto = position_of(history, upto_message_id)?;
        let mut marked = 0_usize;
        for message in history[..=upto].iter_mut().filter(|message| message.is_unread) {
            message.is_unread = false;
            marked += 1;
        }
        debug!(%conversation_id, %upto_message_id, marked, "messages marked read");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(count: u64) -> InMemoryMessageStore {
        let store = InMemoryMessageStore::new();
        store
            .insert_many((0..count).rev().map(|n| Message::new(format!("m{n}"), "c", n, n)))
            .expect("seed should work");
        store
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.id.as_str()).collect()
    }

    #[tokio::test]
    async fn pages_in_both_directions() {
        let store = seeded(10);
        let older = store.load_older("c", "m5", 3).await.expect("older page");
        assert_eq!(ids(&older), ["m2", "m3", "m4"]);

        let newer = store.load_newer("c", "m8", 3).await.expect("newer page");
        assert_eq!(ids(&newer), ["m9"]);

        let oldest = store.load_older("c", "m1", 3).await.expect("short page");
        assert_eq!(ids(&oldest), ["m0"]);
    }

    #[tokio::test]
    async fn loads_newest_or_around_target() {
        let store = seeded(10);
        let newest = store.load_newest("c", None, 4).await.expect("newest page");
        assert_eq!(ids(&newest), ["m6", "m7", "m8", "m9"]);

        let around = store.load_newest("c", Some("m4"), 5).await.expect("around page");
        assert_eq!(ids(&around), ["m2", "m3", "m4", "m5", "m6"]);

        let near_end = store.load_newest("c", Some("m9"), 4).await.expect("clamped page");
        assert_eq!(ids(&near_end), ["m6", "m7", "m8", "m9"]);

        let empty = store.load_newest("missing", None, 4).await.expect("empty page");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn unknown_anchor_is_not_found() {
        let store = seeded(3);
        let err = store
            .load_older("c", "zzz", 3)
            .await
            .expect_err("unknown anchor must fail");
        assert_eq!(err, StoreError::NotFound("message 'zzz'".to_owned()));

        let mapped = TranscriptError::from(err);
        assert_eq!(mapped.category, TranscriptErrorCategory::NotFound);
        assert_eq!(mapped.code, "store_not_found");
    }

    #[tokio::test]
    async fn mark_read_updates_metrics() {
        let store = InMemoryMessageStore::new();
        store
            .insert_many((0..4).map(|n| Message::new(format!("m{n}"), "c", n, n).unread()))
            .expect("seed should work");

        let metrics = store.metrics("c").await.expect("metrics");
        assert_eq!(metrics.total_unseen, 4);
        assert_eq!(metrics.oldest_unseen.map(|pointer| pointer.id), Some("m0".to_owned()));

        store.mark_read("c", "m2").await.expect("mark read");
        let metrics = store.metrics("c").await.expect("metrics");
        assert_eq!(metrics.total_unseen, 1);
        assert_eq!(metrics.oldest_unseen.map(|pointer| pointer.id), Some("m3".to_owned()));
        assert_eq!(metrics.newest.map(|pointer| pointer.id), Some("m3".to_owned()));
    }

    #[test]
    fn insert_replaces_and_delete_removes() {
        let store = seeded(2);
        store
            .insert(Message::new("m1", "c", 1, 1).with_body("edited"))
            .expect("replace should work");
        assert_eq!(store.len("c"), 2);
        assert_eq!(store.message("c", "m1").map(|message| message.body), Some("edited".to_owned()));

        store.delete("c", "m0").expect("delete should work");
        assert_eq!(
            store.delete("c", "m0"),
            Err(StoreError::NotFound("message 'm0'".to_owned()))
        );
        assert!(!store.is_empty("c"));
    }

    #[test]
    fn maps_backend_errors_to_store_category() {
        let mapped = TranscriptError::from(StoreError::Backend("disk".to_owned()));
        assert_eq!(mapped.category, TranscriptErrorCategory::Store);
        assert_eq!(mapped.code, "store_failure");
        assert_eq!(mapped.message, "message store backend failure: disk");
    }
}
