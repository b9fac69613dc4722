//! In-memory named list store with blocking pop.
//!
//! Models the RPUSH/BLPOP pair the container bridge needs: `push_back`
//! appends to a named list, `pop_front` blocks until that list has a head.
//! Container processes consume their `core:{id}` lists; the forwarder
//! blocks on the shared response list.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Named FIFO lists shared between the dispatcher, the forwarder and
/// container consumers.
#[derive(Default)]
pub struct QueueStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payload to the tail of the named list.
    pub fn push_back(&self, key: &str, payload: String) {
        self.lists
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    /// Pops the head of the named list without blocking.
    pub fn try_pop_front(&self, key: &str) -> Option<String> {
        self.lists
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(key)
            .and_then(VecDeque::pop_front)
    }

    /// Blocks until the named list has a head, then pops it.
    pub async fn pop_front(&self, key: &str) -> String {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop_front(key) {
                return payload;
            }
            notified.await;
        }
    }

    /// Number of payloads waiting in the named list.
    pub fn len(&self, key: &str) -> usize {
        self.lists
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lists_are_fifo_and_independent() {
        let store = QueueStore::new();
        store.push_back("a", "1".into());
        store.push_back("a", "2".into());
        store.push_back("b", "x".into());

        assert_eq!(store.try_pop_front("a").as_deref(), Some("1"));
        assert_eq!(store.try_pop_front("a").as_deref(), Some("2"));
        assert_eq!(store.try_pop_front("a"), None);
        assert_eq!(store.try_pop_front("b").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push() {
        let store = Arc::new(QueueStore::new());
        let consumer = store.clone();
        let handle = tokio::spawn(async move { consumer.pop_front("jobs").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push_back("jobs", "payload".into());

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "payload");
    }

    #[tokio::test]
    async fn blocking_pop_ignores_other_lists() {
        let store = Arc::new(QueueStore::new());
        let consumer = store.clone();
        let handle = tokio::spawn(async move { consumer.pop_front("wanted").await });

        store.push_back("other", "nope".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        store.push_back("wanted", "yes".into());
        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "yes");
    }
}
