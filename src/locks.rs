//! Keyed async mutexes: the only serialization boundary in the pipeline.
//!
//! Keys are namespaced strings: `name:<normalized>` while a topic name is
//! resolved, `topic:<id>` while a topic's records are written or read as a
//! snapshot, and `article:<id>` for the whole of one ingestion attempt.
//! An entry lives only while some task holds or waits for its key.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::model::TopicId;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Holds one key. Dropping it releases the key and removes the map entry
/// when no other task is waiting on it.
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<LockMap>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        // waiters hold their own clone of the mutex, so a count of one means
        // only the map still refers to it
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Guards for several keys, released together when dropped.
#[derive(Debug)]
pub struct MultiGuard {
    _guards: Vec<KeyGuard>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        trace!("Acquiring lock '{}'", key);
        // the DashMap shard guard is released before awaiting
        let mutex = self.entry(key);
        let guard = mutex.lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            key: key.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Locks every key in sorted order, each key once.
    pub async fn lock_many<I, S>(&self, keys: I) -> MultiGuard
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(&key).await);
        }
        MultiGuard { _guards: guards }
    }

    pub async fn lock_topic(&self, topic_id: &TopicId) -> KeyGuard {
        self.lock(&topic_key(topic_id)).await
    }

    pub async fn lock_topics(&self, topic_ids: &[&TopicId]) -> MultiGuard {
        self.lock_many(topic_ids.iter().map(|id| topic_key(id))).await
    }

    pub async fn lock_name(&self, normalized: &str) -> KeyGuard {
        self.lock(&format!("name:{}", normalized)).await
    }

    pub async fn lock_article(&self, article_id: &str) -> KeyGuard {
        self.lock(&format!("article:{}", article_id)).await
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub fn topic_key(topic_id: &TopicId) -> String {
    format!("topic:{}", topic_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = KeyedLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("topic:t-1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("topic:a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("topic:b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_lock_many_dedups() {
        let locks = KeyedLocks::new();
        let a = TopicId::from("a");
        // would deadlock if the duplicate key were locked twice
        let guard = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock_topics(&[&a, &a]),
        )
        .await;
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn test_entries_removed_once_released() {
        let locks = KeyedLocks::new();
        let first = locks.lock("name:harbor bridge").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _second = locks.lock("name:harbor bridge").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(locks.len(), 1);

        // the waiter still needs the entry after the first holder leaves
        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());

        drop(locks.lock_topics(&[&TopicId::from("a"), &TopicId::from("b")]).await);
        assert!(locks.is_empty());
    }
}
