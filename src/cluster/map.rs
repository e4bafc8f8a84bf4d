//! Cluster map abstraction: the "submit a closure to the owner of key K"
//! executor the real cluster transport provides externally.
//!
//! This crate ships the trait plus a single-process implementation backed
//! by [`whirlwind::ShardMap`], so the facade and remote tasks are fully
//! exercisable without an actual cluster. A real deployment would provide
//! another `ClusterMap` impl that ships the closure's op code to the
//! owning process over the network.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use whirlwind::ShardMap;

use crate::error::Result;

/// A distributed map guaranteeing single-writer-per-key mutation.
///
/// `submit` is the only mutation path: the closure runs with exclusive
/// access to the slot for `key`, sees its current value (`None` if absent),
/// and returns the new value plus an arbitrary reply.
#[async_trait]
pub trait ClusterMap<K, V>: Send + Sync
where
    K: Eq + Hash + Send + Sync + Clone + 'static,
    V: Send + Sync + Clone + 'static,
{
    async fn submit<F, R>(&self, key: K, f: F) -> Result<R>
    where
        F: FnOnce(&mut Option<V>) -> (Option<V>, R) + Send + 'static,
        R: Send + 'static;

    async fn peek(&self, key: &K) -> Option<V>;

    async fn remove(&self, key: &K) -> Option<V>;
}

/// In-process `ClusterMap` backed by a sharded concurrent map. Each slot is
/// its own `tokio::sync::Mutex`, so `submit` against disjoint keys runs
/// concurrently while same-key calls serialize — the per-key lock the real
/// transport requires.
pub struct LocalClusterMap<K, V>
where
    K: Eq + Hash + Send + Sync + Clone + 'static,
    V: Send + Sync + Clone + 'static,
{
    shards: ShardMap<K, Arc<Mutex<Option<V>>>>,
}

impl<K, V> LocalClusterMap<K, V>
where
    K: Eq + Hash + Send + Sync + Clone + 'static,
    V: Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        Self { shards: ShardMap::new() }
    }

    async fn slot(&self, key: &K) -> Arc<Mutex<Option<V>>> {
        if let Some(existing) = self.shards.get(key).await {
            return existing.clone();
        }
        let slot = Arc::new(Mutex::new(None));
        self.shards.insert(key.clone(), slot.clone()).await;
        slot
    }
}

impl<K, V> Default for LocalClusterMap<K, V>
where
    K: Eq + Hash + Send + Sync + Clone + 'static,
    V: Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> ClusterMap<K, V> for LocalClusterMap<K, V>
where
    K: Eq + Hash + Send + Sync + Clone + 'static,
    V: Send + Sync + Clone + 'static,
{
    async fn submit<F, R>(&self, key: K, f: F) -> Result<R>
    where
        F: FnOnce(&mut Option<V>) -> (Option<V>, R) + Send + 'static,
        R: Send + 'static,
    {
        let slot = self.slot(&key).await;
        let mut guard = slot.lock().await;
        let (new_value, reply) = f(&mut guard);
        *guard = new_value;
        Ok(reply)
    }

    async fn peek(&self, key: &K) -> Option<V> {
        let entry = self.shards.get(key).await?;
        let guard = entry.lock().await;
        guard.clone()
    }

    async fn remove(&self, key: &K) -> Option<V> {
        let entry = self.shards.remove(key).await?;
        let guard = entry.lock().await;
        guard.clone()
    }
}

/// Runs `fut` to completion, a helper kept for call sites that need to
/// block a synchronous caller on an async `submit`.
pub async fn submit_and_wait<T>(fut: impl Future<Output = T>) -> T {
    fut.await
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn submit_creates_then_updates() {
        let map: LocalClusterMap<String, i32> = LocalClusterMap::new();
        let reply = map
            .submit("a".to_owned(), |slot| {
                assert!(slot.is_none());
                (Some(1), "created")
            })
            .await
            .unwrap();
        assert_eq!(reply, "created");
        assert_eq!(map.peek(&"a".to_owned()).await, Some(1));

        map.submit("a".to_owned(), |slot| {
            let current = slot.unwrap();
            (Some(current + 1), ())
        })
        .await
        .unwrap();
        assert_eq!(map.peek(&"a".to_owned()).await, Some(2));
    }

    #[tokio::test]
    async fn remove_clears_the_slot() {
        let map: LocalClusterMap<String, i32> = LocalClusterMap::new();
        map.submit("a".to_owned(), |_| (Some(7), ())).await.unwrap();
        assert_eq!(map.remove(&"a".to_owned()).await, Some(7));
        assert_eq!(map.peek(&"a".to_owned()).await, None);
    }
}
