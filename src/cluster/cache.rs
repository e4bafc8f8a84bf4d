//! State cache facade: the public surface protocol layers call.
//!
//! Every mutator dispatches a remote task to the key's owner through the
//! cluster map and blocks the caller until it returns, then updates the
//! local per-node mirror on success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;

use super::bus::{ClusterBus, ClusterEvent};
use super::map::ClusterMap;
use super::per_node::{FileId, PerNodeState};
use super::state::{AccessParams, ByteLock, ClusterFileState, FileStatus, OpLock, OplockKind, OwnerId};
use super::tasks::{self, AccessToken, GrantOutcome, RemoteTaskOp, TaskReply};

/// Lower-cases, strips a trailing separator, and collapses duplicate
/// separators, matching the canonicalization every facade call applies
/// before touching the map.
pub fn canonicalize(path: &str) -> String {
    let lower = path.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_sep = false;
    for ch in lower.chars() {
        if ch == '/' || ch == '\\' {
            if last_was_sep {
                continue;
            }
            out.push('/');
            last_was_sep = true;
        } else {
            out.push(ch);
            last_was_sep = false;
        }
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Public facade over the replicated map plus each node's local mirror.
pub struct StateCache<M: ClusterMap<String, ClusterFileState>> {
    map: Arc<M>,
    bus: ClusterBus,
    local_node: String,
    per_node: Mutex<HashMap<String, PerNodeState>>,
    next_file_id: AtomicU64,
    next_grant_sequence: AtomicU64,
    deferred_capacity: usize,
}

impl<M: ClusterMap<String, ClusterFileState>> StateCache<M> {
    pub fn new(map: Arc<M>, bus: ClusterBus, local_node: impl Into<String>, deferred_capacity: usize) -> Self {
        Self {
            map,
            bus,
            local_node: local_node.into(),
            per_node: Mutex::new(HashMap::new()),
            next_file_id: AtomicU64::new(1),
            next_grant_sequence: AtomicU64::new(1),
            deferred_capacity,
        }
    }

    pub async fn find(&self, path: &str) -> Option<ClusterFileState> {
        self.map.peek(&canonicalize(path)).await
    }

    /// Idempotent: returns the existing state if present, otherwise creates
    /// an empty one.
    pub async fn create(&self, path: &str) -> Result<ClusterFileState> {
        let key = canonicalize(path);
        self.map
            .submit(key.clone(), move |slot| {
                let state = slot.get_or_insert_with(|| ClusterFileState::new(key));
                (Some(state.clone()), state.clone())
            })
            .await
    }

    /// Only when no opens, no oplock, no data update.
    pub async fn remove(&self, path: &str) -> Result<bool> {
        let key = canonicalize(path);
        let removed = self
            .map
            .submit(key.clone(), |slot| match slot.as_ref() {
                Some(state) if state.is_idle() => (None, true),
                Some(_) => (slot.take(), false),
                None => (None, false),
            })
            .await?;
        if removed {
            self.per_node.lock().unwrap().remove(&key);
        }
        Ok(removed)
    }

    /// Dispatched to the owner of `oldPath`; relocates the state to
    /// `newPath`. The in-process map does this as two
    /// submits rather than one cross-key atomic step — a real cluster
    /// transport would need a two-phase protocol to make this atomic
    /// across two lock owners; this single-process stand-in accepts the
    /// narrow race in exchange for a much simpler `ClusterMap` trait.
    pub async fn rename(&self, old_path: &str, new_path: &str, is_dir: bool) -> Result<bool> {
        let old_key = canonicalize(old_path);
        let new_key = canonicalize(new_path);
        if self.map.peek(&new_key).await.is_some() {
            return Ok(false);
        }
        let removed = self.map.submit(old_key.clone(), |slot| (None, slot.take())).await?;
        let Some(mut state) = removed else {
            return Ok(false);
        };
        state.status = FileStatus::Renamed;
        state.path = new_key.clone();
        let reply = self
            .map
            .submit(new_key.clone(), move |slot| {
                *slot = Some(state);
                (slot.clone(), TaskReply::Renamed(true))
            })
            .await?;
        let renamed = matches!(reply, TaskReply::Renamed(ok) if ok);
        if renamed {
            let mut per_node = self.per_node.lock().unwrap();
            if let Some(entry) = per_node.remove(&old_key) {
                per_node.insert(new_key, entry);
            }
        }
        let _ = is_dir; // directory vs. file rename share identical bookkeeping here
        Ok(renamed)
    }

    /// Central admission-control check. On success, records a
    /// `PerNodeState` mirror for the new file id; on `BreakInProgress`,
    /// publishes `OplockBreakRequest` on the cluster topic and the caller
    /// is expected to wait for `OplockReleased` and retry.
    pub async fn grant_access(&self, path: &str, owner: OwnerId, params: AccessParams) -> Result<GrantOutcome> {
        let key = canonicalize(path);
        let grant_sequence = self.next_grant_sequence.fetch_add(1, Ordering::Relaxed);
        let local_node = self.local_node.clone();
        let op = RemoteTaskOp::GrantFileAccess { params, owner, local_node, grant_sequence };
        let reply = self.map.submit(key.clone(), tasks::build(op, key.clone())).await??;
        let TaskReply::Grant(outcome) = reply else { unreachable!("GrantFileAccess always replies with Grant") };
        match &outcome {
            GrantOutcome::Granted(_) => {
                let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                self.per_node
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_insert_with(|| PerNodeState::new(file_id, self.deferred_capacity));
            }
            GrantOutcome::BreakInProgress { holder_node } => {
                self.bus.publish(ClusterEvent::OplockBreakRequest {
                    path: key,
                    to_kind: Some(OplockKind::LevelII),
                    holder_node: holder_node.clone(),
                    sender_node: self.local_node.clone(),
                });
            }
        }
        Ok(outcome)
    }

    pub async fn release_access(&self, path: &str, token: AccessToken) -> Result<()> {
        let key = canonicalize(path);
        let reply = self.map.submit(key.clone(), tasks::build(RemoteTaskOp::ReleaseFileAccess { token }, key.clone())).await??;
        let TaskReply::Released { released_oplock, .. } = reply else {
            unreachable!("ReleaseFileAccess always replies with Released")
        };
        if released_oplock {
            debug!(path = %key, "released handle held the oplock");
            self.bus.publish(ClusterEvent::OplockReleased { path: key, sender_node: self.local_node.clone() });
        }
        Ok(())
    }

    pub async fn add_oplock(&self, path: &str, oplock: OpLock) -> Result<()> {
        let key = canonicalize(path);
        self.map.submit(key.clone(), tasks::build(RemoteTaskOp::AddOpLock { oplock: oplock.clone() }, key.clone())).await??;
        if let OpLock::Local { .. } = &oplock {
            if let Some(entry) = self.per_node.lock().unwrap().get_mut(&key) {
                entry.local_oplock = Some(oplock);
            }
        }
        Ok(())
    }

    pub async fn change_oplock(&self, path: &str, new_kind: OplockKind) -> Result<()> {
        let key = canonicalize(path);
        self.map.submit(key.clone(), tasks::build(RemoteTaskOp::ChangeOpLockType { new_kind }, key.clone())).await??;
        if let Some(entry) = self.per_node.lock().unwrap().get_mut(&key) {
            if let Some(local) = &mut entry.local_oplock {
                *local = match local.clone() {
                    OpLock::Local { owner, .. } => OpLock::Local { kind: new_kind, owner },
                    remote @ OpLock::Remote { .. } => remote,
                };
            }
        }
        Ok(())
    }

    pub async fn clear_oplock(&self, path: &str) -> Result<()> {
        let key = canonicalize(path);
        self.map.submit(key.clone(), tasks::build(RemoteTaskOp::RemoveOpLock, key.clone())).await??;
        if let Some(entry) = self.per_node.lock().unwrap().get_mut(&key) {
            entry.local_oplock = None;
        }
        Ok(())
    }

    pub async fn add_lock(&self, path: &str, lock: ByteLock) -> Result<()> {
        let key = canonicalize(path);
        self.map.submit(key.clone(), tasks::build(RemoteTaskOp::AddFileByteLock { lock }, key.clone())).await??;
        Ok(())
    }

    pub async fn remove_lock(&self, path: &str, lock: ByteLock) -> Result<()> {
        let key = canonicalize(path);
        self.map.submit(key.clone(), tasks::build(RemoteTaskOp::RemoveFileByteLock { lock }, key.clone())).await??;
        Ok(())
    }

    pub async fn check_lock(&self, path: &str, offset: u64, length: u64, for_write: bool) -> Result<bool> {
        let key = canonicalize(path);
        let reply = self
            .map
            .submit(key.clone(), tasks::build(RemoteTaskOp::CheckFileByteLockAccess { offset, length, for_write }, key))
            .await??;
        let TaskReply::LockAccess(allowed) = reply else { unreachable!("CheckFileByteLockAccess always replies with LockAccess") };
        Ok(allowed)
    }

    pub async fn update_status(&self, path: &str, new_status: FileStatus) -> Result<()> {
        let key = canonicalize(path);
        self.map.submit(key.clone(), tasks::build(RemoteTaskOp::UpdateState { new_status }, key.clone())).await??;
        Ok(())
    }

    pub async fn update_data_status(&self, path: &str, start: bool) -> Result<()> {
        let key = canonicalize(path);
        let node_id = self.local_node.clone();
        self.map.submit(key.clone(), tasks::build(RemoteTaskOp::FileDataUpdate { node_id, start }, key.clone())).await??;
        Ok(())
    }

    pub fn per_node_file_id(&self, path: &str) -> Option<FileId> {
        let key = canonicalize(path);
        self.per_node.lock().unwrap().get(&key).map(|entry| entry.file_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::map::LocalClusterMap;
    use crate::cluster::state::AccessMask;

    fn owner(id: u64) -> OwnerId {
        OwnerId { session: id, tree: 1, file_id: id }
    }

    fn cache() -> StateCache<LocalClusterMap<String, ClusterFileState>> {
        StateCache::new(Arc::new(LocalClusterMap::new()), ClusterBus::new(16), "node-a", 3)
    }

    #[test]
    fn canonicalize_lowercases_and_collapses_separators() {
        assert_eq!(canonicalize("/Share//A.TXT"), "/share/a.txt");
        assert_eq!(canonicalize("/share/sub/"), "/share/sub");
    }

    #[tokio::test]
    async fn grant_then_release_leaves_open_count_unchanged() {
        let cache = cache();
        let params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
        let outcome = cache.grant_access("/a", owner(1), params).await.unwrap();
        let GrantOutcome::Granted(token) = outcome else { panic!("expected grant") };
        cache.release_access("/a", token).await.unwrap();
        let state = cache.find("/a").await.unwrap();
        assert_eq!(state.open_count, 0);
    }

    #[tokio::test]
    async fn release_of_oplock_holder_publishes_oplock_released() {
        let cache = cache();
        let mut events = cache.bus.subscribe();
        let params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
        let outcome = cache.grant_access("/a", owner(1), params).await.unwrap();
        let GrantOutcome::Granted(token) = outcome else { panic!("expected grant") };
        cache.add_oplock("/a", OpLock::Local { kind: OplockKind::Batch, owner: owner(1) }).await.unwrap();
        cache.release_access("/a", token).await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, ClusterEvent::OplockReleased { path, .. } if path == "/a"));
    }

    #[tokio::test]
    async fn write_against_batch_oplock_publishes_break_request() {
        let cache = cache();
        let mut events = cache.bus.subscribe();
        let holder = owner(1);
        let read_params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ | AccessMask::WRITE };
        cache.grant_access("/a", holder, read_params).await.unwrap();
        cache.add_oplock("/a", OpLock::Local { kind: OplockKind::Batch, owner: holder }).await.unwrap();

        let write_params = AccessParams { access: AccessMask::WRITE, share_allow: AccessMask::READ | AccessMask::WRITE };
        let outcome = cache.grant_access("/a", owner(2), write_params).await.unwrap();
        assert!(matches!(outcome, GrantOutcome::BreakInProgress { .. }));
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ClusterEvent::OplockBreakRequest { path, to_kind: Some(OplockKind::LevelII), .. } if path == "/a"
        ));
    }

    #[tokio::test]
    async fn rename_fails_when_target_exists() {
        let cache = cache();
        cache.create("/a").await.unwrap();
        cache.create("/b").await.unwrap();
        assert!(!cache.rename("/a", "/b", false).await.unwrap());
        assert!(cache.find("/a").await.is_some());
    }

    #[tokio::test]
    async fn two_compatible_readers_share_open_count() {
        let cache = cache();
        let params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
        cache.grant_access("/a", owner(1), params).await.unwrap();
        cache.grant_access("/a", owner(2), params).await.unwrap();
        let state = cache.find("/a").await.unwrap();
        assert_eq!(state.open_count, 2);
    }
}
