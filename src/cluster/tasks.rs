//! Remote task set: the admission-control and mutation logic that runs
//! inside the cluster map's per-key lock. Each task is plain data plus a
//! static op code, not a captured closure.

use std::time::{Instant, SystemTime};

use crate::error::{Result, ServerError};

use super::state::{
    AccessMask, AccessParams, ByteLock, ClusterFileState, FileStatus, GrantedAccess, OpLock, OplockKind, OwnerId,
    PendingUpdate,
};

/// A granted open, handed back to the caller so it can later release or
/// reference the same sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub path: String,
    pub owner_node: String,
    pub owner: OwnerId,
    pub grant_sequence: u64,
}

/// Outcome of `GrantFileAccess`: either the access was granted, or an
/// incompatible oplock is being broken and the caller must wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted(AccessToken),
    BreakInProgress { holder_node: String },
}

/// Every remote task, addressed by path through the cluster map.
#[derive(Debug, Clone)]
pub enum RemoteTaskOp {
    RenameState { is_dir: bool },
    AddOpLock { oplock: OpLock },
    RemoveOplockOwner { owner: OwnerId },
    RemoveOpLock,
    ChangeOpLockType { new_kind: OplockKind },
    GrantFileAccess { params: AccessParams, owner: OwnerId, local_node: String, grant_sequence: u64 },
    ReleaseFileAccess { token: AccessToken },
    AddFileByteLock { lock: ByteLock },
    RemoveFileByteLock { lock: ByteLock },
    CheckFileByteLockAccess { offset: u64, length: u64, for_write: bool },
    UpdateState { new_status: FileStatus },
    FileDataUpdate { node_id: String, start: bool },
}

/// Result carried back from whichever task ran.
#[derive(Debug, Clone)]
pub enum TaskReply {
    Renamed(bool),
    OpLockAdded,
    OplockOwnerRemoved,
    OpLockCleared,
    OpLockChanged,
    Grant(GrantOutcome),
    Released { final_state: ClusterFileState, released_oplock: bool },
    LockAdded,
    LockRemoved,
    LockAccess(bool),
    StatusUpdated,
    DataUpdateStarted,
    DataUpdateEnded,
}

/// Builds the `FnOnce(&mut Option<ClusterFileState>) -> (Option<_>, Result<_>)`
/// closure `ClusterMap::submit` expects, implementing the task named by `op`
/// against the state currently stored under the map's key.
///
/// `path` is needed only to materialize a brand-new state on first access;
/// every other field is read from the existing state.
pub fn build(
    op: RemoteTaskOp,
    path: String,
) -> impl FnOnce(&mut Option<ClusterFileState>) -> (Option<ClusterFileState>, Result<TaskReply>) {
    move |slot| run(op, path, slot)
}

fn run(
    op: RemoteTaskOp,
    path: String,
    slot: &mut Option<ClusterFileState>,
) -> (Option<ClusterFileState>, Result<TaskReply>) {
    match op {
        RemoteTaskOp::RenameState { is_dir: _ } => {
            // Cross-key move: the facade (cache.rs) removes the old key and
            // inserts under the new one around this call; by the time we
            // get here `slot` already holds the state to rename.
            match slot.as_mut() {
                Some(state) => {
                    state.status = FileStatus::Renamed;
                    state.mark(PendingUpdate::STATUS);
                    (slot.take(), Ok(TaskReply::Renamed(true)))
                }
                None => (None, Ok(TaskReply::Renamed(false))),
            }
        }

        RemoteTaskOp::AddOpLock { oplock } => {
            let state = slot.get_or_insert_with(|| ClusterFileState::new(path));
            match &state.oplock {
                Some(existing) if existing.owner() != oplock.owner() => {
                    return (slot.take(), Err(ServerError::OplockExists));
                }
                Some(_) => {
                    // Idempotent if the owner matches; upgrades go through
                    // ChangeOpLockType instead.
                    return (slot.take(), Ok(TaskReply::OpLockAdded));
                }
                None => {}
            }
            state.oplock = Some(oplock);
            state.mark(PendingUpdate::OPLOCK);
            (slot.take(), Ok(TaskReply::OpLockAdded))
        }

        RemoteTaskOp::RemoveOplockOwner { owner } => {
            if let Some(state) = slot.as_mut() {
                if state.oplock.as_ref().map(|o| o.owner()) == Some(owner) {
                    state.oplock = None;
                    state.mark(PendingUpdate::OPLOCK);
                }
            }
            (slot.take(), Ok(TaskReply::OplockOwnerRemoved))
        }

        RemoteTaskOp::RemoveOpLock => {
            if let Some(state) = slot.as_mut() {
                state.oplock = None;
                state.mark(PendingUpdate::OPLOCK);
            }
            (slot.take(), Ok(TaskReply::OpLockCleared))
        }

        RemoteTaskOp::ChangeOpLockType { new_kind } => {
            let Some(state) = slot.as_mut() else {
                return (slot.take(), Err(ServerError::StateNotFound));
            };
            let Some(oplock) = state.oplock.clone() else {
                return (slot.take(), Err(ServerError::InvalidOplockTransition));
            };
            if !is_valid_transition(oplock.kind(), new_kind) {
                return (slot.take(), Err(ServerError::InvalidOplockTransition));
            }
            state.oplock = Some(match oplock {
                OpLock::Local { owner, .. } => OpLock::Local { kind: new_kind, owner },
                OpLock::Remote { holder_node, owner, .. } => OpLock::Remote { holder_node, kind: new_kind, owner },
            });
            state.mark(PendingUpdate::OPLOCK);
            (slot.take(), Ok(TaskReply::OpLockChanged))
        }

        RemoteTaskOp::GrantFileAccess { params, owner, local_node, grant_sequence } => {
            let state = slot.get_or_insert_with(|| ClusterFileState::new(path.clone()));

            if !state.opens.is_empty() {
                let existing =
                    AccessParams { access: state.aggregate_access(), share_allow: state.aggregate_share_allow() };
                if !params.compatible_with(&existing) {
                    return (slot.take(), Err(ServerError::ShareConflict));
                }
            }

            if params.access.contains(AccessMask::WRITE) {
                if let Some(oplock) = state.oplock.clone() {
                    let breaking_owner_differs = oplock.owner() != owner;
                    let breaks_on_write = matches!(oplock.kind(), OplockKind::LevelII | OplockKind::Exclusive | OplockKind::Batch);
                    if breaking_owner_differs && breaks_on_write {
                        state.break_pending_since = Some(Instant::now());
                        let holder_node = oplock.holder_node().map(str::to_owned).unwrap_or(local_node.clone());
                        state.mark(PendingUpdate::OPLOCK);
                        return (slot.take(), Ok(TaskReply::Grant(GrantOutcome::BreakInProgress { holder_node })));
                    }
                }
            }

            state.open_count += 1;
            state.opens.push(GrantedAccess { owner, access: params.access, share_allow: params.share_allow });
            state.status = FileStatus::FileExists;
            state.mark(PendingUpdate::OPEN_COUNT | PendingUpdate::SHARING_MODE | PendingUpdate::STATUS);
            let token = AccessToken { path: path.clone(), owner_node: local_node, owner, grant_sequence };
            (slot.take(), Ok(TaskReply::Grant(GrantOutcome::Granted(token))))
        }

        RemoteTaskOp::ReleaseFileAccess { token } => {
            let Some(state) = slot.as_mut() else {
                return (slot.take(), Err(ServerError::StateNotFound));
            };
            state.open_count = state.open_count.saturating_sub(1);
            state.opens.retain(|open| open.owner != token.owner);
            let mut released_oplock = false;
            if state.oplock.as_ref().map(|o| o.owner()) == Some(token.owner) {
                state.oplock = None;
                released_oplock = true;
            }
            state.mark(PendingUpdate::OPEN_COUNT | PendingUpdate::SHARING_MODE);
            let final_state = state.clone();
            (slot.take(), Ok(TaskReply::Released { final_state, released_oplock }))
        }

        RemoteTaskOp::AddFileByteLock { lock } => {
            let state = slot.get_or_insert_with(|| ClusterFileState::new(path));
            let conflict = state.locks.iter().any(|existing| {
                !existing.same_owner(lock.owner_pid, lock.owner_session) && existing.overlaps(lock.offset, lock.length)
            });
            if conflict {
                return (slot.take(), Err(ServerError::LockConflict));
            }
            state.locks.push(lock);
            state.mark(PendingUpdate::LOCKS);
            (slot.take(), Ok(TaskReply::LockAdded))
        }

        RemoteTaskOp::RemoveFileByteLock { lock } => {
            let Some(state) = slot.as_mut() else {
                return (slot.take(), Err(ServerError::LockNotHeld));
            };
            let idx = state.locks.iter().position(|existing| {
                existing.offset == lock.offset
                    && existing.length == lock.length
                    && existing.same_owner(lock.owner_pid, lock.owner_session)
            });
            match idx {
                Some(idx) => {
                    state.locks.remove(idx);
                    state.mark(PendingUpdate::LOCKS);
                    (slot.take(), Ok(TaskReply::LockRemoved))
                }
                None => (slot.take(), Err(ServerError::LockNotHeld)),
            }
        }

        RemoteTaskOp::CheckFileByteLockAccess { offset, length, for_write } => {
            let allowed = match slot.as_ref() {
                None => true,
                Some(state) => !state.locks.iter().any(|existing| {
                    existing.overlaps(offset, length) && (for_write || existing.exclusive)
                }),
            };
            (slot.take(), Ok(TaskReply::LockAccess(allowed)))
        }

        RemoteTaskOp::UpdateState { new_status } => {
            let state = slot.get_or_insert_with(|| ClusterFileState::new(path));
            state.status = new_status;
            state.change_date = SystemTime::now();
            state.mark(PendingUpdate::STATUS | PendingUpdate::DATES);
            (slot.take(), Ok(TaskReply::StatusUpdated))
        }

        RemoteTaskOp::FileDataUpdate { node_id, start } => {
            let state = slot.get_or_insert_with(|| ClusterFileState::new(path));
            if start {
                if let Some(existing) = &state.data_update_node {
                    if existing != &node_id {
                        return (slot.take(), Err(ServerError::DataUpdateInProgress));
                    }
                }
                state.data_update_node = Some(node_id);
                state.mark(PendingUpdate::DATA_UPDATE);
                (slot.take(), Ok(TaskReply::DataUpdateStarted))
            } else {
                match &state.data_update_node {
                    Some(existing) if existing == &node_id => {
                        state.data_update_node = None;
                        state.mark(PendingUpdate::DATA_UPDATE);
                        (slot.take(), Ok(TaskReply::DataUpdateEnded))
                    }
                    _ => (slot.take(), Err(ServerError::DataUpdateInProgress)),
                }
            }
        }
    }
}

/// Valid oplock downgrades: `Batch`/`Exclusive` → `LevelII`, `LevelII` →
/// cleared entirely (modeled by `RemoveOpLock`, not reached here), any
/// other transition is rejected.
fn is_valid_transition(from: OplockKind, to: OplockKind) -> bool {
    matches!((from, to), (OplockKind::Batch, OplockKind::LevelII) | (OplockKind::Exclusive, OplockKind::LevelII))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::state::OwnerId;

    fn owner(id: u64) -> OwnerId {
        OwnerId { session: id, tree: 1, file_id: id }
    }

    #[test]
    fn grant_access_increments_open_count() {
        let mut slot = None;
        let params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
        let (next, reply) = run(
            RemoteTaskOp::GrantFileAccess { params, owner: owner(1), local_node: "node-a".into(), grant_sequence: 1 },
            "/share/a.txt".into(),
            &mut slot,
        );
        let state = next.unwrap();
        assert_eq!(state.open_count, 1);
        assert!(matches!(reply.unwrap(), TaskReply::Grant(GrantOutcome::Granted(_))));
    }

    #[test]
    fn incompatible_sharing_mode_conflicts() {
        let mut slot = Some(ClusterFileState::new("/share/a.txt".into()));
        slot.as_mut().unwrap().open_count = 1;
        slot.as_mut().unwrap().opens.push(GrantedAccess {
            owner: owner(1),
            access: AccessMask::WRITE,
            share_allow: AccessMask::empty(),
        });
        let params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
        let (_next, reply) = run(
            RemoteTaskOp::GrantFileAccess { params, owner: owner(2), local_node: "node-b".into(), grant_sequence: 2 },
            "/share/a.txt".into(),
            &mut slot,
        );
        assert!(matches!(reply, Err(ServerError::ShareConflict)));
    }

    #[test]
    fn existing_writer_blocks_new_exclusive_opener() {
        let mut slot = Some(ClusterFileState::new("/share/a.txt".into()));
        slot.as_mut().unwrap().open_count = 1;
        slot.as_mut().unwrap().opens.push(GrantedAccess {
            owner: owner(1),
            access: AccessMask::WRITE,
            share_allow: AccessMask::READ | AccessMask::WRITE,
        });
        let params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::empty() };
        let (_next, reply) = run(
            RemoteTaskOp::GrantFileAccess { params, owner: owner(2), local_node: "node-b".into(), grant_sequence: 2 },
            "/share/a.txt".into(),
            &mut slot,
        );
        assert!(matches!(reply, Err(ServerError::ShareConflict)));
    }

    #[test]
    fn write_access_against_batch_oplock_breaks() {
        let mut slot = Some(ClusterFileState::new("/share/b.txt".into()));
        let holder = owner(1);
        slot.as_mut().unwrap().oplock = Some(OpLock::Local { kind: OplockKind::Batch, owner: holder });
        slot.as_mut().unwrap().open_count = 1;
        let params = AccessParams { access: AccessMask::WRITE, share_allow: AccessMask::empty() };
        let (_next, reply) = run(
            RemoteTaskOp::GrantFileAccess { params, owner: owner(2), local_node: "node-x".into(), grant_sequence: 3 },
            "/share/b.txt".into(),
            &mut slot,
        );
        assert!(matches!(reply.unwrap(), TaskReply::Grant(GrantOutcome::BreakInProgress { .. })));
    }

    #[test]
    fn oplock_transition_rules() {
        assert!(is_valid_transition(OplockKind::Batch, OplockKind::LevelII));
        assert!(is_valid_transition(OplockKind::Exclusive, OplockKind::LevelII));
        assert!(!is_valid_transition(OplockKind::LevelII, OplockKind::Batch));
    }

    #[test]
    fn overlapping_byte_locks_from_different_owners_conflict() {
        let mut slot = Some(ClusterFileState::new("/share/c.txt".into()));
        let lock_a = ByteLock { offset: 0, length: 100, owner_pid: 1, owner_session: 1, exclusive: true };
        let (next, _) = run(RemoteTaskOp::AddFileByteLock { lock: lock_a }, "/share/c.txt".into(), &mut slot);
        let mut slot = next;
        let lock_b = ByteLock { offset: 50, length: 100, owner_pid: 2, owner_session: 2, exclusive: true };
        let (_next, reply) = run(RemoteTaskOp::AddFileByteLock { lock: lock_b }, "/share/c.txt".into(), &mut slot);
        assert!(matches!(reply, Err(ServerError::LockConflict)));
    }
}
