//! Replicated per-path file state.
//!
//! Mutated only from inside a remote task holding the cluster map's
//! per-key lock; nothing here takes a lock itself.

use std::time::{Instant, SystemTime};

use bitflags::bitflags;

use super::per_node::FileId;

bitflags! {
    /// Accesses an opener requests, and accesses an opener allows
    /// concurrent openers to hold at the same time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u8 {
        const READ   = 0b001;
        const WRITE  = 0b010;
        const DELETE = 0b100;
    }
}

bitflags! {
    /// Which `ClusterFileState` fields a mutator changed, so notification
    /// listeners know what to republish.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingUpdate: u16 {
        const OPEN_COUNT   = 1 << 0;
        const SHARING_MODE = 1 << 1;
        const STATUS       = 1 << 2;
        const DATES        = 1 << 3;
        const SIZE         = 1 << 4;
        const ALLOC_SIZE   = 1 << 5;
        const OPLOCK       = 1 << 6;
        const RETENTION    = 1 << 7;
        const LOCKS        = 1 << 8;
        const DATA_UPDATE  = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    NotExist,
    FileExists,
    DirectoryExists,
    Renamed,
}

/// Oplock strength, weakest to strongest: `LevelII` (read cache only),
/// `Exclusive` (read+write cache), `Batch` (also caches close/open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplockKind {
    LevelII,
    Exclusive,
    Batch,
}

/// Identifies the handle an oplock (or byte lock) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId {
    pub session: u64,
    pub tree: u64,
    pub file_id: FileId,
}

/// An oplock record: `Local` if this node holds the
/// cached handle, `Remote` if another node's session owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpLock {
    Local { kind: OplockKind, owner: OwnerId },
    Remote { holder_node: String, kind: OplockKind, owner: OwnerId },
}

impl OpLock {
    pub fn kind(&self) -> OplockKind {
        match self {
            OpLock::Local { kind, .. } | OpLock::Remote { kind, .. } => *kind,
        }
    }

    pub fn owner(&self) -> OwnerId {
        match self {
            OpLock::Local { owner, .. } | OpLock::Remote { owner, .. } => *owner,
        }
    }

    pub fn holder_node(&self) -> Option<&str> {
        match self {
            OpLock::Local { .. } => None,
            OpLock::Remote { holder_node, .. } => Some(holder_node),
        }
    }
}

/// A half-open byte range `[offset, offset+length)` owned by one principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLock {
    pub offset: u64,
    pub length: u64,
    pub owner_pid: u32,
    pub owner_session: u64,
    /// True if this lock conflicts with concurrent reads too; only
    /// exclusive locks conflict against a read.
    pub exclusive: bool,
}

impl ByteLock {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlaps(&self, other_offset: u64, other_length: u64) -> bool {
        let other_end = other_offset + other_length;
        self.offset < other_end && other_offset < self.end()
    }

    pub fn same_owner(&self, pid: u32, session: u64) -> bool {
        self.owner_pid == pid && self.owner_session == session
    }
}

/// An opener's requested access and the concurrent access it allows others.
#[derive(Debug, Clone, Copy)]
pub struct AccessParams {
    pub access: AccessMask,
    pub share_allow: AccessMask,
}

impl AccessParams {
    /// Windows-style compatibility: two opens are compatible iff each
    /// requests no more than the other allows.
    pub fn compatible_with(&self, existing: &AccessParams) -> bool {
        self.access.intersection(existing.share_allow) == self.access
            && existing.access.intersection(self.share_allow) == existing.access
    }
}

/// One opener's grant, tracked so a later opener's compatibility check can
/// see what access is actually outstanding rather than just the narrowed
/// sharing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantedAccess {
    pub owner: OwnerId,
    pub access: AccessMask,
    pub share_allow: AccessMask,
}

/// Replicated, single-writer-per-key file state.
#[derive(Debug, Clone)]
pub struct ClusterFileState {
    pub path: String,
    pub open_count: u32,
    pub opens: Vec<GrantedAccess>,
    pub status: FileStatus,
    pub change_date: SystemTime,
    pub modify_date: SystemTime,
    pub file_size: u64,
    pub allocation_size: u64,
    pub oplock: Option<OpLock>,
    pub retention_expiry: Option<SystemTime>,
    pub locks: Vec<ByteLock>,
    pub pending: PendingUpdate,
    pub data_update_node: Option<String>,
    pub break_pending_since: Option<Instant>,
}

impl ClusterFileState {
    pub fn new(path: String) -> Self {
        let now = SystemTime::now();
        Self {
            path,
            open_count: 0,
            opens: Vec::new(),
            status: FileStatus::NotExist,
            change_date: now,
            modify_date: now,
            file_size: 0,
            allocation_size: 0,
            oplock: None,
            retention_expiry: None,
            locks: Vec::new(),
            pending: PendingUpdate::empty(),
            data_update_node: None,
            break_pending_since: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.open_count == 0 && self.oplock.is_none() && self.data_update_node.is_none()
    }

    pub fn mark(&mut self, flags: PendingUpdate) {
        self.pending.insert(flags);
    }

    /// Union of every outstanding opener's granted access.
    pub fn aggregate_access(&self) -> AccessMask {
        self.opens.iter().fold(AccessMask::empty(), |acc, open| acc.union(open.access))
    }

    /// Narrowest sharing mode every outstanding opener allows; `all()` when
    /// nothing is open, since there is nothing to restrict against.
    pub fn aggregate_share_allow(&self) -> AccessMask {
        self.opens.iter().fold(AccessMask::all(), |acc, open| acc.intersection(open.share_allow))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn access_params_compatibility_follows_windows_semantics() {
        let reader = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
        let other_reader = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
        assert!(reader.compatible_with(&other_reader));

        let writer = AccessParams { access: AccessMask::WRITE, share_allow: AccessMask::empty() };
        assert!(!reader.compatible_with(&writer));
    }

    #[test]
    fn byte_lock_overlap_detection() {
        let a = ByteLock { offset: 0, length: 100, owner_pid: 1, owner_session: 1, exclusive: true };
        assert!(a.overlaps(50, 100));
        assert!(!a.overlaps(100, 50));
    }

    #[test]
    fn new_state_is_idle_and_not_exist() {
        let state = ClusterFileState::new("/share/a.txt".into());
        assert!(state.is_idle());
        assert_eq!(state.status, FileStatus::NotExist);
    }
}
