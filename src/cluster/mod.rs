//! Clustered file-state cache: replicated per-path state, remote tasks,
//! oplock break coordination, and the cluster topic.

pub mod bus;
pub mod cache;
pub mod map;
pub mod oplock_break;
pub mod per_node;
pub mod pool;
pub mod state;
pub mod tasks;

pub use bus::{ClusterBus, ClusterEvent};
pub use cache::StateCache;
pub use map::{ClusterMap, LocalClusterMap};
pub use oplock_break::{BreakOutcome, OplockBreakCallback, OplockBreakCoordinator};
pub use per_node::{DataStatus, DeferredRequest, FileId, PerNodeState};
pub use pool::DeferredSlotPool;
pub use state::{
    AccessMask, AccessParams, ByteLock, ClusterFileState, FileStatus, GrantedAccess, OpLock, OplockKind, OwnerId, PendingUpdate,
};
pub use tasks::{AccessToken, GrantOutcome, RemoteTaskOp, TaskReply};
