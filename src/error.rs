//! Unified error kinds for the name service and the clustered state cache.
//!
//! Every component returns `Result<T, ServerError>` so that the external
//! protocol layers (out of scope here) can map a single error surface to
//! their own status codes instead of matching on a different enum per
//! component.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error kinds enumerated in the design's error-handling section.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("malformed NetBIOS packet")]
    MalformedPacket,

    #[error("name service socket closed")]
    SocketClosed,

    #[error("name not owned by this node")]
    NameNotOwned,

    #[error("WINS registration rejected the name")]
    NameRegistrationFailed,

    #[error("sharing mode conflicts with an existing open")]
    ShareConflict,

    #[error("access denied")]
    AccessDenied,

    #[error("deferred-request queue is full")]
    DeferFailed,

    #[error("oplock break timed out")]
    BreakTimeout,

    #[error("an oplock is already held by a different owner")]
    OplockExists,

    #[error("requested oplock transition is not valid")]
    InvalidOplockTransition,

    #[error("byte-range lock conflicts with an existing lock")]
    LockConflict,

    #[error("no matching byte-range lock is held")]
    LockNotHeld,

    #[error("remote task timed out")]
    RemoteTaskTimeout,

    #[error("no cluster state exists for this path")]
    StateNotFound,

    #[error("a data update is already in progress on another node")]
    DataUpdateInProgress,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
