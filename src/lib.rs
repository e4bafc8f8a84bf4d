//! NetBIOS name service node and clustered file-state cache: the
//! distributed-systems core of a multi-protocol file server. SMB/FTP/NFS
//! dispatch, authentication, and disk I/O are out of scope; this crate
//! owns name registration/resolution over NetBIOS and per-path state
//! replication, oplock, and byte-lock coordination across cluster nodes.

pub mod cluster;
pub mod config;
pub mod error;
pub mod netbios;

pub use config::Config;
pub use error::{Result, ServerError};
