//! Error taxonomy for the crate.
//!
//! Each component defines its own `thiserror` enum, following the same
//! shape throughout: struct-style variants that carry whatever path, name,
//! or source error produced the failure. [`Error`] unifies them for callers
//! who don't need to match on a specific component's variants.

use std::path::PathBuf;

use crate::upgrader::State;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("failed to acquire coordination directory lock at {path:?}")]
    LockContended { path: PathBuf },
    #[error("cancelled while waiting for coordination directory lock at {path:?}")]
    Cancelled { path: PathBuf },
    #[error("failed to read owner pid file {path:?}")]
    ReadOwnerFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("owner pid file {path:?} does not contain a valid pid")]
    InvalidOwnerFile { path: PathBuf },
    #[error("failed to write owner pid file {path:?}")]
    WriteOwnerFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind upgrade socket {path:?}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to unlink stale upgrade socket {path:?}")]
    UnlinkStaleSocket {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("owner pid {pid} is stale, socket {path:?} is unreachable")]
    StaleOwner { pid: i32, path: PathBuf },
    #[error("failed to connect to owner socket {path:?}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create coordination directory {path:?}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("fd store mutations are locked: {reason}")]
    MutationsLocked { reason: LockReason },
    #[error("failed to open {path:?} under name {name:?}")]
    Open {
        name: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to listen on {network} {addr} under name {name:?}")]
    Listen {
        name: String,
        network: String,
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to open fd under name {name:?}")]
    OpenWith {
        name: String,
        source: std::io::Error,
    },
    #[error("failed to duplicate fd named {name:?} while snapshotting the store")]
    Duplicate {
        name: String,
        source: nix::Error,
    },
}

/// The reason mutations are currently rejected, carried by [`StoreError::MutationsLocked`].
///
/// A later `lock_mutations` call overrides an earlier reason in place, so a
/// caller blocked on `UpgradeInProgress` observes `UpgradeCompleted` once the
/// handoff commits without needing to poll in a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    UpgradeInProgress,
    UpgradeCompleted,
    UpgraderStopped,
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockReason::UpgradeInProgress => "upgrade in progress",
            LockReason::UpgradeCompleted => "upgrade completed",
            LockReason::UpgraderStopped => "upgrader stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transfer error while sending request frame")]
    SendRequest(#[source] std::io::Error),
    #[error("transfer error while reading request frame")]
    ReadRequest(#[source] std::io::Error),
    #[error("transfer error while sending payload count")]
    SendCount(#[source] std::io::Error),
    #[error("transfer error while reading payload count")]
    ReadCount(#[source] std::io::Error),
    #[error("transfer error while reading descriptor name")]
    ReadName(#[source] std::io::Error),
    #[error("transfer error: descriptor name is not valid utf-8")]
    InvalidName,
    #[error("transfer error: no descriptor attached to frame for {name:?}")]
    MissingFd { name: String },
    #[error("transfer error while sending name length for {name:?}")]
    SendName {
        name: String,
        source: std::io::Error,
    },
    #[error("transfer error while sending descriptor {name:?}")]
    SendFd {
        name: String,
        source: nix::Error,
    },
    #[error("transfer error while receiving descriptor {name:?}")]
    RecvFd {
        name: String,
        source: nix::Error,
    },
    #[error("transfer error while sending ready byte")]
    SendReady(#[source] std::io::Error),
    #[error("transfer error while reading ready byte")]
    ReadReady(#[source] std::io::Error),
    #[error("peer closed the connection before sending the ready byte")]
    PeerClosed,
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum UpgraderError {
    #[error("illegal state transition from {from:?} to {to:?}")]
    IllegalTransition { from: State, to: State },
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to set up the upgrade listener poller")]
    Poller(#[source] std::io::Error),
}

/// Crate-wide error, for callers that don't need to match on a specific
/// component's variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Upgrader(#[from] UpgraderError),
}
