//! Named file-descriptor store with mutation-lock semantics.
//!
//! The mutation lock is a semantic barrier, not a reader-writer lock:
//! [`Fds::file`] always succeeds, mutating calls fail once
//! [`Fds::lock_mutations`] has been called. The lock reason can be
//! overridden in place (`UpgradeInProgress` becomes `UpgradeCompleted`)
//! without clearing and re-locking, so a caller blocked in a retry loop
//! observes the more final reason on its next attempt.

use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{LockReason, StoreError};
use crate::os::SystemOs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

struct Inner {
    entries: HashMap<String, Arc<OwnedFd>>,
    lock_reason: Option<LockReason>,
}

/// Per-process named collection of open file descriptors, shared between
/// the caller and the accept-loop handler that snapshots it during an
/// upgrade.
pub struct Fds {
    os: Arc<dyn SystemOs>,
    inner: Mutex<Inner>,
}

impl Fds {
    pub fn new(os: Arc<dyn SystemOs>) -> Self {
        Self {
            os,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lock_reason: None,
            }),
        }
    }

    /// Build a store already populated from a transfer payload, as the
    /// successor does right after `GetFiles` returns.
    pub fn from_entries(os: Arc<dyn SystemOs>, entries: Vec<(String, OwnedFd)>) -> Self {
        let store = Self::new(os);
        {
            let mut inner = store.inner.lock().unwrap();
            for (name, fd) in entries {
                inner.entries.insert(name, Arc::new(fd));
            }
        }
        store
    }

    fn check_mutable(inner: &Inner) -> Result<(), StoreError> {
        match inner.lock_reason {
            Some(reason) => Err(StoreError::MutationsLocked { reason }),
            None => Ok(()),
        }
    }

    /// Open `path` under `name` with the default path-based opener.
    /// Idempotent: a second call with the same name returns the existing fd
    /// without touching the filesystem again.
    pub fn open(&self, name: &str, path: &Path) -> Result<Arc<OwnedFd>, StoreError> {
        let os = Arc::clone(&self.os);
        self.open_with(name, path, move |p| os.open(p))
    }

    /// Generalized `open`: `opener` is called with `arg` only if `name` is
    /// not already bound. Accepts any opener error convertible to
    /// `std::io::Error`, since callers reach for both `std::fs` (`io::Error`
    /// directly) and `nix` syscalls (`nix::Error`) depending on what's being
    /// opened.
    pub fn open_with<A, E>(
        &self,
        name: &str,
        arg: A,
        opener: impl FnOnce(A) -> Result<OwnedFd, E>,
    ) -> Result<Arc<OwnedFd>, StoreError>
    where
        E: Into<std::io::Error>,
    {
        let mut inner = self.inner.lock().unwrap();
        Self::check_mutable(&inner)?;

        if let Some(existing) = inner.entries.get(name) {
            return Ok(Arc::clone(existing));
        }

        let fd = opener(arg).map_err(|source| StoreError::OpenWith {
            name: name.to_string(),
            source: source.into(),
        })?;
        let fd = Arc::new(fd);
        inner.entries.insert(name.to_string(), Arc::clone(&fd));
        Ok(fd)
    }

    /// Bind a listening socket under `name`, unless already bound.
    pub fn listen(&self, name: &str, network: Network, addr: &str) -> Result<Arc<OwnedFd>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_mutable(&inner)?;

        if let Some(existing) = inner.entries.get(name) {
            return Ok(Arc::clone(existing));
        }

        let fd: OwnedFd = match network {
            Network::Tcp => TcpListener::bind(addr)
                .map_err(|source| StoreError::Listen {
                    name: name.to_string(),
                    network: "tcp".to_string(),
                    addr: addr.to_string(),
                    source,
                })?
                .into(),
            Network::Unix => {
                if Path::new(addr).exists() {
                    let _ = std::fs::remove_file(addr);
                }
                UnixListener::bind(addr)
                    .map_err(|source| StoreError::Listen {
                        name: name.to_string(),
                        network: "unix".to_string(),
                        addr: addr.to_string(),
                        source,
                    })?
                    .into()
            }
        };

        let fd = Arc::new(fd);
        inner.entries.insert(name.to_string(), Arc::clone(&fd));
        Ok(fd)
    }

    /// Remove and close the descriptor named `name`. A no-op if unbound.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_mutable(&inner)?;
        inner.entries.remove(name);
        Ok(())
    }

    /// Read-only lookup. Never fails due to the mutation lock.
    pub fn file(&self, name: &str) -> Option<Arc<OwnedFd>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.entries.keys().cloned().collect()
    }

    /// Snapshot the store for a transfer payload. Each descriptor is
    /// duplicated so the predecessor's originals keep serving in-flight
    /// work regardless of what the successor does with its copies.
    pub fn copy(&self) -> Result<Vec<(String, OwnedFd)>, StoreError> {
        use std::os::fd::AsFd;

        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .map(|(name, fd)| {
                let dup = self.os.dup(fd.as_fd()).map_err(|source| StoreError::Duplicate {
                    name: name.clone(),
                    source,
                })?;
                Ok((name.clone(), dup))
            })
            .collect()
    }

    /// Set the mutation lock. Idempotent; a later call overrides the
    /// reason in place rather than requiring an unlock first.
    pub fn lock_mutations(&self, reason: LockReason) {
        let mut inner = self.inner.lock().unwrap();
        inner.lock_reason = Some(reason);
    }

    pub fn unlock_mutations(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.lock_reason = None;
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().lock_reason.is_some()
    }

    /// Close every descriptor still present. Called exactly once, at
    /// Upgrader stop.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
    }
}
