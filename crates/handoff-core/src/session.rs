//! Upgrade Session: one process's view of the rendezvous with the current
//! owner, produced by [`crate::coordinator::Coordinator::connect`].

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::coordinator::{Coordinator, DirLock};
use crate::error::SessionError;
use crate::os::SystemOs;
use crate::wire;

/// One-shot rendezvous with whatever owner (if any) `Coordinator::connect`
/// observed. `HasOwner` is `false` for the bootstrap case, in which this
/// session's only job is to hand the held directory lock to
/// `claim_ownership`.
pub struct UpgradeSession {
    os: Arc<dyn SystemOs>,
    conn: Option<UnixStream>,
    lock: Option<DirLock>,
    coordinator: Arc<Coordinator>,
    my_pid: i32,
}

impl UpgradeSession {
    pub(crate) fn new(
        os: Arc<dyn SystemOs>,
        conn: Option<UnixStream>,
        lock: DirLock,
        coordinator: Arc<Coordinator>,
        my_pid: i32,
    ) -> Self {
        Self {
            os,
            conn,
            lock: Some(lock),
            coordinator,
            my_pid,
        }
    }

    pub fn has_owner(&self) -> bool {
        self.conn.is_some()
    }

    /// Send the request frame and receive every `(name, fd)` pair the
    /// predecessor streams back. Empty immediately if there is no owner.
    #[instrument(level = "debug", skip(self), fields(has_owner = self.has_owner()))]
    pub fn get_files(&mut self) -> Result<Vec<(String, OwnedFd)>, SessionError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(Vec::new());
        };
        let _ = conn.set_read_timeout(Some(DEFAULT_TRANSFER_TIMEOUT));

        wire::send_request(conn).map_err(SessionError::SendRequest)?;
        let count = wire::recv_count(conn).map_err(SessionError::ReadCount)?;

        debug!(count, "receiving fd transfer payload");
        let mut files = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, fd) = wire::recv_named_fd(self.os.as_ref(), conn)?;
            files.push((name, fd));
        }
        Ok(files)
    }

    /// Send the ready byte. Must only be called after `get_files` succeeded
    /// and only when there is an owner to notify.
    #[instrument(level = "debug", skip(self))]
    pub fn send_ready(&mut self) -> Result<(), SessionError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        wire::send_ready(conn).map_err(SessionError::SendReady)
    }

    /// Register this process as the current owner: write `owner.pid` and
    /// release the held directory lock. Called exactly once per session, by
    /// every process that reaches `Owner` — the bootstrap case (no
    /// predecessor to notify) and the handoff case (after `send_ready`)
    /// alike. Skipping this on the handoff path would leave `owner.pid`
    /// pinned to the predecessor's pid indefinitely, which a later
    /// successor could misread as itself once that pid is reused.
    #[instrument(level = "debug", skip(self))]
    pub fn claim_ownership(&mut self) -> Result<(), SessionError> {
        let lock = self.lock.take().expect("claim_ownership called twice");
        self.coordinator.claim_ownership(lock, self.my_pid)?;
        Ok(())
    }

    /// Release any held coordination-directory lock and close the session
    /// socket. Idempotent.
    pub fn close(&mut self) {
        self.lock = None;
        self.conn = None;
    }
}

impl Drop for UpgradeSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// How long the successor will wait for a `get_files` round-trip before
/// giving up and reporting a transfer error. Distinct from the
/// predecessor-side ready-timeout in `upgrader.rs`; this bounds the
/// successor's own patience for an unresponsive predecessor.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::Cancellation;
    use crate::os::RealOs;
    use crate::store::{Fds, Network};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_session_returns_empty_payload() {
        let dir = tempdir().unwrap();
        let os: Arc<dyn SystemOs> = Arc::new(RealOs);
        let coordinator = Arc::new(Coordinator::new(dir.path(), Arc::clone(&os)).unwrap());
        let (conn, lock) = coordinator.connect(&Cancellation::never()).unwrap();
        let mut session = UpgradeSession::new(Arc::clone(&os), conn, lock, Arc::clone(&coordinator), 123);

        assert!(!session.has_owner());
        let files = session.get_files().unwrap();
        assert!(files.is_empty());

        session.claim_ownership().unwrap();
        let owner_file = dir.path().join("owner.pid");
        let contents = std::fs::read_to_string(owner_file).unwrap();
        assert_eq!(contents, "123");
    }

    #[test]
    fn end_to_end_transfer_over_loopback_predecessor() {
        // Simulate the predecessor side directly against the wire protocol,
        // since a full Coordinator-mediated handshake needs two real
        // processes (exercised in upgrader.rs's fork-based tests).
        let dir = tempdir().unwrap();
        let os: Arc<dyn SystemOs> = Arc::new(RealOs);
        let predecessor = Fds::new(Arc::clone(&os));
        predecessor
            .listen("l", Network::Tcp, "127.0.0.1:0")
            .unwrap();

        let coordinator = Arc::new(Coordinator::new(dir.path(), Arc::clone(&os)).unwrap());
        // Register this (test) process as owner before binding, the same
        // way a bootstrap Upgrader's `claim_ownership` would.
        let my_pid = os.pid();
        let (bootstrap_conn, bootstrap_lock) = coordinator.connect(&Cancellation::never()).unwrap();
        assert!(bootstrap_conn.is_none());
        coordinator.claim_ownership(bootstrap_lock, my_pid).unwrap();
        let listener = coordinator.listen(&Cancellation::never()).unwrap();

        let predecessor_os = Arc::clone(&os);
        let predecessor_store = predecessor;
        let handle = std::thread::spawn(move || {
            let (mut conn, _addr) = listener.accept().unwrap();
            wire::recv_request(&mut conn).unwrap();
            let snapshot = predecessor_store.copy().unwrap();
            wire::send_count(&mut conn, snapshot.len() as u64).unwrap();
            for (name, fd) in &snapshot {
                use std::os::fd::AsRawFd;
                wire::send_named_fd(predecessor_os.as_ref(), &mut conn, name, fd.as_raw_fd())
                    .unwrap();
            }
            wire::recv_ready(&mut conn).unwrap();
        });

        let coordinator2 = Arc::new(Coordinator::new(dir.path(), Arc::clone(&os)).unwrap());
        let (conn, lock) = coordinator2.connect(&Cancellation::never()).unwrap();
        assert!(conn.is_some());
        let mut session = UpgradeSession::new(Arc::clone(&os), conn, lock, coordinator2, 999);
        let files = session.get_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "l");
        session.send_ready().unwrap();

        handle.join().unwrap();
    }
}
