//! Filesystem-level mutual exclusion and rendezvous over the coordination
//! directory (`coordination.lock`, `owner.pid`, `${pid}.sock`).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use nix::unistd::Pid;
use tracing::{instrument, warn};

use crate::cancellation::{Cancellation, PollOutcome};
use crate::error::CoordinatorError;
use crate::os::SystemOs;

const LOCK_FILE: &str = "coordination.lock";
const OWNER_FILE: &str = "owner.pid";
const LOCK_POLL_MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Holds the coordination directory's `flock` for as long as it's alive.
/// Dropping it (or calling [`DirLock::release`]) releases the lock, since
/// an advisory `flock` is tied to the open file description.
pub struct DirLock {
    file: Option<File>,
}

impl DirLock {
    pub fn release(&mut self) {
        self.file = None;
    }
}

pub struct Coordinator {
    dir: PathBuf,
    os: Arc<dyn SystemOs>,
}

impl Coordinator {
    pub fn new(dir: impl Into<PathBuf>, os: Arc<dyn SystemOs>) -> Result<Self, CoordinatorError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CoordinatorError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, os })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    fn owner_path(&self) -> PathBuf {
        self.dir.join(OWNER_FILE)
    }

    pub fn socket_path(&self, pid: i32) -> PathBuf {
        self.dir.join(format!("{pid}.sock"))
    }

    /// Acquire the directory lock, retrying a non-blocking `flock` with
    /// backoff so `cancel` can interrupt a contended wait (a blocking
    /// `flock(2)` cannot otherwise be woken from another thread).
    fn lock_directory(&self, cancel: &Cancellation) -> Result<DirLock, CoordinatorError> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|_| CoordinatorError::LockContended { path: path.clone() })?;

        let outcome = cancel.poll_until(None, LOCK_POLL_MAX_BACKOFF, || {
            flock(&file, FlockArg::LockExclusiveNonblock).ok()
        });

        match outcome {
            PollOutcome::Ready(()) => Ok(DirLock { file: Some(file) }),
            PollOutcome::Cancelled => Err(CoordinatorError::Cancelled { path }),
            PollOutcome::TimedOut => Err(CoordinatorError::LockContended { path }),
        }
    }

    fn read_owner_pid(&self) -> Result<Option<i32>, CoordinatorError> {
        let path = self.owner_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map_err(|source| CoordinatorError::ReadOwnerFile {
                path: path.clone(),
                source,
            })?;
        let contents = contents.trim();
        if contents.is_empty() {
            return Ok(None);
        }
        contents
            .parse::<i32>()
            .map(Some)
            .map_err(|_| CoordinatorError::InvalidOwnerFile { path })
    }

    fn write_owner_pid(&self, pid: i32) -> Result<(), CoordinatorError> {
        let path = self.owner_path();
        let mut file = File::create(&path).map_err(|source| CoordinatorError::WriteOwnerFile {
            path: path.clone(),
            source,
        })?;
        file.write_all(pid.to_string().as_bytes())
            .map_err(|source| CoordinatorError::WriteOwnerFile { path, source })
    }

    /// Acquire the directory lock, bind `${my_pid}.sock`, release the lock,
    /// and return the listener. Unlinks a stale socket left behind by a
    /// prior process that reused this pid.
    #[instrument(level = "debug", skip(self, cancel), fields(dir = %self.dir.display()))]
    pub fn listen(&self, cancel: &Cancellation) -> Result<UnixListener, CoordinatorError> {
        let mut lock = self.lock_directory(cancel)?;
        let my_pid = self.os.pid();
        let sock_path = self.socket_path(my_pid);

        if sock_path.exists() {
            fs::remove_file(&sock_path).map_err(|source| CoordinatorError::UnlinkStaleSocket {
                path: sock_path.clone(),
                source,
            })?;
        }

        let listener =
            UnixListener::bind(&sock_path).map_err(|source| CoordinatorError::Bind {
                path: sock_path,
                source,
            })?;

        lock.release();
        Ok(listener)
    }

    /// Acquire the directory lock, read `owner.pid`, and — if present — dial
    /// the owner's socket. The lock is held across the dial and returned to
    /// the caller: the caller must release it by calling
    /// [`Coordinator::claim_ownership`] or by dropping the guard.
    ///
    /// A dial failure against a pid whose process is gone is reported as a
    /// stale owner and folded into "no owner", per the documented rendezvous protocol.
    #[instrument(level = "debug", skip(self, cancel), fields(dir = %self.dir.display()))]
    pub fn connect(
        &self,
        cancel: &Cancellation,
    ) -> Result<(Option<UnixStream>, DirLock), CoordinatorError> {
        let lock = self.lock_directory(cancel)?;

        let pid = match self.read_owner_pid()? {
            Some(pid) => pid,
            None => return Ok((None, lock)),
        };

        // A pid-reuse chain can leave `owner.pid` naming this very process
        // (the value was never rewritten past some earlier hop, and the OS
        // has since handed that pid back to us): dialing it would mean
        // connecting to our own not-yet-listening socket and stalling for
        // the full transfer timeout. Treat it as stale rather than as a
        // live owner.
        if pid == self.os.pid() {
            warn!(pid, "owner pid names this process itself, treating owner.pid as stale");
            return Ok((None, lock));
        }

        // A liveness probe before dialing avoids racing the successor's own
        // pid against a predecessor that is mid-exit: kill(pid, 0) returning
        // ESRCH means nothing is there to serve the socket.
        if nix::sys::signal::kill(Pid::from_raw(pid), None).is_err() {
            warn!(pid, "owner pid is not running, treating owner.pid as stale");
            return Ok((None, lock));
        }

        let sock_path = self.socket_path(pid);
        match UnixStream::connect(&sock_path) {
            Ok(stream) => Ok((Some(stream), lock)),
            Err(source) => {
                warn!(
                    pid,
                    path = %sock_path.display(),
                    error = %CoordinatorError::StaleOwner { pid, path: sock_path.clone() },
                    "failed to dial owner socket, treating owner.pid as stale: {source}",
                );
                Ok((None, lock))
            }
        }
    }

    /// Write `my_pid` to `owner.pid` and release the directory lock. Must be
    /// called exactly once per session, by the successor taking over.
    #[instrument(level = "debug", skip(self, lock))]
    pub fn claim_ownership(&self, mut lock: DirLock, my_pid: i32) -> Result<(), CoordinatorError> {
        self.write_owner_pid(my_pid)?;
        lock.release();
        Ok(())
    }
}

pub(crate) fn deadline_from(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|d| Instant::now() + d)
}
