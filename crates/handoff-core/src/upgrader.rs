//! The orchestrator: owns the state machine, serves upgrade requests from
//! future siblings on the accept loop, and exposes the public lifecycle
//! (`ready`, `upgrade_complete`, `stop`).

use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::select;
use mio::net::UnixListener as MioUnixListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, instrument, warn};

use crate::cancellation::Cancellation;
use crate::coordinator::Coordinator;
use crate::error::{LockReason, UpgraderError};
use crate::os::{RealOs, SystemOs};
use crate::session::UpgradeSession;
use crate::store::Fds;
use crate::wire;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// A single enum value with the transitions validated by [`State::allows`].
/// Exactly one state is held at any time, serialized by `Inner::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    CheckingOwner,
    Owner,
    TransferringOwnership,
    Draining,
    Stopped,
}

impl State {
    fn allows(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (CheckingOwner, Owner)
                | (CheckingOwner, Stopped)
                | (Owner, TransferringOwnership)
                | (Owner, Stopped)
                | (TransferringOwnership, Owner)
                | (TransferringOwnership, Draining)
                | (TransferringOwnership, Stopped)
                | (Draining, Stopped)
        )
    }
}

#[derive(Clone)]
pub struct UpgraderOptions {
    /// How long the accept-loop handler waits for the ready byte before
    /// rolling back. Default 60s, per spec.
    pub upgrade_timeout: Duration,
}

impl Default for UpgraderOptions {
    fn default() -> Self {
        Self {
            upgrade_timeout: Duration::from_secs(60),
        }
    }
}

/// "Signal once" primitive for `UpgradeComplete`: a mutex-guarded sender
/// whose drop closes the channel for every cloned receiver, rather than an
/// ad-hoc select-default loop.
struct CompleteSignal {
    sender: Mutex<Option<crossbeam_channel::Sender<std::convert::Infallible>>>,
    receiver: crossbeam_channel::Receiver<std::convert::Infallible>,
}

impl CompleteSignal {
    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    fn signal(&self) {
        let mut guard = self.sender.lock().unwrap();
        *guard = None;
    }

    fn observer(&self) -> UpgradeComplete {
        UpgradeComplete {
            receiver: self.receiver.clone(),
        }
    }
}

/// Observation handle for upgrade completion. Signalled exactly once, by
/// either a successful handoff or `Upgrader::stop`; cloneable, and every
/// clone observes the same signal.
#[derive(Clone)]
pub struct UpgradeComplete {
    receiver: crossbeam_channel::Receiver<std::convert::Infallible>,
}

impl UpgradeComplete {
    /// Block until signalled. Returns immediately if already signalled.
    pub fn wait(&self) {
        let _ = self.receiver.recv();
    }

    pub fn is_signalled(&self) -> bool {
        matches!(
            self.receiver.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }
}

struct Inner {
    state: Mutex<State>,
    fds: Fds,
    os: Arc<dyn SystemOs>,
    coordinator: Arc<Coordinator>,
    options: UpgraderOptions,
    complete: CompleteSignal,
    stop_requested: AtomicBool,
    waker: Mutex<Option<Arc<Waker>>>,
    session: Mutex<Option<UpgradeSession>>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Inner {
    fn transition(&self, to: State) -> Result<(), UpgraderError> {
        let mut state = self.state.lock().unwrap();
        if !state.allows(to) {
            return Err(UpgraderError::IllegalTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }

    fn current_state(&self) -> State {
        *self.state.lock().unwrap()
    }
}

/// Owns the state machine and the accept loop. The accept-loop thread holds
/// an `Arc<Inner>`, and `Inner` holds the mio listener the accept loop polls
/// — `stop` breaks the cycle by waking the poller and setting
/// `stop_requested`, which drops the thread's reference when it returns.
pub struct Upgrader {
    inner: Arc<Inner>,
}

impl Upgrader {
    /// Construct against `dir`: bind the listen socket for future
    /// successors, spawn the accept loop, then perform the bootstrap
    /// rendezvous with any existing predecessor. `cancel` governs only this
    /// bootstrap step; it does not cancel later upgrades.
    pub fn new(
        dir: impl Into<std::path::PathBuf>,
        options: UpgraderOptions,
        cancel: &Cancellation,
    ) -> Result<Self, UpgraderError> {
        Self::with_os(dir, options, cancel, Arc::new(RealOs))
    }

    /// As [`Upgrader::new`], but with an injectable [`SystemOs`] — used by
    /// tests to run with a deterministic pid.
    pub fn with_os(
        dir: impl Into<std::path::PathBuf>,
        options: UpgraderOptions,
        cancel: &Cancellation,
        os: Arc<dyn SystemOs>,
    ) -> Result<Self, UpgraderError> {
        let coordinator = Arc::new(Coordinator::new(dir, Arc::clone(&os))?);
        let my_pid = os.pid();

        let std_listener = coordinator.listen(cancel)?;
        std_listener.set_nonblocking(true).map_err(|source| {
            crate::error::CoordinatorError::Bind {
                path: coordinator.socket_path(my_pid),
                source,
            }
        })?;
        let mut mio_listener =
            unsafe { MioUnixListener::from_raw_fd(std_listener.into_raw_fd()) };

        let (conn, lock) = coordinator.connect(cancel)?;
        let mut session = UpgradeSession::new(
            Arc::clone(&os),
            conn,
            lock,
            Arc::clone(&coordinator),
            my_pid,
        );
        let inherited = session.get_files()?;
        let fds = Fds::from_entries(Arc::clone(&os), inherited);

        let poll = Poll::new().map_err(UpgraderError::Poller)?;
        poll.registry()
            .register(&mut mio_listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(UpgraderError::Poller)?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN).map_err(UpgraderError::Poller)?,
        );

        let inner = Arc::new(Inner {
            state: Mutex::new(State::CheckingOwner),
            fds,
            os,
            coordinator,
            options,
            complete: CompleteSignal::new(),
            stop_requested: AtomicBool::new(false),
            waker: Mutex::new(Some(Arc::clone(&waker))),
            session: Mutex::new(Some(session)),
            accept_thread: Mutex::new(None),
        });

        let accept_inner = Arc::clone(&inner);
        let handle = thread::spawn(move || accept_loop(accept_inner, poll, mio_listener));
        *inner.accept_thread.lock().unwrap() = Some(handle);

        Ok(Self { inner })
    }

    pub fn fds(&self) -> &Fds {
        &self.inner.fds
    }

    pub fn state(&self) -> State {
        self.inner.current_state()
    }

    /// If a predecessor was observed, signal it with the ready byte. Either
    /// way, register this process in `owner.pid` and transition to `Owner`.
    /// Every process that reaches `Owner` re-claims ownership here, not
    /// only the bootstrap one — otherwise `owner.pid` would stay pinned to
    /// the very first process in a chain, which a later successor could
    /// misread as itself once that pid is reused. Failures leave the state
    /// unchanged.
    #[instrument(level = "info", skip(self))]
    pub fn ready(&self) -> Result<(), UpgraderError> {
        let mut session_guard = self.inner.session.lock().unwrap();
        let session = session_guard
            .as_mut()
            .expect("ready() called more than once");

        if session.has_owner() {
            session.send_ready()?;
        }
        session.claim_ownership()?;

        self.inner.transition(State::Owner)?;
        *session_guard = None;
        info!("upgrader is now the owner");
        Ok(())
    }

    pub fn upgrade_complete(&self) -> UpgradeComplete {
        self.inner.complete.observer()
    }

    /// Transition to `Stopped`, wake the accept loop so it exits, signal
    /// `UpgradeComplete` if not already signalled, and close every fd still
    /// in the store. Idempotent.
    #[instrument(level = "info", skip(self))]
    pub fn stop(&self) {
        let already_stopped = matches!(self.inner.current_state(), State::Stopped);
        if let Err(err) = self.inner.transition(State::Stopped) {
            if !already_stopped {
                warn!(%err, "stop: illegal transition, stopping anyway");
            }
        }

        self.inner.stop_requested.store(true, Ordering::SeqCst);
        if let Some(waker) = self.inner.waker.lock().unwrap().take() {
            let _ = waker.wake();
        }
        if let Some(handle) = self.inner.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.complete.signal();
        self.inner.fds.close_all();
    }
}

impl Drop for Upgrader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(inner: Arc<Inner>, mut poll: Poll, mut listener: MioUnixListener) {
    let mut events = Events::with_capacity(16);
    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "accept loop poll failed, exiting");
            return;
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {
                    if inner.stop_requested.load(Ordering::SeqCst) {
                        debug!("accept loop woken for stop, exiting");
                        return;
                    }
                }
                LISTENER_TOKEN => loop {
                    match listener.accept() {
                        Ok((mio_stream, _addr)) => {
                            let std_stream = unsafe {
                                StdUnixStream::from_raw_fd(mio_stream.into_raw_fd())
                            };
                            let _ = std_stream.set_nonblocking(false);
                            let handler_inner = Arc::clone(&inner);
                            thread::spawn(move || {
                                handle_upgrade_request(handler_inner, std_stream)
                            });
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            error!(%err, "accept failed");
                            break;
                        }
                    }
                },
                _ => {}
            }
        }
    }
}

fn rollback(inner: &Arc<Inner>, reason: &str) {
    inner.fds.unlock_mutations();
    if let Err(err) = inner.transition(State::Owner) {
        error!(%err, reason, "rollback transition failed, process is terminating regardless");
    } else {
        warn!(reason, "upgrade rolled back");
    }
}

fn commit(inner: &Arc<Inner>) {
    inner.fds.lock_mutations(LockReason::UpgradeCompleted);
    if let Err(err) = inner.transition(State::Draining) {
        error!(%err, "commit transition failed");
        return;
    }
    inner.complete.signal();
    info!("upgrade committed, handed off to successor");
}

/// One incoming connection's handler: attempt the `TransferringOwnership`
/// transition, stream the fd snapshot, then race a ready-timeout against
/// the ready byte.
#[instrument(level = "debug", skip(inner, stream))]
fn handle_upgrade_request(inner: Arc<Inner>, mut stream: StdUnixStream) {
    if let Err(err) = inner.transition(State::TransferringOwnership) {
        debug!(%err, "rejecting concurrent upgrade request");
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    inner.fds.lock_mutations(LockReason::UpgradeInProgress);

    let transfer = (|| -> Result<(), crate::error::SessionError> {
        wire::recv_request(&mut stream).map_err(crate::error::SessionError::ReadRequest)?;
        let snapshot = inner.fds.copy().map_err(crate::error::SessionError::Store)?;
        wire::send_count(&mut stream, snapshot.len() as u64)
            .map_err(crate::error::SessionError::SendCount)?;
        for (name, fd) in &snapshot {
            wire::send_named_fd(inner.os.as_ref(), &mut stream, name, fd.as_raw_fd())?;
        }
        Ok(())
    })();

    if let Err(err) = transfer {
        warn!(%err, "transfer error, rolling back");
        rollback(&inner, "transfer_error");
        return;
    }

    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let mut reader = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to clone session socket for ready read");
            rollback(&inner, "transfer_error");
            return;
        }
    };
    thread::spawn(move || {
        let result = wire::recv_ready(&mut reader);
        let _ = ready_tx.send(result.is_ok());
    });

    let timeout = crossbeam_channel::after(inner.options.upgrade_timeout);
    select! {
        recv(ready_rx) -> got_ready => {
            match got_ready {
                Ok(true) => commit(&inner),
                _ => rollback(&inner, "ready_read_error"),
            }
        }
        recv(timeout) -> _ => rollback(&inner, "ready_timeout"),
    }
}
