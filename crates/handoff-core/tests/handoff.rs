//! End-to-end handoff scenarios. `basic_handoff_transfers_listener_to_successor`
//! runs the predecessor and successor as real sibling processes via `fork`,
//! the way the protocol is actually used; the rest run as threads within one
//! process, which is enough to exercise the wire protocol and state machine
//! without the synchronization overhead of a second process.

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use handoff_core::error::{LockReason, StoreError};
use handoff_core::os::FakeOs;
use handoff_core::store::Network;
use handoff_core::upgrader::State;
use handoff_core::{Cancellation, Upgrader, UpgraderOptions};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use serial_test::serial;
use tempfile::tempdir;

fn assert_child_exited_ok(child: nix::unistd::Pid) {
    match waitpid(child, None).unwrap() {
        WaitStatus::Exited(_, 0) => {}
        other => panic!("child exited abnormally: {other:?}"),
    }
}

/// The basic handoff scenario: a predecessor binds a listener, a
/// successor starts up alongside it, inherits the listener, and the
/// predecessor observes the handoff complete. Two real processes,
/// synchronized over a pipe so the successor never starts before `owner.pid`
/// names the predecessor.
#[test]
#[serial]
fn basic_handoff_transfers_listener_to_successor() {
    let dir = tempdir().unwrap();
    let (read_fd, write_fd) = nix::unistd::pipe().unwrap();

    match unsafe { fork() }.unwrap() {
        ForkResult::Parent { child } => {
            drop(read_fd);

            let upgrader = Upgrader::new(dir.path(), UpgraderOptions::default(), &Cancellation::never())
                .expect("predecessor construction");
            upgrader
                .fds()
                .listen("web", Network::Tcp, "127.0.0.1:0")
                .expect("bind web listener");
            upgrader.ready().expect("predecessor becomes owner");
            nix::unistd::write(&write_fd, b"x").expect("signal successor");

            upgrader.upgrade_complete().wait();
            assert_eq!(upgrader.state(), State::Draining);
            assert_child_exited_ok(child);
        }
        ForkResult::Child => {
            drop(write_fd);
            let result = (|| -> Result<(), String> {
                let mut buf = [0u8; 1];
                nix::unistd::read(read_fd.as_raw_fd(), &mut buf).map_err(|e| e.to_string())?;

                let upgrader =
                    Upgrader::new(dir.path(), UpgraderOptions::default(), &Cancellation::never())
                        .map_err(|e| e.to_string())?;
                if upgrader.fds().file("web").is_none() {
                    return Err("successor did not inherit the web listener".to_string());
                }
                upgrader.ready().map_err(|e| e.to_string())?;
                if upgrader.state() != State::Owner {
                    return Err("successor did not reach Owner".to_string());
                }
                Ok(())
            })();
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
    }
}

/// A three-hop chain, P1 -> P2 -> P3, where P3 reuses P1's pid, the way the
/// OS eventually recycles a freed one. P1 and P2 are real sibling processes
/// dialing each other by their genuine pids (the liveness probe needs a
/// pid that is actually alive to validate); P3 is a third real process that
/// deliberately reports P1's already-exited pid as its own to force the
/// reuse deterministically, rather than hoping the kernel hands it back in
/// time for the test. The chain only completes if `owner.pid` was rewritten
/// to name P2 when P2 took over — if it had stayed pinned to P1, P3 would
/// read `owner.pid == P3`'s own (reused) pid and dial itself instead of the
/// still-running P2, stalling for the transfer timeout.
#[test]
#[serial]
fn three_process_chain_reuses_first_pid() {
    let dir = tempdir().unwrap();
    let (p1_ready_r, p1_ready_w) = nix::unistd::pipe().unwrap();
    let (p2_ready_r, p2_ready_w) = nix::unistd::pipe().unwrap();

    match unsafe { fork() }.unwrap() {
        ForkResult::Parent { child: p1 } => {
            drop(p1_ready_w);
            let mut buf = [0u8; 1];
            nix::unistd::read(p1_ready_r.as_raw_fd(), &mut buf).expect("p1 ready signal");
            let p1_pid = p1.as_raw();

            match unsafe { fork() }.unwrap() {
                ForkResult::Parent { child: p2 } => {
                    drop(p2_ready_w);
                    nix::unistd::read(p2_ready_r.as_raw_fd(), &mut buf).expect("p2 ready signal");
                    assert_child_exited_ok(p1);

                    match unsafe { fork() }.unwrap() {
                        ForkResult::Parent { child: p3 } => {
                            assert_child_exited_ok(p2);
                            assert_child_exited_ok(p3);
                        }
                        ForkResult::Child => {
                            let result = (|| -> Result<(), String> {
                                let upgrader = Upgrader::with_os(
                                    dir.path(),
                                    UpgraderOptions::default(),
                                    &Cancellation::never(),
                                    Arc::new(FakeOs::with_pid(p1_pid)),
                                )
                                .map_err(|e| e.to_string())?;
                                if upgrader.fds().file("web").is_none() {
                                    return Err("p3 did not inherit the web listener".to_string());
                                }
                                upgrader.ready().map_err(|e| e.to_string())?;
                                if upgrader.state() != State::Owner {
                                    return Err("p3 did not reach Owner".to_string());
                                }
                                Ok(())
                            })();
                            std::process::exit(if result.is_ok() { 0 } else { 1 });
                        }
                    }
                }
                ForkResult::Child => {
                    drop(p2_ready_r);
                    let result = (|| -> Result<(), String> {
                        let upgrader = Upgrader::new(
                            dir.path(),
                            UpgraderOptions::default(),
                            &Cancellation::never(),
                        )
                        .map_err(|e| e.to_string())?;
                        if upgrader.fds().file("web").is_none() {
                            return Err("p2 did not inherit the web listener".to_string());
                        }
                        upgrader.ready().map_err(|e| e.to_string())?;
                        if upgrader.state() != State::Owner {
                            return Err("p2 did not reach Owner".to_string());
                        }
                        nix::unistd::write(&p2_ready_w, b"x").map_err(|e| e.to_string())?;
                        upgrader.upgrade_complete().wait();
                        Ok(())
                    })();
                    std::process::exit(if result.is_ok() { 0 } else { 1 });
                }
            }
        }
        ForkResult::Child => {
            drop(p1_ready_r);
            drop(p2_ready_r);
            drop(p2_ready_w);
            let result = (|| -> Result<(), String> {
                let upgrader =
                    Upgrader::new(dir.path(), UpgraderOptions::default(), &Cancellation::never())
                        .map_err(|e| e.to_string())?;
                upgrader
                    .fds()
                    .listen("web", Network::Tcp, "127.0.0.1:0")
                    .map_err(|e| e.to_string())?;
                upgrader.ready().map_err(|e| e.to_string())?;
                nix::unistd::write(&p1_ready_w, b"x").map_err(|e| e.to_string())?;
                upgrader.upgrade_complete().wait();
                Ok(())
            })();
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
    }
}

/// Drives the same handoff with two in-process `Upgrader`s under `FakeOs`,
/// and checks the state each side lands in once the commit signal fires:
/// the predecessor's store is locked with the completed reason and it is
/// Draining, the successor owns the transferred descriptor and is Owner.
#[test]
fn descriptor_handoff_commits_and_locks_predecessor_store() {
    let dir = tempdir().unwrap();

    let predecessor = Upgrader::with_os(
        dir.path(),
        UpgraderOptions {
            upgrade_timeout: Duration::from_secs(5),
        },
        &Cancellation::never(),
        Arc::new(FakeOs::with_pid(101)),
    )
    .unwrap();
    predecessor
        .fds()
        .listen("web", Network::Tcp, "127.0.0.1:0")
        .unwrap();
    predecessor.ready().unwrap();

    let dir_path = dir.path().to_path_buf();
    let successor_handle = std::thread::spawn(move || {
        let successor = Upgrader::with_os(
            dir_path,
            UpgraderOptions::default(),
            &Cancellation::never(),
            Arc::new(FakeOs::with_pid(202)),
        )
        .unwrap();
        let inherited = successor.fds().file("web").is_some();
        successor.ready().unwrap();
        (successor, inherited)
    });

    predecessor.upgrade_complete().wait();
    assert_eq!(predecessor.state(), State::Draining);
    assert!(predecessor.fds().is_locked());

    let (successor, inherited) = successor_handle.join().unwrap();
    assert!(inherited, "successor must inherit the predecessor's web listener");
    assert_eq!(successor.state(), State::Owner);

    predecessor.stop();
    successor.stop();
}

/// Scenario 4: application-level mutation traffic racing an in-flight
/// handoff. A thread hammers `open_with`/`remove` on a small cycling set of
/// names against the predecessor's store while a successor connects, takes
/// over, and commits. Every call must return `Ok` or a `MutationsLocked`
/// error carrying one of the two in-flight reasons — never anything else,
/// and never a silent drop.
#[test]
fn concurrent_mutation_races_handoff_without_silent_drops() {
    let dir = tempdir().unwrap();

    let predecessor = Upgrader::with_os(
        dir.path(),
        UpgraderOptions::default(),
        &Cancellation::never(),
        Arc::new(FakeOs::with_pid(301)),
    )
    .unwrap();
    predecessor
        .fds()
        .listen("web", Network::Tcp, "127.0.0.1:0")
        .unwrap();
    predecessor.ready().unwrap();

    std::thread::scope(|scope| {
        let fds = predecessor.fds();
        let mutator = scope.spawn(move || {
            for i in 0..2000 {
                let name = format!("mutation-{}", i % 5);

                match fds.open_with(&name, (), |_| nix::unistd::pipe().map(|(r, _w)| r)) {
                    Ok(_) => {}
                    Err(StoreError::MutationsLocked { reason }) => assert!(
                        matches!(
                            reason,
                            LockReason::UpgradeInProgress | LockReason::UpgradeCompleted
                        ),
                        "unexpected lock reason: {reason}"
                    ),
                    Err(other) => panic!("unexpected store error from open_with: {other}"),
                }

                match fds.remove(&name) {
                    Ok(()) => {}
                    Err(StoreError::MutationsLocked { reason }) => assert!(
                        matches!(
                            reason,
                            LockReason::UpgradeInProgress | LockReason::UpgradeCompleted
                        ),
                        "unexpected lock reason: {reason}"
                    ),
                    Err(other) => panic!("unexpected store error from remove: {other}"),
                }
            }
        });

        let dir_path = dir.path().to_path_buf();
        let successor = Upgrader::with_os(
            dir_path,
            UpgraderOptions::default(),
            &Cancellation::never(),
            Arc::new(FakeOs::with_pid(302)),
        )
        .unwrap();
        successor.ready().unwrap();

        mutator.join().unwrap();
        predecessor.upgrade_complete().wait();
        assert_eq!(predecessor.state(), State::Draining);

        successor.stop();
    });

    predecessor.stop();
}
