//! Toy echo server that demonstrates `handoff-core`: `serve` binds a TCP
//! listener under a coordination directory and keeps running across
//! upgrades, handing its listener (and its in-flight connections' address
//! space, since they're just threads) to whichever sibling process starts
//! up next against the same directory.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use handoff_core::store::Network;
use handoff_core::{Cancellation, Upgrader, UpgraderOptions};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "handoff-demo", about = "Toy server demonstrating zero-downtime handoff")]
struct Cli {
    /// Coordination directory shared by every generation of this server.
    #[arg(long, global = true, default_value = "/tmp/handoff-demo")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start (or take over) serving the echo listener at `--addr`.
    Serve {
        #[arg(long, default_value = "127.0.0.1:9292")]
        addr: String,
    },
    /// Print the current owner pid, if any, and exit. Lets an operator
    /// script an upgrade without exec'ing a successor until an owner is
    /// actually registered.
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { addr } => serve(cli.dir, addr),
        Command::Status => status(cli.dir),
    }
}

fn serve(dir: PathBuf, addr: String) -> Result<()> {
    let upgrader = Upgrader::new(dir, UpgraderOptions::default(), &Cancellation::never())
        .context("failed to bootstrap upgrader")?;

    upgrader
        .fds()
        .listen("web", Network::Tcp, &addr)
        .context("failed to bind web listener")?;
    upgrader.ready().context("failed to become owner")?;
    info!(pid = std::process::id(), %addr, "serving");

    let web_fd = upgrader
        .fds()
        .file("web")
        .context("web listener missing from store")?;
    let dup_raw = nix::unistd::dup(web_fd.as_raw_fd()).context("dup web listener")?;
    let listener = unsafe { TcpListener::from_raw_fd(dup_raw) };

    let complete = upgrader.upgrade_complete();
    let watcher = std::thread::spawn(move || {
        complete.wait();
        warn!("handoff committed, this generation will drain and exit shortly");
        std::thread::sleep(Duration::from_secs(2));
        std::process::exit(0);
    });

    for stream in listener.incoming() {
        let mut stream = stream.context("accept failed")?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 || stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        });
    }

    watcher.join().ok();
    Ok(())
}

fn status(dir: PathBuf) -> Result<()> {
    let owner = dir.join("owner.pid");
    if owner.exists() {
        println!("{}", std::fs::read_to_string(owner)?.trim());
    } else {
        println!("no owner");
    }
    Ok(())
}
