//! Daemon pid files: exclusive claim for `run`, identity-checked signalling
//! for `stop`, and liveness reporting for `pid-status`.
//!
//! The file holds the pid as ASCII and is locked (flock) for as long as the
//! daemon lives, so a crashed daemon leaves a stale but unlocked file behind.
//! Stale files are tolerated: before any signal is sent, the pid is verified
//! to belong to a `walsync` process.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use camino::Utf8Path;
use fs2::FileExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::info;

/// Substring of `/proc/<pid>/cmdline` that identifies our own processes.
const PROCESS_IDENTITY: &str = "walsync";

const STOP_WAIT: Duration = Duration::from_secs(30);

/// Holds the pid-file lock for the lifetime of the daemon. Dropping the
/// guard releases the lock; the file itself stays behind as a stale marker.
pub struct PidFileGuard {
    _file: File,
}

/// Claim `path` for the current process, failing if another live daemon
/// holds it.
pub fn claim(path: &Utf8Path) -> anyhow::Result<PidFileGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("could not create {parent:?}"))?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("could not open pid file {path:?}"))?;
    if file.try_lock_exclusive().is_err() {
        let holder = read_pid(&mut file).ok();
        bail!(
            "another daemon already holds {path:?}{}",
            holder.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
        );
    }
    file.set_len(0)?;
    file.rewind()?;
    write!(file, "{}", std::process::id())?;
    file.sync_all()?;
    info!("claimed pid file {path}");
    Ok(PidFileGuard { _file: file })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidStatus {
    /// No pid file, or the recorded process is gone or is not ours.
    NotRunning,
    Running(u32),
}

/// Report whether the daemon recorded in `path` is alive.
pub fn status(path: &Utf8Path) -> anyhow::Result<PidStatus> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PidStatus::NotRunning),
        Err(e) => return Err(e).with_context(|| format!("could not open pid file {path:?}")),
    };
    let pid = match read_pid(&mut file) {
        Ok(pid) => pid,
        // Unparseable contents are treated like a stale file.
        Err(_) => return Ok(PidStatus::NotRunning),
    };
    if process_is_ours(pid) {
        Ok(PidStatus::Running(pid))
    } else {
        Ok(PidStatus::NotRunning)
    }
}

/// Send SIGTERM to the daemon recorded in `path` and wait for it to exit.
/// Returns false if nothing was running.
pub fn stop(path: &Utf8Path) -> anyhow::Result<bool> {
    let pid = match status(path)? {
        PidStatus::NotRunning => return Ok(false),
        PidStatus::Running(pid) => pid,
    };
    info!("sending SIGTERM to pid {pid}");
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .with_context(|| format!("could not signal pid {pid}"))?;

    let deadline = Instant::now() + STOP_WAIT;
    while Instant::now() < deadline {
        if !process_is_ours(pid) {
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    bail!("pid {pid} did not exit within {STOP_WAIT:?}");
}

fn read_pid(file: &mut File) -> anyhow::Result<u32> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("pid file contains {contents:?}"))
}

/// True when `pid` exists and its command line identifies a walsync process.
/// This is the guard against recycled pids.
fn process_is_ours(pid: u32) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => String::from_utf8_lossy(&cmdline).contains(PROCESS_IDENTITY),
        Err(_) => false,
    }
}
