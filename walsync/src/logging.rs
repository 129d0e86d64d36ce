//! Logging initialization.
//!
//! CLI commands log to stderr. Daemons additionally need their output on
//! disk so `walsync <mode> logs` has something to read; rotation of that
//! file is deliberately left to the platform.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use camino::Utf8Path;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Plain stderr logging for one-shot commands.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .init();
}

/// Append-mode file logging for daemons. The file is created eagerly so a
/// daemon that dies before its first event still leaves a trace target for
/// `logs`.
pub fn init_daemon(log_path: &Utf8Path) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("could not create {parent:?}"))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("could not open log file {log_path:?}"))?;
    let writer = SharedFileWriter(Arc::new(Mutex::new(file)));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .init();
    Ok(())
}

/// `MakeWriter` needs a fresh `Write` per event; share one appended file
/// behind a mutex.
#[derive(Clone)]
struct SharedFileWriter(Arc<Mutex<File>>);

impl Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut file) => file.write(buf),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "log writer poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "log writer poisoned")),
        }
    }
}

/// Print the last `n` lines of a daemon's log file to stdout.
pub fn print_tail(log_path: &Utf8Path, n: usize) -> anyhow::Result<()> {
    let contents = match std::fs::read_to_string(log_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("(no log file at {log_path})");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("could not read {log_path:?}")),
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    for line in &lines[start..] {
        println!("{line}");
    }
    Ok(())
}
