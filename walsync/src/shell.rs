//! Subprocess plumbing: template rendering for the pluggable verifier and
//! manifest commands, and a per-instance shell that runs the same operations
//! either directly or through `ssh`, depending on `is_local`.

use std::process::Output;

use anyhow::{bail, Context};
use camino::Utf8Path;
use tokio::process::Command;

use walsync_api::InstanceDescriptor;

/// Quote `s` for a POSIX shell: single-quote wrapping with embedded single
/// quotes spliced out.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// Substitute `{name}` placeholders in a command template.
///
/// Substitution is literal text replacement; every value is shell-quoted
/// because the rendered string crosses a `sh -c` boundary.
pub fn render_template(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut rendered = template.to_owned();
    for (name, value) in substitutions {
        rendered = rendered.replace(&format!("{{{name}}}"), &shell_quote(value));
    }
    rendered
}

/// Run a rendered template through `sh -c`, capturing output.
pub async fn run_rendered(command: &str) -> anyhow::Result<Output> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("could not spawn shell command {command:?}"))
}

/// Collapse an [`Output`] into stdout, failing on a non-zero exit.
pub fn require_success(command_desc: &str, output: &Output) -> anyhow::Result<String> {
    if !output.status.success() {
        bail!(
            "{command_desc} failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Executes filesystem and process operations on one instance's host.
///
/// Local instances get direct execution; remote ones get the same command
/// line wrapped in non-interactive `ssh`. Callers never branch on locality
/// themselves.
#[derive(Clone, Debug)]
pub struct InstanceShell {
    host: String,
    is_local: bool,
}

impl InstanceShell {
    pub fn for_instance(descriptor: &InstanceDescriptor) -> InstanceShell {
        InstanceShell {
            host: descriptor.host.clone(),
            is_local: descriptor.is_local,
        }
    }

    /// Run `argv` on the instance's host, capturing output. The first element
    /// is the program; no shell is involved locally, and remote arguments are
    /// quoted before the ssh hop.
    pub async fn output(&self, argv: &[&str]) -> anyhow::Result<Output> {
        let (program, args) = argv.split_first().context("empty command")?;
        let mut command = if self.is_local {
            let mut command = Command::new(program);
            command.args(args);
            command
        } else {
            let remote_line = argv
                .iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" ");
            let mut command = Command::new("ssh");
            command.args(["-o", "BatchMode=yes", self.host.as_str(), remote_line.as_str()]);
            command
        };
        command
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("could not run {argv:?} on {}", self.host))
    }

    /// Run a shell snippet on the instance's host.
    async fn sh(&self, snippet: &str) -> anyhow::Result<Output> {
        if self.is_local {
            run_rendered(snippet).await
        } else {
            Command::new("ssh")
                .args(["-o", "BatchMode=yes", self.host.as_str(), snippet])
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("could not run {snippet:?} on {}", self.host))
        }
    }

    pub async fn read_file(&self, path: &Utf8Path) -> anyhow::Result<String> {
        if self.is_local {
            return tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("could not read {path:?}"));
        }
        let output = self.sh(&format!("cat {}", shell_quote(path.as_str()))).await?;
        require_success(&format!("reading {path:?} on {}", self.host), &output)
    }

    /// Replace `path` with `contents` via a sibling temp file and rename, on
    /// either side of the ssh boundary.
    pub async fn write_file_atomic(&self, path: &Utf8Path, contents: &str) -> anyhow::Result<()> {
        if self.is_local {
            return crate::atomic_file::write_atomic(path, contents.as_bytes()).await;
        }
        let quoted = shell_quote(path.as_str());
        let snippet = format!("cat > {quoted}.tmp && mv {quoted}.tmp {quoted}");
        let mut command = Command::new("ssh");
        command
            .args(["-o", "BatchMode=yes", &self.host, &snippet])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("could not spawn ssh to {}", self.host))?;
        let mut stdin = child.stdin.take().context("ssh stdin unavailable")?;
        tokio::io::AsyncWriteExt::write_all(&mut stdin, contents.as_bytes()).await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        require_success(&format!("writing {path:?} on {}", self.host), &output)?;
        Ok(())
    }

    /// Create an empty marker file (used for `standby.signal`). Idempotent.
    pub async fn create_marker(&self, path: &Utf8Path) -> anyhow::Result<()> {
        if self.is_local {
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(path)
                .await
                .with_context(|| format!("could not create {path:?}"))?;
            return Ok(());
        }
        let output = self.sh(&format!("touch {}", shell_quote(path.as_str()))).await?;
        require_success(&format!("creating {path:?} on {}", self.host), &output)?;
        Ok(())
    }

    pub async fn file_exists(&self, path: &Utf8Path) -> anyhow::Result<bool> {
        if self.is_local {
            return tokio::fs::try_exists(path)
                .await
                .with_context(|| format!("could not stat {path:?}"));
        }
        let output = self.sh(&format!("test -e {}", shell_quote(path.as_str()))).await?;
        Ok(output.status.success())
    }

    /// The most recently modified regular file in `dir`, if any.
    pub async fn newest_file(&self, dir: &Utf8Path) -> anyhow::Result<Option<camino::Utf8PathBuf>> {
        if self.is_local {
            let mut newest: Option<(std::time::SystemTime, camino::Utf8PathBuf)> = None;
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e).with_context(|| format!("could not list {dir:?}")),
            };
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if !metadata.is_file() {
                    continue;
                }
                let modified = metadata.modified()?;
                let path = camino::Utf8PathBuf::from_path_buf(entry.path())
                    .map_err(|p| anyhow::anyhow!("non-UTF8 path {p:?}"))?;
                if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                    newest = Some((modified, path));
                }
            }
            return Ok(newest.map(|(_, path)| path));
        }
        let output = self
            .sh(&format!("ls -1t {} 2>/dev/null | head -n 1", shell_quote(dir.as_str())))
            .await?;
        let name = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if !output.status.success() || name.is_empty() {
            return Ok(None);
        }
        Ok(Some(dir.join(name)))
    }

    /// Read the last `window` bytes of `path`.
    pub async fn read_tail(&self, path: &Utf8Path, window: u64) -> anyhow::Result<String> {
        if self.is_local {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            let mut file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("could not open {path:?}"))?;
            let len = file.metadata().await?.len();
            file.seek(std::io::SeekFrom::Start(len.saturating_sub(window)))
                .await?;
            let mut buf = Vec::with_capacity(window.min(len) as usize);
            file.read_to_end(&mut buf).await?;
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        let output = self
            .sh(&format!(
                "tail -c {window} {}",
                shell_quote(path.as_str())
            ))
            .await?;
        require_success(&format!("tailing {path:?} on {}", self.host), &output)
    }
}
