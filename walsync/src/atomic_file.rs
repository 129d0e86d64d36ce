//! Write-to-temp-then-rename file replacement.
//!
//! Everything durable in this system (manifests, the LATEST pointer,
//! receipts, `current_restore_point.txt`) is replaced through this path, so
//! a reader either sees the previous complete version or the new complete
//! version, never a partial write.

use anyhow::Context;
use camino::Utf8Path;

const TMP_SUFFIX: &str = "tmp";

/// Atomically replace `path` with `contents`.
///
/// The temp file lives next to the target so the rename stays within one
/// filesystem. The file is fsynced before the rename; the rename itself is
/// what publishes it.
pub async fn write_atomic(path: &Utf8Path, contents: &[u8]) -> anyhow::Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("no file name in {path:?}"))?;
    let tmp_path = path.with_file_name(format!("{file_name}.{TMP_SUFFIX}"));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("could not create {tmp_path:?}"))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents)
        .await
        .with_context(|| format!("could not write {tmp_path:?}"))?;
    file.sync_all()
        .await
        .with_context(|| format!("could not sync {tmp_path:?}"))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("could not rename {tmp_path:?} to {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.txt");

        write_atomic(&path, b"one").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one");

        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");

        // No temp file left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["state.txt"]);
    }
}
