//! Filesystem helpers shared by the monitor and executor: directory
//! creation and an atomic-when-possible file move.
//!
//! Ported from the Python agent's `utils/file_utils.py`: try a rename
//! first (fast path, same filesystem), and fall back to a copy-then-rename
//! through a temp file when the rename fails (cross-filesystem move).

use std::io;
use std::path::Path;

pub fn ensure_directories<'a>(paths: impl IntoIterator<Item = &'a str>) -> io::Result<()> {
    for path in paths {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Moves `src` to `dst`, creating `dst`'s parent directory if needed and
/// preserving `src`'s permissions across a cross-filesystem fallback.
pub fn safe_move(src: &Path, dst: &Path) -> io::Result<()> {
    if !src.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source file not found: {}", src.display()),
        ));
    }

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    // Cross-filesystem: copy into a temp file beside the destination, then
    // rename (atomic within that filesystem), then remove the original.
    let src_permissions = std::fs::metadata(src)?.permissions();
    let tmp_dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = tmp_dir.join(format!(
        ".{}.tmp-{}",
        dst.file_name().and_then(|n| n.to_str()).unwrap_or("move"),
        std::process::id()
    ));

    let result = (|| -> io::Result<()> {
        std::fs::copy(src, &tmp_path)?;
        std::fs::set_permissions(&tmp_path, src_permissions)?;
        std::fs::rename(&tmp_path, dst)?;
        std::fs::remove_file(src)?;
        Ok(())
    })();

    if result.is_err() && tmp_path.exists() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_file_within_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.yaml");
        let dst = dir.path().join("sub").join("a.yaml");
        std::fs::write(&src, "content").unwrap();

        safe_move(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "content");
    }

    #[test]
    fn errors_on_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing.yaml");
        let dst = dir.path().join("dst.yaml");
        assert!(safe_move(&src, &dst).is_err());
    }
}
