//! Small filesystem helpers shared by the downloader, index emitter, and
//! update pipeline: atomic staging renames, a safe-path check that refuses
//! traversal attempts, streaming SHA-256, and a hard-link-with-copy-fallback
//! used to preserve wheels across an update.
//!
//! Grounded on the teacher's own preference for `fs_err` over `std::fs` (so
//! I/O errors carry the offending path) and on its "fast path, fall back to
//! a plain copy" shape for cache population.

use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum PathSafetyError {
    #[error("refusing unsafe path component in \"{0}\"")]
    UnsafeComponent(String),
    #[error("path \"{candidate}\" escapes root \"{root}\"")]
    Escapes { root: String, candidate: String },
}

/// Returns `false` if `name` contains a path separator or a `..` segment.
/// Used to validate wheel filenames and canonical project names before they
/// are ever turned into a path.
pub fn is_safe_component(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Join `name` onto `root` and verify that the result is still a descendant
/// of `root`, refusing path-traversal attempts from maliciously crafted
/// names before any directory is created or file is written.
pub fn safe_join(root: &Path, name: &str) -> Result<PathBuf, PathSafetyError> {
    if !is_safe_component(name) {
        return Err(PathSafetyError::UnsafeComponent(name.to_string()));
    }
    let candidate = root.join(name);
    // Lexical check: we can't canonicalize a path that may not exist yet
    // (the file/directory is often about to be created), so walk the joined
    // path's components instead of touching the filesystem.
    let mut depth: i32 = 0;
    for component in candidate.strip_prefix(root).unwrap_or(&candidate).components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathSafetyError::Escapes {
                    root: root.display().to_string(),
                    candidate: candidate.display().to_string(),
                });
            }
        }
        if depth < 0 {
            return Err(PathSafetyError::Escapes {
                root: root.display().to_string(),
                candidate: candidate.display().to_string(),
            });
        }
    }
    Ok(candidate)
}

/// Stream-hash a file already on disk (used by the index emitter when a
/// wheel has no registry-reported digest).
pub fn sha256_hex_file(path: &Path) -> io::Result<String> {
    let mut file = fs_err::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Rename `tmp` onto `dest`, creating `dest`'s parent directory if needed.
/// Both paths must be on the same filesystem for this to be atomic; callers
/// are expected to create `tmp` as a sibling of `dest`.
pub async fn persist_atomically(tmp: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs_err::tokio::create_dir_all(parent).await?;
    }
    fs_err::tokio::rename(tmp, dest).await?;
    Ok(())
}

/// Hard-link `src` to `dst`, falling back to a full copy if hard-linking
/// fails (e.g. `src` and `dst` are on different filesystems, or the
/// platform doesn't support it for this file type).
pub fn hardlink_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs_err::create_dir_all(parent)?;
    }
    match fs_err::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(err) => {
            trace!("hard link failed ({err}), falling back to copy: {src:?} -> {dst:?}");
            fs_err::copy(src, dst).map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_segment() {
        assert!(!is_safe_component("../../etc/passwd"));
    }

    #[test]
    fn rejects_separator() {
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component("a\\b"));
    }

    #[test]
    fn accepts_plain_name() {
        assert!(is_safe_component("click-8.1.7-py3-none-any.whl"));
    }

    #[test]
    fn safe_join_refuses_traversal() {
        let root = Path::new("/mirror/files");
        assert!(safe_join(root, "../../etc/passwd.whl").is_err());
        assert!(safe_join(root, "..").is_err());
    }

    #[test]
    fn safe_join_accepts_plain_name() {
        let root = Path::new("/mirror/files");
        let joined = safe_join(root, "click-8.1.7-py3-none-any.whl").unwrap();
        assert_eq!(joined, root.join("click-8.1.7-py3-none-any.whl"));
    }

    #[test]
    fn hash_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let digest = sha256_hex_file(&path).unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde"
        );
    }

    #[test]
    fn hardlink_or_copy_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.whl");
        let dst = dir.path().join("nested").join("dst.whl");
        std::fs::write(&src, b"wheel bytes").unwrap();
        hardlink_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"wheel bytes");
    }
}
