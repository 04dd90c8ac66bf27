//! The incremental update pipeline: stage a fresh resolve+download, preserve
//! wheels from the current mirror that fell out of this round's closure,
//! emit a new index, archive the current mirror, diff old against staged,
//! write a portable diff package, and atomically swap staging into place.
//!
//! Grounded on spec.md §4.6's seven ordered steps. There is no teacher
//! precedent for the archive/diff/diff-package machinery -- the teacher's
//! cache is append-only and never snapshots itself -- so this module is
//! hand-written in the teacher's idiom (typed errors, `fs_err`,
//! `tracing::info!` per step) rather than adapted from a specific file.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::info;

use wheelhouse_client::canonicalize;
use wheelhouse_downloader::Downloader;
use wheelhouse_fs::{hardlink_or_copy, sha256_hex_file};
use wheelhouse_resolver::{ClosureMap, Resolver, ResolvedPackage};
use wheelhouse_tags::{Target, WheelTag};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create directory {0:?}")]
    CreateDir(PathBuf, #[source] std::io::Error),
}

/// The four disjoint sets that describe what changed between the archived
/// pre-state and the newly-staged mirror (spec.md §3, §4.6 step 5).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DiffPackage {
    pub timestamp: String,
    pub added_wheels: BTreeSet<String>,
    pub removed_wheels: BTreeSet<String>,
    pub added_index_files: BTreeSet<String>,
    pub changed_index_files: BTreeSet<String>,
}

pub struct UpdateReport {
    pub timestamp: String,
    pub diff: DiffPackage,
    pub archive_dir: PathBuf,
    pub diff_dir: PathBuf,
}

/// Drives one full update cycle against a mirror rooted at `mirror_root`.
/// `mirror_root` itself is the live tree (`mirror_root/simple`,
/// `mirror_root/files`); `archives/` and `diffs/` are created as siblings.
pub struct UpdatePipeline {
    resolver: Resolver,
    download_concurrency: usize,
    targets: Vec<Target>,
    mirror_root: PathBuf,
    base_url: Option<String>,
}

impl UpdatePipeline {
    /// `download_concurrency` is used to build a fresh [`Downloader`] each
    /// run, since every run points it at a new staging directory.
    pub fn new(
        resolver: Resolver,
        download_concurrency: usize,
        targets: Vec<Target>,
        mirror_root: PathBuf,
        base_url: Option<String>,
    ) -> Self {
        Self {
            resolver,
            download_concurrency,
            targets,
            mirror_root,
            base_url,
        }
    }

    pub async fn run(&self, wishlist: &[String]) -> anyhow::Result<UpdateReport> {
        let root = self.mirror_root.parent().unwrap_or(Path::new("."));
        fs_err::create_dir_all(root).map_err(|err| Error::CreateDir(root.to_path_buf(), err))?;

        // Step 1: stage a fresh resolve + download.
        let staging = tempfile::Builder::new()
            .prefix("wheelhouse-stage-")
            .tempdir_in(root)?;
        let staging_files = staging.path().join("files");
        let staging_simple = staging.path().join("simple");
        fs_err::create_dir_all(&staging_files).map_err(|err| Error::CreateDir(staging_files.clone(), err))?;

        info!("resolving closure for {} root package(s)", wishlist.len());
        let closure = self.resolver.resolve(wishlist).await;
        info!("closure contains {} package(s)", closure.len());

        let downloader = Downloader::new(staging_files.clone(), self.download_concurrency);
        let report = downloader.download_all(&closure, &self.targets).await?;
        info!(
            "downloaded {}, skipped {}, failed {}, refused {}",
            report.downloaded.len(),
            report.skipped_existing.len(),
            report.failed.len(),
            report.refused.len()
        );

        // Step 2: preserve wheels from the current mirror that this round
        // didn't re-fetch, reconstructing a minimal package entry for any
        // that fell out of the new closure entirely.
        let current_files = self.mirror_root.join("files");
        let mut packages: Vec<ResolvedPackage> = closure.values().cloned().collect();
        preserve_old_wheels(&current_files, &staging_files, &closure, &mut packages)?;

        // Step 3: emit the staging index from the union package list.
        wheelhouse_index::emit(&packages, &staging_simple, &staging_files, self.base_url.as_deref())?;

        // Step 4: archive the current mirror before anything is swapped.
        let timestamp = timestamp_now();
        let archive_dir = root.join("archives").join(&timestamp);
        fs_err::create_dir_all(&archive_dir).map_err(|err| Error::CreateDir(archive_dir.clone(), err))?;
        if self.mirror_root.exists() {
            copy_tree(&self.mirror_root, &archive_dir)?;
        }

        // Step 5: diff archived pre-state against staging.
        let diff = compute_diff(&archive_dir, staging.path(), timestamp.clone())?;

        // Step 6: write the portable diff package.
        let diff_dir = root.join("diffs").join(&timestamp);
        write_diff_package(&diff, &diff_dir, staging.path())?;

        // Step 7: atomic swap. `staging` is consumed here; its `TempDir`
        // guard never gets a chance to clean up a path it no longer owns.
        let staging_path = staging.into_path();
        swap_in(&staging_path, &self.mirror_root)?;

        Ok(UpdateReport {
            timestamp,
            diff,
            archive_dir,
            diff_dir,
        })
    }
}

fn timestamp_now() -> String {
    const FORMAT: &[time::format_description::FormatItem] =
        format_description!("[year][month][day]T[hour][minute][second]Z");
    OffsetDateTime::now_utc()
        .format(FORMAT)
        .unwrap_or_else(|_| "unknown-timestamp".to_string())
}

/// Hard-link (falling back to copy) every wheel present in the current
/// mirror's `files/` but not already staged, and reconstruct a minimal
/// [`ResolvedPackage`] for any whose filename isn't referenced by the fresh
/// closure at all, so previously-mirrored artifacts stay indexed.
fn preserve_old_wheels(
    current_files: &Path,
    staging_files: &Path,
    closure: &ClosureMap,
    packages: &mut Vec<ResolvedPackage>,
) -> anyhow::Result<()> {
    if !current_files.is_dir() {
        return Ok(());
    }

    let known: HashSet<&str> = closure
        .values()
        .filter(|pkg| pkg.needs_wheels())
        .filter_map(|pkg| pkg.release.as_ref())
        .flat_map(|release| release.wheels.iter())
        .map(|wheel| wheel.filename.as_str())
        .collect();

    for entry in fs_err::read_dir(current_files)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        let staged_path = staging_files.join(&filename);

        if !staged_path.exists() {
            hardlink_or_copy(&entry.path(), &staged_path)?;
        }

        if known.contains(filename.as_str()) {
            continue;
        }

        if let Ok(tag) = WheelTag::parse(&filename, String::new(), None, None) {
            let (Ok(distribution), Ok(version)) = (tag.distribution(), tag.version()) else {
                continue;
            };
            let canonical = canonicalize(&distribution);
            packages.push(ResolvedPackage::new(
                canonical.clone(),
                version.clone(),
                Some(wheelhouse_client::Release {
                    canonical_name: canonical,
                    version,
                    wheels: vec![tag],
                    requires_python: None,
                }),
                true,
            ));
        }
    }

    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs_err::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs_err::create_dir_all(parent)?;
            }
            fs_err::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn relative_files(root: &Path) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect()
}

fn compute_diff(archive_dir: &Path, staging_dir: &Path, timestamp: String) -> anyhow::Result<DiffPackage> {
    let old_files: BTreeSet<String> = relative_files(&archive_dir.join("files"))
        .into_iter()
        .map(path_to_string)
        .collect();
    let new_files: BTreeSet<String> = relative_files(&staging_dir.join("files"))
        .into_iter()
        .map(path_to_string)
        .collect();
    let added_wheels: BTreeSet<String> = new_files.difference(&old_files).cloned().collect();
    let removed_wheels: BTreeSet<String> = old_files.difference(&new_files).cloned().collect();

    let mut added_index_files = BTreeSet::new();
    let mut changed_index_files = BTreeSet::new();
    for relative in relative_files(&staging_dir.join("simple")) {
        let old_path = archive_dir.join("simple").join(&relative);
        let new_path = staging_dir.join("simple").join(&relative);
        let key = path_to_string(relative);
        if !old_path.is_file() {
            added_index_files.insert(key);
            continue;
        }
        let old_hash = sha256_hex_file(&old_path)?;
        let new_hash = sha256_hex_file(&new_path)?;
        if old_hash != new_hash {
            changed_index_files.insert(key);
        }
    }

    Ok(DiffPackage {
        timestamp,
        added_wheels,
        removed_wheels,
        added_index_files,
        changed_index_files,
    })
}

fn path_to_string(path: PathBuf) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn write_diff_package(diff: &DiffPackage, diff_dir: &Path, staging_dir: &Path) -> anyhow::Result<()> {
    let files_out = diff_dir.join("files");
    let simple_out = diff_dir.join("simple");
    fs_err::create_dir_all(&files_out)?;
    fs_err::create_dir_all(&simple_out)?;

    for filename in &diff.added_wheels {
        fs_err::copy(staging_dir.join("files").join(filename), files_out.join(filename))?;
    }
    for relative in diff.added_index_files.iter().chain(diff.changed_index_files.iter()) {
        let src = staging_dir.join("simple").join(relative);
        let dst = simple_out.join(relative);
        if let Some(parent) = dst.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::copy(src, dst)?;
    }

    let manifest = serde_json::to_string_pretty(diff)?;
    fs_err::write(diff_dir.join("manifest.json"), manifest)?;
    fs_err::write(diff_dir.join("APPLY.md"), render_apply_runbook(diff))?;

    Ok(())
}

fn render_apply_runbook(diff: &DiffPackage) -> String {
    let mut out = String::new();
    out.push_str("# Applying this update\n\n");
    out.push_str("Run from the root of the target mirror, using this diff package's directory as `$DIFF`.\n\n");

    if !diff.added_wheels.is_empty() || !diff.added_index_files.is_empty() || !diff.changed_index_files.is_empty() {
        out.push_str("## Copy\n\n```sh\n");
        for filename in &diff.added_wheels {
            out.push_str(&format!("cp \"$DIFF/files/{filename}\" \"mirror/files/{filename}\"\n"));
        }
        for relative in diff.added_index_files.iter().chain(diff.changed_index_files.iter()) {
            out.push_str(&format!("cp \"$DIFF/simple/{relative}\" \"mirror/simple/{relative}\"\n"));
        }
        out.push_str("```\n\n");
    }

    if !diff.removed_wheels.is_empty() {
        out.push_str("## Remove\n\n```sh\n");
        for filename in &diff.removed_wheels {
            out.push_str(&format!("rm -f \"mirror/files/{filename}\"\n"));
        }
        out.push_str("```\n");
    }

    out
}

/// Replace the live mirror with the staged tree: move the old tree aside,
/// move staging into place, then discard the old tree. If the live mirror
/// doesn't exist yet, staging is simply moved into place.
fn swap_in(staging_path: &Path, mirror_root: &Path) -> anyhow::Result<()> {
    if mirror_root.exists() {
        let backup = mirror_root.with_extension("wheelhouse-swap-tmp");
        if backup.exists() {
            fs_err::remove_dir_all(&backup)?;
        }
        fs_err::rename(mirror_root, &backup)?;
        fs_err::rename(staging_path, mirror_root)?;
        fs_err::remove_dir_all(&backup)?;
    } else {
        if let Some(parent) = mirror_root.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::rename(staging_path, mirror_root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_detects_added_removed_and_changed() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let staging = dir.path().join("staging");
        fs_err::create_dir_all(archive.join("files")).unwrap();
        fs_err::create_dir_all(archive.join("simple")).unwrap();
        fs_err::create_dir_all(staging.join("files")).unwrap();
        fs_err::create_dir_all(staging.join("simple")).unwrap();

        fs_err::write(archive.join("files").join("a-1.0-py3-none-any.whl"), b"old").unwrap();
        fs_err::write(staging.join("files").join("a-1.0-py3-none-any.whl"), b"old").unwrap();
        fs_err::write(staging.join("files").join("b-2.0-py3-none-any.whl"), b"new").unwrap();

        fs_err::write(archive.join("simple").join("index.json"), b"{\"a\":1}").unwrap();
        fs_err::write(staging.join("simple").join("index.json"), b"{\"a\":2}").unwrap();
        fs_err::write(staging.join("simple").join("new.json"), b"{}").unwrap();

        let diff = compute_diff(&archive, &staging, "20260101T000000Z".to_string()).unwrap();
        assert_eq!(diff.added_wheels, BTreeSet::from(["b-2.0-py3-none-any.whl".to_string()]));
        assert!(diff.removed_wheels.is_empty());
        assert_eq!(diff.changed_index_files, BTreeSet::from(["index.json".to_string()]));
        assert_eq!(diff.added_index_files, BTreeSet::from(["new.json".to_string()]));
    }

    #[test]
    fn diff_detects_removed_wheel() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let staging = dir.path().join("staging");
        fs_err::create_dir_all(archive.join("files")).unwrap();
        fs_err::create_dir_all(archive.join("simple")).unwrap();
        fs_err::create_dir_all(staging.join("files")).unwrap();
        fs_err::create_dir_all(staging.join("simple")).unwrap();

        fs_err::write(archive.join("files").join("a-1.0-py3-none-any.whl"), b"old").unwrap();

        let diff = compute_diff(&archive, &staging, "20260101T000000Z".to_string()).unwrap();
        assert_eq!(diff.removed_wheels, BTreeSet::from(["a-1.0-py3-none-any.whl".to_string()]));
        assert!(diff.added_wheels.is_empty());
    }

    #[test]
    fn apply_runbook_lists_copy_and_remove_commands() {
        let diff = DiffPackage {
            timestamp: "20260101T000000Z".to_string(),
            added_wheels: BTreeSet::from(["new-1.0-py3-none-any.whl".to_string()]),
            removed_wheels: BTreeSet::from(["old-1.0-py3-none-any.whl".to_string()]),
            added_index_files: BTreeSet::new(),
            changed_index_files: BTreeSet::new(),
        };
        let runbook = render_apply_runbook(&diff);
        assert!(runbook.contains("cp \"$DIFF/files/new-1.0-py3-none-any.whl\""));
        assert!(runbook.contains("rm -f \"mirror/files/old-1.0-py3-none-any.whl\""));
    }
}
