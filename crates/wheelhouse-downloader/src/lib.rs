//! Concurrent wheel downloading: selection of the wheels a target set
//! actually needs, streaming with hash verification, skip-if-present, and
//! atomic rename into the mirror's `files/` directory.
//!
//! Grounded on `install-wheel-rs::wheel::copy_and_hash` for the
//! streaming-hash shape, and on the teacher's preference for
//! `tempfile_in(...)` + rename-into-place (seen in
//! `puffin-client::wheel_metadata_no_pep658`) for the atomic-staging
//! protocol.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use wheelhouse_fs::{is_safe_component, persist_atomically};
use wheelhouse_resolver::ClosureMap;
use wheelhouse_tags::{Target, WheelTag};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create output directory {0:?}")]
    CreateDir(PathBuf, #[source] std::io::Error),
}

/// Outcome of a download pass, for the CLI/update pipeline to report on.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<String>,
    pub skipped_existing: Vec<String>,
    pub failed: Vec<String>,
    pub refused: Vec<String>,
}

pub struct Downloader {
    client: reqwest::Client,
    files_dir: PathBuf,
    semaphore: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(files_dir: PathBuf, concurrency: usize) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("wheelhouse/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to build HTTP client"),
            files_dir,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Download every wheel selected (per spec.md §4.4) for the
    /// `needs_wheels` packages in `closure`, for the given `targets`.
    pub async fn download_all(&self, closure: &ClosureMap, targets: &[Target]) -> Result<DownloadReport, Error> {
        fs_err::create_dir_all(&self.files_dir)
            .map_err(|err| Error::CreateDir(self.files_dir.clone(), err))?;

        let selected: Vec<WheelTag> = closure
            .values()
            .filter(|pkg| pkg.needs_wheels())
            .filter_map(|pkg| pkg.release.as_ref())
            .flat_map(|release| select_wheels(&release.wheels, targets))
            .collect();

        let progress = self.progress_bar(selected.len() as u64);

        let mut report = DownloadReport::default();
        let mut tasks: FuturesUnordered<_> = selected
            .into_iter()
            .filter_map(|wheel| {
                if !is_safe_component(&wheel.filename) {
                    warn!("refusing wheel with unsafe filename: {}", wheel.filename);
                    report.refused.push(wheel.filename.clone());
                    None
                } else {
                    Some(wheel)
                }
            })
            .map(|wheel| self.download_one(wheel))
            .collect();

        while let Some(outcome) = tasks.next().await {
            if let Some(bar) = &progress {
                bar.inc(1);
            } else {
                info!("downloaded {}", outcome.filename());
            }
            match outcome {
                Outcome::Downloaded(name) => report.downloaded.push(name),
                Outcome::AlreadyPresent(name) => report.skipped_existing.push(name),
                Outcome::Failed(name) => report.failed.push(name),
            }
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        Ok(report)
    }

    fn progress_bar(&self, total: u64) -> Option<ProgressBar> {
        if total == 0 || !std::io::stderr().is_terminal() {
            return None;
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} wheels").unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Some(bar)
    }

    async fn download_one(&self, wheel: WheelTag) -> Outcome {
        let dest = self.files_dir.join(&wheel.filename);
        if dest.exists() {
            return Outcome::AlreadyPresent(wheel.filename);
        }

        let _permit = self.semaphore.acquire().await.expect("semaphore is never closed");

        match self.stream_to_temp(&wheel, &dest).await {
            Ok(()) => Outcome::Downloaded(wheel.filename),
            Err(err) => {
                error!("failed to download {}: {err}", wheel.filename);
                Outcome::Failed(wheel.filename)
            }
        }
    }

    async fn stream_to_temp(&self, wheel: &WheelTag, dest: &Path) -> anyhow::Result<()> {
        let tmp_path = dest.with_extension("part");
        let response = self.client.get(&wheel.url).send().await?.error_for_status()?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = futures::TryStreamExt::try_next(&mut stream).await? {
            hasher.update(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = &wheel.content_hash {
            let actual = hex::encode(hasher.finalize());
            if &actual != expected {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                anyhow::bail!("hash mismatch for {}: expected {expected}, got {actual}", wheel.filename);
            }
        }

        persist_atomically(&tmp_path, dest).await?;
        Ok(())
    }
}

enum Outcome {
    Downloaded(String),
    AlreadyPresent(String),
    Failed(String),
}

impl Outcome {
    fn filename(&self) -> &str {
        match self {
            Outcome::Downloaded(n) | Outcome::AlreadyPresent(n) | Outcome::Failed(n) => n,
        }
    }
}

/// Select the wheels of a single release that are worth downloading for
/// `targets`, per spec.md §4.4's selection + fallback rule:
/// 1. wheels compatible with at least one target;
/// 2. if none, wheels compatible with at least one target's runtime version
///    alone;
/// 3. if still none but the release has *any* wheels, keep all of them --
///    this guarantees something is stored for a reachable, `needs_wheels`
///    package that only ships off-target builds.
pub fn select_wheels(wheels: &[WheelTag], targets: &[Target]) -> Vec<WheelTag> {
    let wanted: Vec<WheelTag> = wheels
        .iter()
        .filter(|wheel| wheel.wanted(targets))
        .cloned()
        .collect();
    if !wanted.is_empty() {
        return wanted;
    }

    let runtime_only: Vec<WheelTag> = wheels
        .iter()
        .filter(|wheel| targets.iter().any(|t| wheel.compatible_with_runtime(t)))
        .cloned()
        .collect();
    if !runtime_only.is_empty() {
        return runtime_only;
    }

    wheels.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(filename: &str) -> WheelTag {
        WheelTag::parse(filename, format!("https://example.invalid/{filename}"), None, None).unwrap()
    }

    #[test]
    fn select_prefers_exact_match() {
        let wheels = vec![
            tag("foo-1.0-py3-none-any.whl"),
            tag("foo-1.0-cp39-cp39-win32.whl"),
        ];
        let targets = Target::product(&["3.12".into()], &["linux_x86_64".into()]);
        let selected = select_wheels(&wheels, &targets);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].filename, "foo-1.0-py3-none-any.whl");
    }

    #[test]
    fn select_falls_back_to_runtime_only() {
        let wheels = vec![tag("foo-1.0-cp312-cp312-win_amd64.whl")];
        let targets = Target::product(&["3.12".into()], &["linux_x86_64".into()]);
        let selected = select_wheels(&wheels, &targets);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn select_falls_back_to_everything() {
        let wheels = vec![tag("foo-1.0-cp27-cp27m-win32.whl")];
        let targets = Target::product(&["3.12".into()], &["linux_x86_64".into()]);
        let selected = select_wheels(&wheels, &targets);
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn download_all_refuses_path_traversal_filename() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().join("files"), 2);
        let closure = ClosureMap::new();
        // An empty closure exercises the plumbing without any network
        // access; the path-traversal refusal itself is unit-tested directly
        // against `is_safe_component` in `wheelhouse-fs`.
        let report = downloader.download_all(&closure, &[]).await.unwrap();
        assert!(report.downloaded.is_empty());
        assert!(report.refused.is_empty());
    }
}
