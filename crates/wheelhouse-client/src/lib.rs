//! A client for the upstream PyPI JSON API, bounded to a fixed number of
//! in-flight requests.
//!
//! Grounded on `puffin-client::registry_client::RegistryClient` (HTTP client
//! construction, retry middleware wiring) and `puffin-client::client`'s
//! error-handling shape, adapted from the Simple-HTML/range-request-metadata
//! protocol those clients speak to the plain `{pypi_url}/{name}/json`
//! endpoint this spec targets.

mod error;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, ClientBuilder, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use pep440_rs::Version;
use wheelhouse_tags::WheelTag;

pub use error::Error;

/// Lowercase the name and collapse runs of `-`, `_`, `.` into a single `-`,
/// per [PEP 503](https://peps.python.org/pep-0503/#normalized-names).
pub fn canonicalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_separator = false;
    for ch in name.chars() {
        if ch == '-' || ch == '_' || ch == '.' {
            if !last_was_separator && !out.is_empty() {
                out.push('-');
            }
            last_was_separator = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// A specific (canonical-name, version) release, with its built wheels.
/// Source distributions are never parsed or stored.
#[derive(Debug, Clone)]
pub struct Release {
    pub canonical_name: String,
    pub version: Version,
    pub wheels: Vec<WheelTag>,
    pub requires_python: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryClientBuilder {
    pypi_url: String,
    concurrency: usize,
    retries: u32,
    timeout: Duration,
}

impl Default for RegistryClientBuilder {
    fn default() -> Self {
        Self {
            pypi_url: "https://pypi.org/pypi".to_string(),
            concurrency: 10,
            retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RegistryClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pypi_url(mut self, pypi_url: impl Into<String>) -> Self {
        self.pypi_url = pypi_url.into();
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn build(self) -> RegistryClient {
        let raw = ClientBuilder::new()
            .user_agent(concat!("wheelhouse/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(20)
            .timeout(self.timeout)
            .build()
            .expect("failed to build HTTP client");

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(self.retries);
        let client = reqwest_middleware::ClientBuilder::new(raw.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        RegistryClient {
            pypi_url: self.pypi_url,
            client,
            _raw: raw,
            semaphore: Arc::new(Semaphore::new(self.concurrency)),
        }
    }
}

/// A client for fetching release metadata and dependency lists from the
/// upstream PyPI-compatible JSON API, with a bounded number of in-flight
/// requests (the resolver's BFS rounds share this one client).
#[derive(Debug, Clone)]
pub struct RegistryClient {
    pypi_url: String,
    client: ClientWithMiddleware,
    _raw: Client,
    semaphore: Arc<Semaphore>,
}

impl RegistryClient {
    /// Fetch the release metadata for `name` (optionally pinned to
    /// `version`; otherwise the upstream-reported latest). Returns `None` on
    /// any HTTP error or transport failure -- the caller treats that as a
    /// resolution failure for this package and continues the build.
    pub async fn fetch_release(&self, name: &str, version: Option<&str>) -> Option<Release> {
        let canonical = canonicalize(name);
        let url = match version {
            Some(version) => format!("{}/{}/{}/json", self.pypi_url, canonical, version),
            None => format!("{}/{}/json", self.pypi_url, canonical),
        };

        match self.fetch_json(&url).await {
            Ok(body) => Some(self.release_from_json(&canonical, body)),
            Err(err) => {
                warn!("failed to fetch release metadata for {canonical}: {err}");
                None
            }
        }
    }

    /// Fetch and parse `info.requires_dist` for `name`/`version`.
    /// Requirements that fail to parse are dropped (logged at debug), not
    /// propagated as an error.
    pub async fn fetch_dependencies(&self, name: &str, version: &str) -> Vec<pep508_rs::Requirement> {
        let canonical = canonicalize(name);
        let url = format!("{}/{}/{}/json", self.pypi_url, canonical, version);

        let body = match self.fetch_json(&url).await {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to fetch dependency metadata for {canonical} {version}: {err}");
                return Vec::new();
            }
        };

        body.info
            .requires_dist
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| match pep508_rs::Requirement::from_str(&raw) {
                Ok(req) => Some(req),
                Err(err) => {
                    debug!("dropping unparseable requirement \"{raw}\": {err}");
                    None
                }
            })
            .collect()
    }

    async fn fetch_json(&self, url: &str) -> Result<PypiJson, Error> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let response = self.client.get(url).send().await.map_err(Error::Request)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(url.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|err| Error::Status(url.to_string(), err.status()))?;
        let bytes = response.bytes().await.map_err(Error::Request)?;
        serde_json::from_slice(&bytes).map_err(|err| Error::Decode(url.to_string(), err))
    }

    fn release_from_json(&self, canonical: &str, body: PypiJson) -> Release {
        let version = Version::from_str(&body.info.version).unwrap_or_else(|_| Version::new([0]));
        let wheels = body
            .urls
            .into_iter()
            .filter(|entry| entry.filename.ends_with(".whl"))
            .filter_map(|entry| {
                match WheelTag::parse(
                    &entry.filename,
                    entry.url,
                    entry.digests.and_then(|d| d.sha256),
                    entry.requires_python.clone(),
                ) {
                    Ok(tag) => Some(tag),
                    Err(err) => {
                        warn!("dropping unparseable wheel filename \"{}\": {err}", entry.filename);
                        None
                    }
                }
            })
            .collect();

        Release {
            canonical_name: canonical.to_string(),
            version,
            wheels,
            requires_python: body.info.requires_python,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PypiJson {
    info: PypiInfo,
    #[serde(default)]
    urls: Vec<PypiUrlEntry>,
}

#[derive(Debug, Deserialize)]
struct PypiInfo {
    version: String,
    #[serde(default)]
    requires_dist: Option<Vec<String>>,
    #[serde(default)]
    requires_python: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PypiUrlEntry {
    filename: String,
    url: String,
    #[serde(default)]
    digests: Option<PypiDigests>,
    #[serde(default)]
    requires_python: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PypiDigests {
    #[serde(default)]
    sha256: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_per_pep503() {
        assert_eq!(canonicalize("Friendly-Bard"), "friendly-bard");
        assert_eq!(canonicalize("SomeProject"), "someproject");
        assert_eq!(canonicalize("some_project"), "some-project");
        assert_eq!(canonicalize("some.project"), "some-project");
        assert_eq!(canonicalize("some---project"), "some-project");
        assert_eq!(canonicalize("__Some...Project__"), "some-project");
    }

    #[test]
    fn parses_release_json() {
        let client = RegistryClientBuilder::new().build();
        let body: PypiJson = serde_json::from_str(
            r#"{
                "info": {"version": "8.1.7", "requires_dist": ["colorama ; sys_platform == 'win32'"]},
                "urls": [
                    {"filename": "click-8.1.7-py3-none-any.whl", "url": "https://files.pythonhosted.org/click.whl",
                     "digests": {"sha256": "abc"}},
                    {"filename": "click-8.1.7.tar.gz", "url": "https://files.pythonhosted.org/click.tar.gz",
                     "digests": {"sha256": "def"}}
                ]
            }"#,
        )
        .unwrap();
        let release = client.release_from_json("click", body);
        assert_eq!(release.wheels.len(), 1);
        assert_eq!(release.wheels[0].filename, "click-8.1.7-py3-none-any.whl");
    }
}
