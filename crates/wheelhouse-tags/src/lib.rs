//! Parsing of wheel filenames and evaluation of their compatibility with a
//! build target, per [PEP 427](https://peps.python.org/pep-0427/#file-name-convention).
//!
//! A wheel filename is `{name}-{version}(-{build})?-{pytags}-{abitags}-{plattags}.whl`,
//! where each of the three trailing tag segments is itself a dot-separated,
//! non-empty set of tokens (a "compressed tag set", PEP 425). Parsing is
//! total: [`WheelTag::parse`] rejects anything that doesn't fit the grammar
//! rather than guessing at a best-effort split.

use std::fmt;

use pep440_rs::Version;
use thiserror::Error;

/// A single built artifact ("wheel") belonging to a [`Release`](crate::Release
/// -- see `wheelhouse-resolver`), with its tag sets parsed out of the
/// filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelTag {
    pub filename: String,
    pub url: String,
    /// SHA-256 digest reported by the registry, if any.
    pub content_hash: Option<String>,
    /// The `requires-python` specifier reported by the registry, if any.
    pub requires_runtime: Option<String>,
    pub python_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub platform_tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum WheelTagError {
    #[error("the wheel filename \"{0}\" is invalid: {1}")]
    InvalidFilename(String, &'static str),
    #[error("the wheel filename \"{0}\" has an invalid version: {1}")]
    InvalidVersion(String, String),
}

/// The parsed name/version/build/tag components of a wheel filename, before
/// it's attached to a registry entry as a [`WheelTag`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedFilename {
    distribution: String,
    version: Version,
    python_tags: Vec<String>,
    abi_tags: Vec<String>,
    platform_tags: Vec<String>,
}

impl ParsedFilename {
    /// Parse a `.whl` filename's stem using the greedy, total grammar from
    /// PEP 427: the name-version prefix is everything up to the point where
    /// exactly five (or six, with a build tag) `-`-separated fields remain.
    fn parse(filename: &str) -> Result<Self, WheelTagError> {
        let stem = filename.strip_suffix(".whl").ok_or_else(|| {
            WheelTagError::InvalidFilename(filename.to_string(), "must end with .whl")
        })?;

        let mut parts = stem.split('-');

        let distribution = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                WheelTagError::InvalidFilename(filename.to_string(), "missing distribution name")
            })?
            .to_string();

        let version_str = parts.next().ok_or_else(|| {
            WheelTagError::InvalidFilename(filename.to_string(), "missing version")
        })?;

        let third = parts.next().ok_or_else(|| {
            WheelTagError::InvalidFilename(filename.to_string(), "missing python tag")
        })?;
        let fourth = parts.next().ok_or_else(|| {
            WheelTagError::InvalidFilename(filename.to_string(), "missing abi tag")
        })?;
        let fifth = parts.next().ok_or_else(|| {
            WheelTagError::InvalidFilename(filename.to_string(), "missing platform tag")
        })?;

        // Five fields: third/fourth/fifth are py/abi/plat. Six fields: third
        // is an optional build tag (must start with a digit) and the tags
        // shift over by one.
        let (python_tag, abi_tag, platform_tag) = if let Some(sixth) = parts.next() {
            if parts.next().is_some() {
                return Err(WheelTagError::InvalidFilename(
                    filename.to_string(),
                    "too many '-'-separated components",
                ));
            }
            if !third.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(WheelTagError::InvalidFilename(
                    filename.to_string(),
                    "build tag must start with a digit",
                ));
            }
            (fourth, fifth, sixth)
        } else {
            (third, fourth, fifth)
        };

        let version = Version::from_str(version_str)
            .map_err(|err| WheelTagError::InvalidVersion(filename.to_string(), err.to_string()))?;

        Ok(Self {
            distribution,
            version,
            python_tags: split_tag(python_tag),
            abi_tags: split_tag(abi_tag),
            platform_tags: split_tag(platform_tag),
        })
    }
}

fn split_tag(tag: &str) -> Vec<String> {
    tag.split('.').map(str::to_string).collect()
}

use std::str::FromStr as _;

impl WheelTag {
    /// Parse a wheel filename and attach the registry-supplied URL, content
    /// hash, and `requires-python` specifier. Returns an error rather than
    /// silently classifying an unparseable filename.
    pub fn parse(
        filename: &str,
        url: String,
        content_hash: Option<String>,
        requires_runtime: Option<String>,
    ) -> Result<Self, WheelTagError> {
        let parsed = ParsedFilename::parse(filename)?;
        Ok(Self {
            filename: filename.to_string(),
            url,
            content_hash,
            requires_runtime,
            python_tags: parsed.python_tags,
            abi_tags: parsed.abi_tags,
            platform_tags: parsed.platform_tags,
        })
    }

    /// The distribution name embedded in the filename (not normalized).
    pub fn distribution(&self) -> Result<String, WheelTagError> {
        Ok(ParsedFilename::parse(&self.filename)?.distribution)
    }

    /// The version embedded in the filename.
    pub fn version(&self) -> Result<Version, WheelTagError> {
        Ok(ParsedFilename::parse(&self.filename)?.version)
    }
}

impl fmt::Display for WheelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.filename)
    }
}

/// A (runtime-version, platform-tag) pair over which markers and wheel
/// compatibility are evaluated. `runtime_version` is e.g. `"3.12"`;
/// `platform` is e.g. `"linux_x86_64"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub runtime_version: String,
    pub platform: String,
}

impl Target {
    pub fn new(runtime_version: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            runtime_version: runtime_version.into(),
            platform: platform.into(),
        }
    }

    /// The Cartesian product of runtime versions and platforms that make up
    /// a build request's effective target set.
    pub fn product(runtime_versions: &[String], platforms: &[String]) -> Vec<Target> {
        runtime_versions
            .iter()
            .flat_map(|rv| {
                platforms
                    .iter()
                    .map(move |p| Target::new(rv.clone(), p.clone()))
            })
            .collect()
    }

    /// Parse `"3.12"` into `(3, 12)`. Returns `None` for anything that isn't
    /// `major.minor`.
    fn major_minor(&self) -> Option<(u64, u64)> {
        let (major, minor) = self.runtime_version.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }
}

/// Is `tag` compatible with the runtime `(major, minor)` of a target,
/// per spec §4.1.1?
fn runtime_tag_compatible(python_tag: &str, abi_tags: &[String], major: u64, minor: u64) -> bool {
    if python_tag == format!("cp{major}{minor}")
        || python_tag == format!("py{major}")
        || python_tag == format!("py{major}{minor}")
        || (major == 3 && (python_tag == "py3" || python_tag == "cp3"))
    {
        return true;
    }

    // Stable-ABI forward compatibility: `abi3` + `cp3{k}` with k <= minor,
    // major == 3 only.
    if major == 3 {
        if let Some(k) = python_tag.strip_prefix("cp3").and_then(|s| s.parse::<u64>().ok()) {
            if k <= minor && abi_tags.iter().any(|abi| abi == "abi3") {
                return true;
            }
        }
    }

    false
}

/// Is `platform_tag` compatible with a target platform, per spec §4.1.2?
fn platform_tag_compatible(platform_tag: &str, target_platform: &str) -> bool {
    if platform_tag == "any" {
        return true;
    }
    if platform_tag == target_platform {
        return true;
    }
    if let Some(arch) = target_platform.strip_prefix("linux_") {
        let suffix = format!("_{arch}");
        if (platform_tag.starts_with("manylinux") || platform_tag.starts_with("musllinux"))
            && platform_tag.ends_with(&suffix)
        {
            return true;
        }
    }
    false
}

impl WheelTag {
    /// A wheel is compatible with a target if at least one of its python
    /// tags matches the target's runtime version (directly, or via abi3
    /// forward-compatibility) *and* at least one of its platform tags
    /// matches the target's platform.
    pub fn compatible_with(&self, target: &Target) -> bool {
        let Some((major, minor)) = target.major_minor() else {
            return false;
        };
        let runtime_ok = self
            .python_tags
            .iter()
            .any(|tag| runtime_tag_compatible(tag, &self.abi_tags, major, minor));
        let platform_ok = self
            .platform_tags
            .iter()
            .any(|tag| platform_tag_compatible(tag, &target.platform));
        runtime_ok && platform_ok
    }

    /// Is this wheel compatible with the runtime version alone, ignoring
    /// platform? Used by the downloader's runtime-only fallback selection.
    pub fn compatible_with_runtime(&self, target: &Target) -> bool {
        let Some((major, minor)) = target.major_minor() else {
            return false;
        };
        self.python_tags
            .iter()
            .any(|tag| runtime_tag_compatible(tag, &self.abi_tags, major, minor))
    }

    /// A wheel is "wanted" for a build when it is compatible with at least
    /// one of the given targets.
    pub fn wanted(&self, targets: &[Target]) -> bool {
        targets.iter().any(|target| self.compatible_with(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(filename: &str) -> WheelTag {
        WheelTag::parse(filename, format!("https://example.invalid/{filename}"), None, None)
            .unwrap()
    }

    #[test]
    fn parses_simple_wheel() {
        let t = tag("click-8.1.7-py3-none-any.whl");
        assert_eq!(t.python_tags, vec!["py3"]);
        assert_eq!(t.abi_tags, vec!["none"]);
        assert_eq!(t.platform_tags, vec!["any"]);
    }

    #[test]
    fn parses_build_tag() {
        let t = tag("foo-1.2.3-202206090410-py3-none-any.whl");
        assert_eq!(t.python_tags, vec!["py3"]);
    }

    #[test]
    fn parses_multi_tag() {
        let t = tag("numpy-1.26.2-cp311-cp311-manylinux_2_17_x86_64.manylinux2014_x86_64.whl");
        assert_eq!(t.platform_tags.len(), 2);
    }

    #[test]
    fn rejects_non_whl() {
        assert!(WheelTag::parse("foo.tar.gz", String::new(), None, None).is_err());
    }

    #[test]
    fn rejects_too_few_components() {
        assert!(WheelTag::parse("foo-1.0-py3-none.whl", String::new(), None, None).is_err());
    }

    #[test]
    fn rejects_too_many_components() {
        assert!(WheelTag::parse(
            "foo-1.0-build-py3-none-any-extra.whl",
            String::new(),
            None,
            None
        )
        .is_err());
    }

    #[test]
    fn pure_python_wanted_on_any_target() {
        let t = tag("click-8.1.7-py3-none-any.whl");
        let targets = Target::product(&["3.12".into()], &["linux_x86_64".into()]);
        assert!(t.wanted(&targets));
    }

    #[test]
    fn stable_abi_forward_compatible() {
        let t = tag("foo-1.0-cp36-abi3-linux_x86_64.whl");
        let target = Target::new("3.12", "linux_x86_64");
        assert!(t.compatible_with(&target));
    }

    #[test]
    fn stable_abi_does_not_cross_major() {
        let t = tag("foo-1.0-cp36-abi3-linux_x86_64.whl");
        let target = Target::new("2.7", "linux_x86_64");
        assert!(!t.compatible_with(&target));
    }

    #[test]
    fn manylinux_matches_linux_target() {
        let t = tag("foo-1.0-cp312-cp312-manylinux_2_17_x86_64.whl");
        assert!(t.compatible_with(&Target::new("3.12", "linux_x86_64")));
        assert!(!t.compatible_with(&Target::new("3.12", "win_amd64")));
    }

    #[test]
    fn musllinux_matches_linux_target() {
        let t = tag("foo-1.0-cp312-cp312-musllinux_1_2_x86_64.whl");
        assert!(t.compatible_with(&Target::new("3.12", "linux_x86_64")));
    }

    #[test]
    fn windows_exact_match_only() {
        let t = tag("foo-1.0-cp312-cp312-win_amd64.whl");
        assert!(t.compatible_with(&Target::new("3.12", "win_amd64")));
        assert!(!t.compatible_with(&Target::new("3.12", "linux_x86_64")));
    }

    #[test]
    fn not_wanted_when_no_target_matches() {
        let t = tag("foo-1.0-cp39-cp39-win32.whl");
        let targets = Target::product(&["3.12".into()], &["linux_x86_64".into()]);
        assert!(!t.wanted(&targets));
    }
}
