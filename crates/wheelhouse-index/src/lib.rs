//! Emits the on-disk mirror tree: PEP 691 JSON and PEP 503 HTML, with
//! canonicalized project directories, stable (sorted) ordering, and URL
//! rewriting between upstream and locally-stored wheels.
//!
//! The teacher only *parses* Simple Repository HTML
//! (`puffin-client::html::SimpleHtml`); there's no teacher precedent for
//! *emitting* it, so the HTML writer here is hand-written `write!`
//! templating in the same terse style rather than adapted from a teacher
//! module that doesn't exist.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use wheelhouse_client::canonicalize;
use wheelhouse_fs::{safe_join, sha256_hex_file, PathSafetyError};
use wheelhouse_resolver::ResolvedPackage;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    PathSafety(#[from] PathSafetyError),
    #[error("I/O error writing {0:?}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize index for {0:?}")]
    Serialize(PathBuf, #[source] serde_json::Error),
}

const API_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct Meta {
    #[serde(rename = "api-version")]
    api_version: &'static str,
}

#[derive(Debug, Serialize)]
struct ProjectListEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct ProjectListJson {
    meta: Meta,
    projects: Vec<ProjectListEntry>,
}

#[derive(Debug, Serialize, Clone)]
struct FileEntry {
    filename: String,
    url: String,
    hashes: Hashes,
    #[serde(rename = "requires-python", skip_serializing_if = "Option::is_none")]
    requires_python: Option<String>,
}

#[derive(Debug, Serialize, Clone, Default)]
struct Hashes {
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProjectDetailJson {
    meta: Meta,
    name: String,
    files: Vec<FileEntry>,
}

/// Emit the full `<simple>/` tree for `packages` under `simple_root`, with
/// wheel bodies expected to live (or not) in `files_dir`. `base_url`, if
/// set, is used to build absolute URLs for locally-stored wheels instead of
/// the default `../../files/{filename}` relative form.
pub fn emit(
    packages: &[ResolvedPackage],
    simple_root: &Path,
    files_dir: &Path,
    base_url: Option<&str>,
) -> Result<(), Error> {
    fs_err::create_dir_all(simple_root).map_err(|err| Error::Io(simple_root.to_path_buf(), err))?;

    let by_project = group_by_canonical_name(packages);

    for (canonical, entries) in &by_project {
        let project_dir = safe_join(simple_root, canonical)?;
        fs_err::create_dir_all(&project_dir).map_err(|err| Error::Io(project_dir.clone(), err))?;

        let files = merged_file_entries(entries, files_dir, base_url);
        write_project_detail(&project_dir, canonical, &files)?;
    }

    write_project_list(simple_root, by_project.keys())?;

    Ok(())
}

fn group_by_canonical_name(packages: &[ResolvedPackage]) -> BTreeMap<String, Vec<&ResolvedPackage>> {
    let mut grouped: BTreeMap<String, Vec<&ResolvedPackage>> = BTreeMap::new();
    for pkg in packages {
        grouped
            .entry(canonicalize(&pkg.canonical_name))
            .or_default()
            .push(pkg);
    }
    grouped
}

/// Build the file list for one project: every wheel across every version,
/// sorted by filename, with duplicate filenames collapsed to their first
/// occurrence.
fn merged_file_entries(entries: &[&ResolvedPackage], files_dir: &Path, base_url: Option<&str>) -> Vec<FileEntry> {
    let mut seen = std::collections::HashSet::new();
    let mut files = Vec::new();

    for pkg in entries {
        let Some(release) = pkg.release.as_ref() else {
            continue;
        };
        for wheel in &release.wheels {
            if !seen.insert(wheel.filename.clone()) {
                continue;
            }
            let requires_python = wheel
                .requires_runtime
                .clone()
                .or_else(|| release.requires_python.clone());

            if pkg.needs_wheels() {
                let local_path = files_dir.join(&wheel.filename);
                if !local_path.exists() {
                    // The index never lies: a selected-but-undownloaded
                    // wheel (hash mismatch, transport failure) is omitted.
                    continue;
                }
                let url = match base_url {
                    Some(base) => format!("{}/files/{}", base.trim_end_matches('/'), wheel.filename),
                    None => format!("../../files/{}", wheel.filename),
                };
                let sha256 = wheel
                    .content_hash
                    .clone()
                    .or_else(|| sha256_hex_file(&local_path).ok());
                files.push(FileEntry {
                    filename: wheel.filename.clone(),
                    url,
                    hashes: Hashes { sha256 },
                    requires_python,
                });
            } else {
                files.push(FileEntry {
                    filename: wheel.filename.clone(),
                    url: wheel.url.clone(),
                    hashes: Hashes {
                        sha256: wheel.content_hash.clone(),
                    },
                    requires_python,
                });
            }
        }
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    files
}

fn write_project_detail(project_dir: &Path, canonical: &str, files: &[FileEntry]) -> Result<(), Error> {
    let json_path = project_dir.join("index.json");
    let doc = ProjectDetailJson {
        meta: Meta { api_version: API_VERSION },
        name: canonical.to_string(),
        files: files.to_vec(),
    };
    let body = serde_json::to_string_pretty(&doc).map_err(|err| Error::Serialize(json_path.clone(), err))?;
    fs_err::write(&json_path, body).map_err(|err| Error::Io(json_path.clone(), err))?;

    let html_path = project_dir.join("index.html");
    let mut html = String::from("<!DOCTYPE html>\n<html>\n  <body>\n");
    for file in files {
        html.push_str(&render_anchor(&file.url, &file.hashes.sha256, &file.requires_python, &file.filename));
    }
    html.push_str("  </body>\n</html>\n");
    fs_err::write(&html_path, html).map_err(|err| Error::Io(html_path, err))?;

    Ok(())
}

fn write_project_list<'a>(simple_root: &Path, names: impl Iterator<Item = &'a String>) -> Result<(), Error> {
    let mut projects: Vec<ProjectListEntry> = names.map(|name| ProjectListEntry { name: name.clone() }).collect();
    projects.sort_by(|a, b| a.name.cmp(&b.name));

    let json_path = simple_root.join("index.json");
    let doc = ProjectListJson {
        meta: Meta { api_version: API_VERSION },
        projects: projects.clone(),
    };
    let body = serde_json::to_string_pretty(&doc).map_err(|err| Error::Serialize(json_path.clone(), err))?;
    fs_err::write(&json_path, body).map_err(|err| Error::Io(json_path.clone(), err))?;

    let html_path = simple_root.join("index.html");
    let mut html = String::from("<!DOCTYPE html>\n<html>\n  <body>\n");
    for project in &projects {
        html.push_str(&format!(
            "    <a href=\"{name}/\">{name}</a><br>\n",
            name = project.name
        ));
    }
    html.push_str("  </body>\n</html>\n");
    fs_err::write(&html_path, html).map_err(|err| Error::Io(html_path, err))?;

    Ok(())
}

fn render_anchor(url: &str, sha256: &Option<String>, requires_python: &Option<String>, filename: &str) -> String {
    let hash_fragment = sha256.as_deref().map(|h| format!("#sha256={h}")).unwrap_or_default();
    let requires_attr = requires_python
        .as_deref()
        .map(|rp| format!(" data-requires-python=\"{}\"", html_escape(rp)))
        .unwrap_or_default();
    format!(
        "    <a href=\"{url}{hash_fragment}\"{requires_attr}>{filename}</a><br>\n",
        url = url,
        hash_fragment = hash_fragment,
        requires_attr = requires_attr,
        filename = filename,
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pep440_rs::Version;
    use std::str::FromStr;
    use wheelhouse_client::Release;
    use wheelhouse_tags::WheelTag;

    fn pkg(name: &str, version: &str, wheels: Vec<WheelTag>, needs_wheels: bool) -> ResolvedPackage {
        ResolvedPackage::new(
            canonicalize(name),
            Version::from_str(version).unwrap(),
            Some(Release {
                canonical_name: canonicalize(name),
                version: Version::from_str(version).unwrap(),
                wheels,
                requires_python: None,
            }),
            needs_wheels,
        )
    }

    fn wheel(filename: &str, hash: Option<&str>) -> WheelTag {
        WheelTag::parse(
            filename,
            format!("https://files.pythonhosted.org/{filename}"),
            hash.map(str::to_string),
            None,
        )
        .unwrap()
    }

    #[test]
    fn refuses_path_traversal_project_name() {
        let dir = tempfile::tempdir().unwrap();
        let simple_root = dir.path().join("simple");
        let packages = vec![pkg(
            "../../etc",
            "1.0",
            vec![wheel("evil-1.0-py3-none-any.whl", None)],
            false,
        )];
        let err = emit(&packages, &simple_root, &dir.path().join("files"), None).unwrap_err();
        assert!(matches!(err, Error::PathSafety(_)));
    }

    #[test]
    fn needs_wheels_entry_omitted_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let simple_root = dir.path().join("simple");
        let files_dir = dir.path().join("files");
        let packages = vec![pkg(
            "click",
            "8.1.7",
            vec![wheel("click-8.1.7-py3-none-any.whl", Some("abc"))],
            true,
        )];
        emit(&packages, &simple_root, &files_dir, None).unwrap();
        let body = fs_err::read_to_string(simple_root.join("click").join("index.json")).unwrap();
        assert!(!body.contains("click-8.1.7-py3-none-any.whl"));
    }

    #[test]
    fn metadata_only_entry_points_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let simple_root = dir.path().join("simple");
        let files_dir = dir.path().join("files");
        let packages = vec![pkg(
            "colorama",
            "0.4.6",
            vec![wheel("colorama-0.4.6-py2.py3-none-any.whl", Some("abc"))],
            false,
        )];
        emit(&packages, &simple_root, &files_dir, None).unwrap();
        let body = fs_err::read_to_string(simple_root.join("colorama").join("index.json")).unwrap();
        assert!(body.contains("files.pythonhosted.org"));
    }

    #[test]
    fn local_wheel_gets_relative_url_without_base() {
        let dir = tempfile::tempdir().unwrap();
        let simple_root = dir.path().join("simple");
        let files_dir = dir.path().join("files");
        fs_err::create_dir_all(&files_dir).unwrap();
        fs_err::write(files_dir.join("click-8.1.7-py3-none-any.whl"), b"wheel bytes").unwrap();
        let packages = vec![pkg(
            "click",
            "8.1.7",
            vec![wheel("click-8.1.7-py3-none-any.whl", Some("abc"))],
            true,
        )];
        emit(&packages, &simple_root, &files_dir, None).unwrap();
        let body = fs_err::read_to_string(simple_root.join("click").join("index.json")).unwrap();
        assert!(body.contains("../../files/click-8.1.7-py3-none-any.whl"));
    }

    #[test]
    fn project_list_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let simple_root = dir.path().join("simple");
        let files_dir = dir.path().join("files");
        let packages = vec![
            pkg("zeta", "1.0", vec![], false),
            pkg("alpha", "1.0", vec![], false),
        ];
        emit(&packages, &simple_root, &files_dir, None).unwrap();
        let body = fs_err::read_to_string(simple_root.join("index.json")).unwrap();
        let alpha_pos = body.find("alpha").unwrap();
        let zeta_pos = body.find("zeta").unwrap();
        assert!(alpha_pos < zeta_pos);
    }
}
