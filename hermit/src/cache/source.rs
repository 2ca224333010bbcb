//! Pluggable download strategies, selected by URI scheme.
//!
//! The cache dispatches each candidate URI to a [`PackageSource`]: `file://`
//! copies, `http(s)://` streams with checksum verification, and `*.git[#tag]`
//! shallow-clones. Additional strategies plug in by extending the selector at
//! construction; nothing else in the core depends on a specific one.

use std::fs;
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{HermitError, HermitResult};

/// A single download strategy for one URI
pub trait PackageSource {
    /// Fetch the artifact into `dest` (a file, or a directory for git
    /// checkouts), verifying against `digests` when non-empty. Returns the
    /// origin's ETag, or an empty string when it has none.
    fn download(&self, dest: &Utf8Path, digests: &[String]) -> HermitResult<String>;

    /// Probe the origin's current ETag without downloading. An origin that is
    /// reachable but carries no ETag yields an empty string; transport and
    /// server failures are errors.
    fn etag(&self) -> HermitResult<String>;

    /// Cheaply check that the origin is reachable
    fn validate(&self) -> HermitResult<()>;
}

/// Select a [`PackageSource`] for a URI
pub fn source_for(
    client: &reqwest::blocking::Client,
    uri: &str,
) -> HermitResult<Box<dyn PackageSource>> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Box::new(FileSource { path: Utf8PathBuf::from(path) }));
    }
    if is_git_uri(uri) {
        let (repo, tag) = match uri.split_once('#') {
            Some((repo, tag)) => (repo.to_string(), Some(tag.to_string())),
            None => (uri.to_string(), None),
        };
        return Ok(Box::new(GitSource { repo, tag }));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Box::new(HttpSource { client: client.clone(), url: uri.to_string() }));
    }
    Err(HermitError::msg(format!("unsupported source URI {uri:?}")))
}

fn is_git_uri(uri: &str) -> bool {
    let repo = uri.split_once('#').map(|(repo, _)| repo).unwrap_or(uri);
    repo.ends_with(".git")
}

/// `http(s)://` — streamed download with checksum-before-rename
pub struct HttpSource {
    client: reqwest::blocking::Client,
    url: String,
}

impl PackageSource for HttpSource {
    fn download(&self, dest: &Utf8Path, digests: &[String]) -> HermitResult<String> {
        let response = self.client.get(&self.url).send()?.error_for_status()?;
        let etag = header_etag(response.headers());

        let parent = dest
            .parent()
            .ok_or_else(|| HermitError::msg(format!("cache path {dest} has no parent")))?;
        fs::create_dir_all(parent)?;
        // Stream through a hasher into a temporary alongside the final path;
        // only a verified download is renamed into place.
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{}.", dest.file_name().unwrap_or("artifact")))
            .suffix(".tmp.download")
            .tempfile_in(parent)?;
        let mut hasher = Sha256::new();
        let mut reader = response;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }
        tmp.flush()?;

        let actual = hex::encode(hasher.finalize());
        if !digests.is_empty() && !digests.iter().any(|d| d.eq_ignore_ascii_case(&actual)) {
            return Err(HermitError::ChecksumMismatch {
                uri: self.url.clone(),
                expected: digests.join(" or "),
                actual,
            });
        }

        tmp.persist(dest).map_err(|err| err.error)?;
        debug!("downloaded {} to {dest}", self.url);
        Ok(etag)
    }

    fn etag(&self) -> HermitResult<String> {
        let response = self.client.head(&self.url).send()?.error_for_status()?;
        Ok(header_etag(response.headers()))
    }

    fn validate(&self) -> HermitResult<()> {
        self.client.head(&self.url).send()?.error_for_status()?;
        Ok(())
    }
}

fn header_etag(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// `file://` — local copy, still digest-verified when a digest is pinned
pub struct FileSource {
    path: Utf8PathBuf,
}

impl PackageSource for FileSource {
    fn download(&self, dest: &Utf8Path, digests: &[String]) -> HermitResult<String> {
        if !digests.is_empty() {
            let bytes = fs::read(&self.path)?;
            let actual = hex::encode(Sha256::digest(&bytes));
            if !digests.iter().any(|d| d.eq_ignore_ascii_case(&actual)) {
                return Err(HermitError::ChecksumMismatch {
                    uri: format!("file://{}", self.path),
                    expected: digests.join(" or "),
                    actual,
                });
            }
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.path, dest)?;
        Ok(String::new())
    }

    fn etag(&self) -> HermitResult<String> {
        Ok(String::new())
    }

    fn validate(&self) -> HermitResult<()> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(HermitError::msg(format!("{} does not exist", self.path)))
        }
    }
}

/// `<repo>.git[#tag]` — shallow clone; the checked-out HEAD SHA is the "etag"
pub struct GitSource {
    repo: String,
    tag: Option<String>,
}

impl GitSource {
    fn check_repo(&self) -> HermitResult<()> {
        // argument-injection guard
        if self.repo.starts_with('-') {
            return Err(HermitError::SuspiciousGitUrl { url: self.repo.clone() });
        }
        Ok(())
    }
}

impl PackageSource for GitSource {
    fn download(&self, dest: &Utf8Path, _digests: &[String]) -> HermitResult<String> {
        self.check_repo()?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut args = vec!["clone", "--depth=1"];
        if let Some(tag) = &self.tag {
            args.push("--branch");
            args.push(tag);
        }
        args.push("--");
        args.push(&self.repo);
        args.push(dest.as_str());
        duct::cmd("git", &args).stdout_capture().stderr_capture().run().map_err(|err| {
            HermitError::Subprocess {
                command: format!("git clone {}", self.repo),
                message: err.to_string(),
            }
        })?;
        let head = duct::cmd("git", ["-C", dest.as_str(), "rev-parse", "HEAD"])
            .read()
            .map_err(|err| HermitError::Subprocess {
                command: "git rev-parse HEAD".to_string(),
                message: err.to_string(),
            })?;
        Ok(head.trim().to_string())
    }

    fn etag(&self) -> HermitResult<String> {
        self.check_repo()?;
        let reference = self.tag.as_deref().unwrap_or("HEAD");
        let output = duct::cmd("git", ["ls-remote", "--", self.repo.as_str(), reference])
            .read()
            .map_err(|err| HermitError::Subprocess {
                command: format!("git ls-remote {}", self.repo),
                message: err.to_string(),
            })?;
        Ok(output.split_whitespace().next().unwrap_or("").to_string())
    }

    fn validate(&self) -> HermitResult<()> {
        self.etag().map(|_| ())
    }
}
