//! The content-addressed artifact cache.
//!
//! Entries are keyed by `(sha256, uri)`: the cache path is
//! `<hash[0:2]>/<hash>-<basename>` where `hash = sha256(uri || sha256)`.
//! Keying on the expected digest as well as the URI lets multiple pinned
//! sources for the same URL coexist.

use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::{HermitError, HermitResult};

pub mod source;

use source::source_for;

/// Attempts per download call
const DOWNLOAD_ATTEMPTS: usize = 3;
/// Pause between attempts
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// The on-disk artifact cache
#[derive(Debug, Clone)]
pub struct Cache {
    root: Utf8PathBuf,
    client: reqwest::blocking::Client,
}

impl Cache {
    /// Open (creating if necessary) a cache rooted at `root`
    pub fn open(root: Utf8PathBuf, client: reqwest::blocking::Client) -> HermitResult<Cache> {
        fs::create_dir_all(&root)?;
        Ok(Cache { root, client })
    }

    /// The cache directory
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The stable cache path for `(sha256, uri)`
    pub fn path_for(&self, sha256: Option<&str>, uri: &str) -> Utf8PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        hasher.update(sha256.unwrap_or("").as_bytes());
        let hash = hex::encode(hasher.finalize());
        self.root.join(&hash[..2]).join(format!("{hash}-{}", basename(uri)))
    }

    /// Whether the artifact for `(sha256, uri)` is already present
    pub fn contains(&self, sha256: Option<&str>, uri: &str) -> bool {
        self.path_for(sha256, uri).exists()
    }

    /// Return the path of a local, verified copy of `uri`, downloading it
    /// first if necessary, plus the origin ETag when one was fetched.
    pub fn download(
        &self,
        digests: &[String],
        uri: &str,
        mirrors: &[String],
    ) -> HermitResult<(Utf8PathBuf, String)> {
        let sha256 = digests.first().map(|s| s.as_str());
        let dest = self.path_for(sha256, uri);
        if dest.exists() {
            debug!("cache hit for {uri} at {dest}");
            return Ok((dest, String::new()));
        }

        info!("downloading {uri}");
        let mut last_error: Option<HermitError> = None;
        for attempt in 0..DOWNLOAD_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(RETRY_DELAY);
            }
            for candidate in std::iter::once(uri).chain(mirrors.iter().map(|m| m.as_str())) {
                let result = source_for(&self.client, candidate)
                    .and_then(|source| source.download(&dest, digests));
                match result {
                    Ok(etag) => return Ok((dest, etag)),
                    Err(err @ HermitError::ChecksumMismatch { .. }) => {
                        // a bad artifact will not get better on retry
                        return Err(err);
                    }
                    Err(err) => {
                        debug!("download of {candidate} failed: {err}");
                        last_error = Some(err);
                    }
                }
            }
        }
        Err(HermitError::DownloadFailed {
            uri: uri.to_string(),
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Open a local, verified copy of `uri`
    pub fn open_local(
        &self,
        digests: &[String],
        uri: &str,
        mirrors: &[String],
    ) -> HermitResult<fs::File> {
        let (path, _) = self.download(digests, uri, mirrors)?;
        Ok(fs::File::open(path)?)
    }

    /// Probe the origin ETag for `uri` without downloading
    pub fn etag(&self, uri: &str) -> HermitResult<String> {
        source_for(&self.client, uri)?.etag()
    }

    /// Check that `uri` is reachable
    pub fn validate(&self, uri: &str) -> HermitResult<()> {
        source_for(&self.client, uri)?.validate()
    }

    /// Remove the single cache entry for `(sha256, uri)`
    pub fn evict(&self, sha256: Option<&str>, uri: &str) -> HermitResult<()> {
        let path = self.path_for(sha256, uri);
        match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)?,
            Ok(_) => fs::remove_file(&path)?,
            Err(_) => {}
        }
        Ok(())
    }

    /// Remove the whole cache tree
    pub fn clean(&self) -> HermitResult<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// The final path segment of a URI, sans query/fragment, used to keep cache
/// entries human-debuggable.
fn basename(uri: &str) -> &str {
    let uri = uri.split(['?', '#']).next().unwrap_or(uri);
    uri.rsplit('/').find(|s| !s.is_empty()).unwrap_or("artifact")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_in(dir: &Utf8Path) -> Cache {
        Cache::open(dir.join("cache"), reqwest::blocking::Client::new()).unwrap()
    }

    #[test]
    fn cache_paths_are_stable_and_digest_keyed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let cache = cache_in(dir);

        let a = cache.path_for(None, "https://example.com/foo.tar.gz");
        let b = cache.path_for(None, "https://example.com/foo.tar.gz");
        assert_eq!(a, b);
        assert!(a.as_str().ends_with("-foo.tar.gz"));

        // same URL, different pinned digest: distinct entries
        let c = cache.path_for(Some("abc123"), "https://example.com/foo.tar.gz");
        assert_ne!(a, c);
    }

    #[test]
    fn downloads_from_file_sources_and_hits_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let cache = cache_in(dir);

        let artifact = dir.join("tool.tar.gz");
        fs::write(&artifact, b"bytes").unwrap();
        let uri = format!("file://{artifact}");

        let (path, etag) = cache.download(&[], &uri, &[]).unwrap();
        assert!(path.exists());
        assert!(etag.is_empty());

        // second call is a cache hit even if the origin disappears
        fs::remove_file(&artifact).unwrap();
        let (again, _) = cache.download(&[], &uri, &[]).unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn falls_back_to_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let cache = cache_in(dir);

        let mirror = dir.join("mirror.tar.gz");
        fs::write(&mirror, b"mirrored").unwrap();

        let primary = format!("file://{}", dir.join("missing.tar.gz"));
        let (path, _) =
            cache.download(&[], &primary, &[format!("file://{mirror}")]).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"mirrored");
    }

    #[test]
    fn evict_and_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let cache = cache_in(dir);

        let artifact = dir.join("tool");
        fs::write(&artifact, b"x").unwrap();
        let uri = format!("file://{artifact}");
        let (path, _) = cache.download(&[], &uri, &[]).unwrap();

        cache.evict(None, &uri).unwrap();
        assert!(!path.exists());

        let (path, _) = cache.download(&[], &uri, &[]).unwrap();
        assert!(path.exists());
        cache.clean().unwrap();
        assert!(!path.exists());
        assert!(cache.root().exists());
    }
}
