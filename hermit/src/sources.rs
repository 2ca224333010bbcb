//! Manifest sources: the ordered set of places package manifests come from.
//!
//! A source is a filesystem of `<name>.hcl` files. Remote sources (git
//! checkouts and HTTP tarballs) are synced under `<state>/sources/`; local
//! directories are used in place; the built-in bundle ships inside the
//! binary. The built-in source is implicitly prepended and has the lowest
//! precedence: when several sources carry the same manifest, the last one
//! wins.

use std::fs;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use include_dir::{include_dir, Dir};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::archive;
use crate::errors::{HermitError, HermitResult};
use crate::SortedSet;

/// The manifest bundle compiled into the binary
static BUILTIN_MANIFESTS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/manifests");

/// The source used when an environment doesn't configure any
pub const DEFAULT_SOURCE: &str = "https://github.com/cashapp/hermit-packages.git";

/// Minimum age before a non-forced sync touches the network again
const SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One place manifests come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// the embedded bundle
    Builtin,
    /// a git repository, shallow-cloned under the state root
    Git {
        /// `<repo>.git[#ref]`
        uri: String,
    },
    /// an HTTP tarball of manifests, extracted under the state root
    Http {
        /// the tarball URL
        uri: String,
    },
    /// a local directory of manifests
    Local {
        /// the directory
        path: Utf8PathBuf,
    },
}

impl Source {
    /// Classify a configured source URI
    pub fn parse(uri: &str) -> Source {
        if uri == "builtin:" {
            Source::Builtin
        } else if let Some(path) = uri.strip_prefix("file://") {
            Source::Local { path: Utf8PathBuf::from(path) }
        } else if uri.split('#').next().unwrap_or(uri).ends_with(".git") {
            Source::Git { uri: uri.to_string() }
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            Source::Http { uri: uri.to_string() }
        } else {
            Source::Local { path: Utf8PathBuf::from(uri) }
        }
    }

    /// The URI as configured, for display
    pub fn uri(&self) -> String {
        match self {
            Source::Builtin => "builtin:".to_string(),
            Source::Git { uri } | Source::Http { uri } => uri.clone(),
            Source::Local { path } => path.to_string(),
        }
    }

    /// Where the synced tree for this source lives, `None` for sources that
    /// need no syncing. Named `<basename>-<digest>` so the tree stays
    /// human-debuggable while distinct URIs never collide.
    fn sync_dir(&self, sources_dir: &Utf8Path) -> Option<Utf8PathBuf> {
        match self {
            Source::Builtin | Source::Local { .. } => None,
            Source::Git { uri } | Source::Http { uri } => {
                let hash = hex::encode(&Sha256::digest(uri.as_bytes())[..8]);
                let name: String = uri
                    .split(['#', '?'])
                    .next()
                    .unwrap_or(uri)
                    .rsplit('/')
                    .find(|s| !s.is_empty())
                    .unwrap_or("source")
                    .trim_end_matches(".git")
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
                    .collect();
                Some(sources_dir.join(format!("{name}-{hash}")))
            }
        }
    }
}

/// The ordered source set for one environment
#[derive(Debug, Clone)]
pub struct Sources {
    dir: Utf8PathBuf,
    client: reqwest::blocking::Client,
    sources: Vec<Source>,
}

impl Sources {
    /// Build the source set: the built-in bundle, then each configured URI in
    /// order of increasing precedence.
    pub fn new(
        dir: Utf8PathBuf,
        client: reqwest::blocking::Client,
        uris: &[String],
    ) -> Sources {
        let mut sources = vec![Source::Builtin];
        sources.extend(uris.iter().map(|uri| Source::parse(uri)));
        Sources { dir, client, sources }
    }

    /// The configured sources, lowest precedence first
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Sync every remote source. A non-forced sync is rate-limited per source
    /// via a stamp file.
    pub fn sync(&self, force: bool) -> HermitResult<()> {
        for source in &self.sources {
            self.sync_source(source, force)?;
        }
        Ok(())
    }

    fn sync_source(&self, source: &Source, force: bool) -> HermitResult<()> {
        let Some(dir) = source.sync_dir(&self.dir) else {
            return Ok(());
        };
        let stamp = dir.join(".stamp");
        if !force && fresh(&stamp) {
            debug!("source {} is fresh, skipping sync", source.uri());
            return Ok(());
        }
        info!("syncing {}", source.uri());
        match source {
            Source::Git { uri } => sync_git(uri, &dir)?,
            Source::Http { uri } => self.sync_http(uri, &dir)?,
            Source::Builtin | Source::Local { .. } => unreachable!(),
        }
        fs::write(&stamp, b"")?;
        Ok(())
    }

    fn sync_http(&self, uri: &str, dir: &Utf8Path) -> HermitResult<()> {
        let response = self.client.get(uri).send()?.error_for_status()?;
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        archive::untar(flate2::read::GzDecoder::new(response), dir, 0)
    }

    /// Locate the manifest for `name`. The last source carrying it wins.
    /// Returns the owning source URI, the manifest path (synthetic for the
    /// built-in bundle), and the text.
    pub fn load(&self, name: &str) -> HermitResult<Option<(String, Utf8PathBuf, String)>> {
        let file = format!("{name}.hcl");
        let mut found = None;
        for source in &self.sources {
            match source {
                Source::Builtin => {
                    if let Some(entry) = BUILTIN_MANIFESTS.get_file(&file) {
                        let text = entry
                            .contents_utf8()
                            .ok_or_else(|| HermitError::msg("non-utf8 builtin manifest"))?;
                        found = Some((
                            source.uri(),
                            Utf8PathBuf::from(format!("builtin:{file}")),
                            text.to_string(),
                        ));
                    }
                }
                _ => {
                    let root = match source {
                        Source::Local { path } => path.clone(),
                        _ => match source.sync_dir(&self.dir) {
                            Some(dir) => dir,
                            None => continue,
                        },
                    };
                    let path = root.join(&file);
                    match fs::read_to_string(&path) {
                        Ok(text) => found = Some((source.uri(), path, text)),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(found)
    }

    /// Every manifest name available across all sources
    pub fn names(&self) -> HermitResult<SortedSet<String>> {
        let mut names = SortedSet::new();
        for entry in BUILTIN_MANIFESTS.files() {
            if let Some(name) = entry.path().to_str().and_then(|p| p.strip_suffix(".hcl")) {
                names.insert(name.to_string());
            }
        }
        for source in &self.sources {
            let root = match source {
                Source::Builtin => continue,
                Source::Local { path } => path.clone(),
                _ => match source.sync_dir(&self.dir) {
                    Some(dir) => dir,
                    None => continue,
                },
            };
            let entries = match root.read_dir_utf8() {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!("manifest source {} has not been synced", source.uri());
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                if let Some(name) = entry.file_name().strip_suffix(".hcl") {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

fn fresh(stamp: &Utf8Path) -> bool {
    let Ok(meta) = stamp.symlink_metadata() else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now().duration_since(modified).map(|age| age < SYNC_INTERVAL).unwrap_or(true)
}

fn sync_git(uri: &str, dir: &Utf8Path) -> HermitResult<()> {
    if uri.starts_with('-') {
        return Err(HermitError::SuspiciousGitUrl { url: uri.to_string() });
    }
    let (repo, reference) = match uri.split_once('#') {
        Some((repo, reference)) => (repo, Some(reference)),
        None => (uri, None),
    };
    let git = |args: Vec<&str>| {
        duct::cmd("git", &args).stdout_capture().stderr_capture().run().map_err(|err| {
            HermitError::Subprocess {
                command: format!("git {}", args.first().copied().unwrap_or("")),
                message: err.to_string(),
            }
        })
    };
    if dir.join(".git").exists() {
        git(vec!["-C", dir.as_str(), "pull", "--ff-only"])?;
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut args = vec!["clone", "--depth=1"];
    if let Some(reference) = reference {
        args.push("--branch");
        args.push(reference);
    }
    args.push("--");
    args.push(repo);
    args.push(dir.as_str());
    git(args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_uris() {
        assert!(matches!(Source::parse("builtin:"), Source::Builtin));
        assert!(matches!(
            Source::parse("https://github.com/cashapp/hermit-packages.git"),
            Source::Git { .. }
        ));
        assert!(matches!(
            Source::parse("https://example.com/packages.tar.gz"),
            Source::Http { .. }
        ));
        assert!(matches!(Source::parse("file:///tmp/packages"), Source::Local { .. }));
        assert!(matches!(Source::parse("/tmp/packages"), Source::Local { .. }));
    }

    #[test]
    fn later_sources_shadow_earlier() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let low = dir.join("low");
        let high = dir.join("high");
        fs::create_dir_all(&low).unwrap();
        fs::create_dir_all(&high).unwrap();
        fs::write(low.join("tool.hcl"), "# low").unwrap();
        fs::write(high.join("tool.hcl"), "# high").unwrap();
        fs::write(low.join("only-low.hcl"), "# low only").unwrap();

        let sources = Sources::new(
            dir.join("sources"),
            reqwest::blocking::Client::new(),
            &[low.to_string(), high.to_string()],
        );
        let (_, _, text) = sources.load("tool").unwrap().unwrap();
        assert_eq!(text, "# high");
        let (_, _, text) = sources.load("only-low").unwrap().unwrap();
        assert_eq!(text, "# low only");
        assert_eq!(sources.load("absent").unwrap(), None);

        let names = sources.names().unwrap();
        assert!(names.contains("tool"));
        assert!(names.contains("only-low"));
        // the embedded bundle is always present
        assert!(names.contains("hermit"));
    }
}
