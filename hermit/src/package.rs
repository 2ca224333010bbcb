//! A fully-resolved, platform-specialized package instance.
//!
//! A [`Package`] is a *view*: it is recreated on every resolve. Mutable state
//! associated with it (ETag, last update check) lives in the persistent DB
//! keyed by `reference.string()`.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};

use crate::envars::Op;
use crate::errors::{HermitError, HermitResult};
use crate::manifest::actions::{Action, ActionContext, Event};
use crate::manifest::reference::Reference;
use crate::platform::Platform;
use crate::SortedMap;

/// How much of a package is materialized locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PackageState {
    /// known only from its manifest
    Remote,
    /// the artifact is in the cache
    Downloaded,
    /// extracted into the package store
    Installed,
}

/// A fully-resolved package
#[derive(Debug, Clone)]
pub struct Package {
    /// the concrete reference this package resolves
    pub reference: Reference,
    /// one-line description from the manifest
    pub description: String,
    /// the artifact URL, fully substituted
    pub source: String,
    /// fallback artifact URLs
    pub mirrors: Vec<String>,
    /// expected digest of the artifact, if pinned
    pub sha256: Option<String>,
    /// expected digests keyed by source URL, for mirrors
    pub sha256_sums: SortedMap<String, String>,
    /// where the package extracts in the package store
    pub root: Utf8PathBuf,
    /// where the package is currently extracted; differs from `root` only
    /// when the tree is overlayed
    pub dest: Utf8PathBuf,
    /// binary globs relative to the extracted root
    pub binaries: Vec<String>,
    /// macOS app bundle names
    pub apps: Vec<String>,
    /// install-time dependencies
    pub requires: Vec<String>,
    /// execution-time dependencies
    pub runtime_deps: Vec<String>,
    /// virtual capabilities this package offers
    pub provides: Vec<String>,
    /// envar operations applied on activation, in manifest order
    pub env_ops: Vec<Op>,
    /// explicit file copies into the environment, destination to source
    pub files: SortedMap<String, String>,
    /// trigger actions keyed by event
    pub triggers: SortedMap<Event, Vec<Action>>,
    /// channel re-check cadence; `None` for versioned references
    pub update_interval: Option<Duration>,
    /// when the package was last installed or updated
    pub updated_at: Option<DateTime<Utc>>,
    /// last ETag seen from the origin
    pub etag: String,
    /// store the artifact as-is instead of extracting
    pub dont_extract: bool,
    /// leave the extracted tree writable
    pub mutable: bool,
    /// leading path components stripped from each archive entry
    pub strip: usize,
    /// smoke-test command for `hermit test`
    pub test: Option<String>,
    /// non-fatal issues found while resolving
    pub warnings: Vec<String>,
    /// core platforms this package failed to resolve a source for
    pub unsupported_platforms: Vec<Platform>,
    /// local materialization state
    pub state: PackageState,
    /// whether the package's binaries are linked in the package store
    pub linked: bool,
}

impl Package {
    /// Error unless this package can be materialized on `platform`
    pub fn ensure_supported(&self, platform: Platform) -> HermitResult<()> {
        if self.source.is_empty() {
            return Err(HermitError::NoSource {
                reference: self.reference.string(),
                platform: platform.to_string(),
            });
        }
        if self.unsupported_platforms.contains(&platform) {
            return Err(HermitError::UnsupportedPlatform {
                reference: self.reference.string(),
                platform: platform.to_string(),
            });
        }
        Ok(())
    }

    /// The digests the downloaded artifact may legitimately hash to: the
    /// pinned `sha256` plus any `sha256-sums` entry for the URL.
    pub fn expected_digests(&self, uri: &str) -> Vec<String> {
        let mut digests = Vec::new();
        if let Some(sha256) = &self.sha256 {
            digests.push(sha256.clone());
        }
        if let Some(digest) = self.sha256_sums.get(uri) {
            if !digests.contains(digest) {
                digests.push(digest.clone());
            }
        }
        digests
    }

    /// Resolve the package's binary globs against the extracted tree,
    /// returning absolute paths. Every glob must match at least one file.
    pub fn resolve_binaries(&self) -> HermitResult<Vec<Utf8PathBuf>> {
        let mut out = Vec::new();
        for pattern in &self.binaries {
            let absolute = self.dest.join(pattern);
            let matches = glob::glob(absolute.as_str())
                .map_err(|err| HermitError::msg(format!("bad binary glob {pattern:?}: {err}")))?;
            let mut matched = false;
            for path in matches {
                let path = path
                    .map_err(|err| HermitError::msg(format!("glob {pattern:?}: {err}")))?;
                out.push(Utf8PathBuf::try_from(path)?);
                matched = true;
            }
            if !matched {
                return Err(HermitError::msg(format!(
                    "{}: no files matched binary glob {pattern:?} under {}",
                    self.reference, self.dest
                )));
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Run the actions attached to `event`, in manifest order, in the
    /// extracted tree's context. Returns any `message` action output.
    pub fn trigger(&self, event: Event) -> HermitResult<Vec<String>> {
        self.trigger_in(event, &self.dest)
    }

    /// As [`Package::trigger`], with an explicit base directory
    pub fn trigger_in(&self, event: Event, root: &Utf8Path) -> HermitResult<Vec<String>> {
        let Some(actions) = self.triggers.get(&event) else {
            return Ok(Vec::new());
        };
        let mut messages = Vec::new();
        // strings were fully substituted at resolve time; leftovers pass through
        let expand = |s: &str| s.to_string();
        for action in actions {
            let mut ctx = ActionContext { root, expand: &expand, messages: &mut messages };
            action.execute(&mut ctx).map_err(|err| HermitError::TriggerFailed {
                event: event.to_string(),
                reference: self.reference.string(),
                message: err.to_string(),
            })?;
        }
        Ok(messages)
    }
}
