//! The package manifest schema, its HCL decoder, and the resolver that turns
//! a selector plus a platform into a concrete [`crate::package::Package`].
//!
//! A manifest is one declarative file per logical package. Platform-specific
//! behavior is expressed as *layers*: the top-level fields form the base
//! layer, `platform <attrs>` blocks overlay it when the target platform
//! matches, then the selected `version`/`channel` block overlays that, then
//! any platform block nested inside the version. Later layers override
//! scalar fields and extend list fields.

use std::time::Duration;

use crate::manifest::actions::{Action, Event};
use crate::manifest::reference::Version;
use crate::SortedMap;

pub mod actions;
pub mod decode;
pub mod loader;
pub mod reference;
pub mod resolver;
pub mod selector;

/// One overridable slice of a manifest. See the module docs for how layers
/// stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layer {
    /// path globs, relative to the extracted root, naming user-visible binaries
    pub binaries: Vec<String>,
    /// macOS-style application bundle names
    pub apps: Vec<String>,
    /// packages that must be installed alongside this one
    pub requires: Vec<String>,
    /// packages required only when executing this one
    pub runtime_dependencies: Vec<String>,
    /// virtual capability names this package offers
    pub provides: Vec<String>,
    /// environment variables to apply on activation, in manifest order
    pub env: Vec<(String, String)>,
    /// expected digests keyed by source URL
    pub sha256_sums: SortedMap<String, String>,
    /// the artifact URL
    pub source: Option<String>,
    /// fallback artifact URLs
    pub mirrors: Vec<String>,
    /// expected digest of the artifact from `source`
    pub sha256: Option<String>,
    /// store the artifact as-is instead of extracting it
    pub dont_extract: Option<bool>,
    /// skip the read-only re-lock after extraction
    pub mutable: Option<bool>,
    /// strip this many leading path components from each archive entry
    pub strip: Option<usize>,
    /// a shell command used by `hermit test` to smoke-test the package
    pub test: Option<String>,
    /// explicit file copies into the environment, destination to source
    pub files: SortedMap<String, String>,
    /// actions keyed by the event that fires them
    pub triggers: SortedMap<Event, Vec<Action>>,
}

impl Layer {
    /// Overlay `other` onto `self`: scalars override, lists and maps extend.
    pub fn overlay(&mut self, other: &Layer) {
        self.binaries.extend(other.binaries.iter().cloned());
        self.apps.extend(other.apps.iter().cloned());
        self.requires.extend(other.requires.iter().cloned());
        self.runtime_dependencies.extend(other.runtime_dependencies.iter().cloned());
        self.provides.extend(other.provides.iter().cloned());
        for (key, value) in &other.env {
            // same-key entries are overridden by the later layer
            self.env.retain(|(k, _)| k != key);
            self.env.push((key.clone(), value.clone()));
        }
        self.sha256_sums.extend(other.sha256_sums.clone());
        if other.source.is_some() {
            self.source.clone_from(&other.source);
        }
        self.mirrors.extend(other.mirrors.iter().cloned());
        if other.sha256.is_some() {
            self.sha256.clone_from(&other.sha256);
        }
        if other.dont_extract.is_some() {
            self.dont_extract = other.dont_extract;
        }
        if other.mutable.is_some() {
            self.mutable = other.mutable;
        }
        if other.strip.is_some() {
            self.strip = other.strip;
        }
        if other.test.is_some() {
            self.test.clone_from(&other.test);
        }
        self.files.extend(other.files.clone());
        for (event, actions) in &other.triggers {
            self.triggers.entry(*event).or_default().extend(actions.iter().cloned());
        }
    }

    /// The result of stacking `layers` onto `self` in order
    pub fn merged<'a>(&self, layers: impl IntoIterator<Item = &'a Layer>) -> Layer {
        let mut out = self.clone();
        for layer in layers {
            out.overlay(layer);
        }
        out
    }
}

/// A `platform <attrs> { ... }` overlay
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformBlock {
    /// os/arch attributes, all of which must match the target platform
    pub attrs: Vec<String>,
    /// the fields to overlay
    pub layer: Layer,
}

/// A `version "X" ["Y"...] { ... }` block. Multiple labels share one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionBlock {
    /// the concrete versions this block declares
    pub versions: Vec<Version>,
    /// per-version field overrides
    pub layer: Layer,
    /// platform overlays nested inside this version
    pub platforms: Vec<PlatformBlock>,
}

/// A `channel "X" { ... }` block: a mutable named stream of the package
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBlock {
    /// the channel name (`stable`, `latest`, ...)
    pub name: String,
    /// how often to re-check the origin; `None` falls back to the 24h default
    pub update: Option<Duration>,
    /// a selector resolving the channel to a declared version
    pub version: Option<String>,
    /// fields for channels that resolve directly from their own source
    pub layer: Layer,
}

/// A parsed package manifest
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// one-line description of the package
    pub description: String,
    /// the base layer formed by the top-level fields
    pub layer: Layer,
    /// top-level platform overlays
    pub platforms: Vec<PlatformBlock>,
    /// declared versions
    pub versions: Vec<VersionBlock>,
    /// declared channels
    pub channels: Vec<ChannelBlock>,
}

impl Manifest {
    /// Every concrete version the manifest declares, unsorted
    pub fn all_versions(&self) -> impl Iterator<Item = &Version> {
        self.versions.iter().flat_map(|block| block.versions.iter())
    }

    /// The highest declared version, if any
    pub fn highest_version(&self) -> Option<&Version> {
        self.all_versions().max()
    }

    /// Look up the version block declaring `version`
    pub fn version_block(&self, version: &Version) -> Option<&VersionBlock> {
        self.versions.iter().find(|block| block.versions.contains(version))
    }

    /// Look up a channel by name
    pub fn channel(&self, name: &str) -> Option<&ChannelBlock> {
        self.channels.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_scalars_override_lists_extend() {
        let mut base = Layer {
            binaries: vec!["bin/go".to_string()],
            source: Some("https://example.com/base.tar.gz".to_string()),
            strip: Some(1),
            env: vec![("GOROOT".to_string(), "${root}/go".to_string())],
            ..Layer::default()
        };
        let overlay = Layer {
            binaries: vec!["bin/gofmt".to_string()],
            source: Some("https://example.com/override.tar.gz".to_string()),
            env: vec![("GOROOT".to_string(), "${root}".to_string())],
            ..Layer::default()
        };
        base.overlay(&overlay);
        assert_eq!(base.binaries, vec!["bin/go".to_string(), "bin/gofmt".to_string()]);
        assert_eq!(base.source.as_deref(), Some("https://example.com/override.tar.gz"));
        assert_eq!(base.strip, Some(1));
        assert_eq!(base.env, vec![("GOROOT".to_string(), "${root}".to_string())]);
    }
}
