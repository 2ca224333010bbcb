//! Loads and parses manifests out of the configured source set.

use camino::Utf8PathBuf;

use crate::errors::HermitResult;
use crate::manifest::decode::parse_manifest;
use crate::manifest::Manifest;
use crate::sources::Sources;
use crate::SortedSet;

/// A manifest plus where it came from
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    /// the package name (the filename minus `.hcl`)
    pub name: String,
    /// the URI of the owning source
    pub uri: String,
    /// path of the manifest file (synthetic for the built-in bundle)
    pub path: Utf8PathBuf,
    /// the parsed manifest
    pub manifest: Manifest,
}

/// Finds and parses manifests by name
#[derive(Debug, Clone)]
pub struct Loader {
    sources: Sources,
}

impl Loader {
    /// A loader over the given source set
    pub fn new(sources: Sources) -> Loader {
        Loader { sources }
    }

    /// The underlying source set
    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    /// Load the manifest for `name`, if any source carries one
    pub fn load(&self, name: &str) -> HermitResult<Option<LoadedManifest>> {
        let Some((uri, path, text)) = self.sources.load(name)? else {
            return Ok(None);
        };
        let manifest = parse_manifest(&path, &text)?;
        Ok(Some(LoadedManifest { name: name.to_string(), uri, path, manifest }))
    }

    /// Every package name available across all sources
    pub fn all_names(&self) -> HermitResult<SortedSet<String>> {
        self.sources.names()
    }
}
