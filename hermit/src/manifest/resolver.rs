//! Reduces a selector plus a target platform to a concrete
//! [`Package`] by layering manifest blocks and substituting template
//! variables.

use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{Datelike, Utc};
use itertools::Itertools;
use tracing::debug;

use crate::envars;
use crate::errors::{HermitError, HermitResult};
use crate::manifest::loader::{LoadedManifest, Loader};
use crate::manifest::reference::{Reference, Version};
use crate::manifest::selector::Selector;
use crate::manifest::{Layer, Manifest};
use crate::package::{Package, PackageState};
use crate::platform::{Platform, CORE_PLATFORMS};
use crate::vars;
use crate::SortedMap;

/// Default channel re-check cadence when a manifest doesn't set one
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolves selectors against the loaded manifest catalog
#[derive(Debug, Clone)]
pub struct Resolver {
    loader: Loader,
    platform: Platform,
    /// where packages extract: `<state>/pkg`
    pkg_root: Utf8PathBuf,
    /// the environment root, when resolving inside an environment
    env_root: Option<Utf8PathBuf>,
}

impl Resolver {
    /// A resolver for `platform`, extracting under `pkg_root`
    pub fn new(
        loader: Loader,
        platform: Platform,
        pkg_root: Utf8PathBuf,
        env_root: Option<Utf8PathBuf>,
    ) -> Resolver {
        Resolver { loader, platform, pkg_root, env_root }
    }

    /// The manifest loader
    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// The platform being resolved for
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// A copy of this resolver targeting a different platform, used by
    /// cross-platform manifest validation.
    pub fn for_platform(&self, platform: Platform) -> Resolver {
        Resolver { platform, ..self.clone() }
    }

    /// Resolve a selector to exactly one package.
    ///
    /// A bare name with no manifest of its own is resolved virtually: if
    /// exactly one package `provides` the name it wins, several yield
    /// [`HermitError::MultipleProviders`].
    pub fn resolve(&self, selector: &Selector) -> HermitResult<Package> {
        if let Selector::Glob { .. } = selector {
            let mut packages = self.resolve_each(selector)?;
            return match packages.len() {
                1 => Ok(packages.remove(0)),
                _ => Err(HermitError::msg(format!(
                    "{selector} matches {} packages; narrow the pattern",
                    packages.len()
                ))),
            };
        }

        let Some(loaded) = self.loader.load(selector.name())? else {
            if let Selector::Name(name) = selector {
                let mut providers = self.resolve_virtual(name)?;
                return match providers.len() {
                    0 => Err(HermitError::UnknownPackage { selector: selector.to_string() }),
                    1 => Ok(providers.remove(0)),
                    _ => Err(HermitError::MultipleProviders {
                        virtual_name: name.clone(),
                        providers: providers
                            .iter()
                            .map(|p| p.reference.name.clone())
                            .sorted()
                            .collect(),
                    }),
                };
            }
            return Err(HermitError::UnknownPackage { selector: selector.to_string() });
        };

        let reference = self.candidate(&loaded, selector)?;
        self.materialize(&loaded, &reference)
    }

    /// Resolve a selector to every matching package: one per matching name
    /// for globs, one otherwise.
    pub fn resolve_each(&self, selector: &Selector) -> HermitResult<Vec<Package>> {
        match selector {
            Selector::Glob { pattern, .. } => {
                let mut packages = Vec::new();
                for name in self.loader.all_names()? {
                    if pattern.matches(&name) {
                        packages.push(self.resolve(&Selector::Name(name))?);
                    }
                }
                if packages.is_empty() {
                    return Err(HermitError::UnknownPackage { selector: selector.to_string() });
                }
                Ok(packages)
            }
            _ => Ok(vec![self.resolve(selector)?]),
        }
    }

    /// Every package whose `provides` list contains `name`
    pub fn resolve_virtual(&self, name: &str) -> HermitResult<Vec<Package>> {
        let mut providers = Vec::new();
        for candidate in self.loader.all_names()? {
            let Some(loaded) = self.loader.load(&candidate)? else {
                continue;
            };
            if !loaded.manifest.layer.provides.iter().any(|p| p == name) {
                continue;
            }
            let selector = Selector::Name(candidate);
            let reference = self.candidate(&loaded, &selector)?;
            providers.push(self.materialize(&loaded, &reference)?);
        }
        Ok(providers)
    }

    /// Every reference (all versions, all channels) of every package whose
    /// name matches `pattern`. References without a source on this platform
    /// are skipped.
    pub fn search(&self, pattern: &regex::Regex) -> HermitResult<Vec<Package>> {
        let mut packages = Vec::new();
        for name in self.loader.all_names()? {
            if !pattern.is_match(&name) {
                continue;
            }
            let Some(loaded) = self.loader.load(&name)? else {
                continue;
            };
            let mut references: Vec<Reference> = loaded
                .manifest
                .all_versions()
                .sorted()
                .map(|v| Reference::versioned(name.as_str(), v.clone()))
                .collect();
            references.extend(
                loaded.manifest.channels.iter().map(|c| Reference::channeled(name.as_str(), c.name.as_str())),
            );
            for reference in references {
                match self.materialize(&loaded, &reference) {
                    Ok(package) => packages.push(package),
                    Err(HermitError::NoSource { .. }) => {
                        debug!("{reference} has no source on {}", self.platform);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(packages)
    }

    /// Pick the concrete reference a selector denotes within a manifest
    fn candidate(&self, loaded: &LoadedManifest, selector: &Selector) -> HermitResult<Reference> {
        let manifest = &loaded.manifest;
        let unknown = || HermitError::UnknownPackage { selector: selector.to_string() };
        match selector {
            Selector::Exact(reference) => {
                if let Some(channel) = &reference.channel {
                    manifest.channel(channel).ok_or_else(unknown)?;
                    return Ok(reference.clone());
                }
                let version = reference.version.as_ref().ok_or_else(unknown)?;
                if manifest.all_versions().any(|v| v == version) {
                    Ok(reference.clone())
                } else {
                    Err(unknown())
                }
            }
            Selector::Prefix(prefix) => {
                let version = manifest
                    .all_versions()
                    .filter(|v| {
                        prefix
                            .version
                            .as_ref()
                            .map(|p| p.is_prefix_of(v))
                            .unwrap_or(true)
                    })
                    .max()
                    .ok_or_else(unknown)?;
                Ok(Reference::versioned(loaded.name.as_str(), version.clone()))
            }
            Selector::Name(_) => {
                if let Some(version) = manifest.highest_version() {
                    return Ok(Reference::versioned(loaded.name.as_str(), version.clone()));
                }
                // no versions at all: fall back to a well-known channel
                let channel = manifest
                    .channel("stable")
                    .or_else(|| manifest.channel("latest"))
                    .or_else(|| manifest.channels.first())
                    .ok_or_else(unknown)?;
                Ok(Reference::channeled(loaded.name.as_str(), channel.name.as_str()))
            }
            Selector::Glob { .. } => Err(unknown()),
        }
    }

    /// Compute the merged layer for `reference` on `platform`. Returns the
    /// layer, the underlying concrete version (if any), and the channel
    /// update interval (if the reference is a channel).
    fn merged_layer(
        &self,
        manifest: &Manifest,
        reference: &Reference,
        platform: Platform,
    ) -> HermitResult<(Layer, Option<Version>, Option<Duration>)> {
        let mut layer = manifest.layer.clone();
        for block in &manifest.platforms {
            if platform.matches_attrs(&block.attrs) {
                layer.overlay(&block.layer);
            }
        }

        let overlay_version = |layer: &mut Layer, version: &Version| -> HermitResult<()> {
            let block = manifest.version_block(version).ok_or_else(|| {
                HermitError::UnknownPackage { selector: format!("{}-{version}", reference.name) }
            })?;
            layer.overlay(&block.layer);
            for platform_block in &block.platforms {
                if platform.matches_attrs(&platform_block.attrs) {
                    layer.overlay(&platform_block.layer);
                }
            }
            Ok(())
        };

        let mut resolved_version = None;
        let mut update_interval = None;
        match (&reference.version, &reference.channel) {
            (Some(version), _) => {
                overlay_version(&mut layer, version)?;
                resolved_version = Some(version.clone());
            }
            (None, Some(channel)) => {
                let block = manifest.channel(channel).ok_or_else(|| {
                    HermitError::UnknownPackage { selector: reference.string() }
                })?;
                if let Some(selector) = &block.version {
                    let selector: Selector = selector.parse()?;
                    let version = manifest
                        .all_versions()
                        .filter(|v| {
                            selector.matches(&Reference::versioned(reference.name.as_str(), (*v).clone()))
                        })
                        .max()
                        .ok_or_else(|| HermitError::UnknownPackage {
                            selector: format!("{}@{channel} -> {selector}", reference.name),
                        })?;
                    overlay_version(&mut layer, &version.clone())?;
                    resolved_version = Some(version.clone());
                }
                layer.overlay(&block.layer);
                update_interval = Some(block.update.unwrap_or(DEFAULT_UPDATE_INTERVAL));
            }
            (None, None) => {
                return Err(HermitError::InvalidReference { value: reference.string() })
            }
        }
        Ok((layer, resolved_version, update_interval))
    }

    /// Materialize a package instance for `(manifest, reference)` on this
    /// resolver's platform.
    pub fn materialize(
        &self,
        loaded: &LoadedManifest,
        reference: &Reference,
    ) -> HermitResult<Package> {
        let (layer, resolved_version, update_interval) =
            self.merged_layer(&loaded.manifest, reference, self.platform)?;

        let root = self.pkg_root.join(reference.string());
        let dest = root.clone();
        let variables = self.variables(reference, resolved_version.as_ref(), &root, &dest);
        let expand = |s: &str| vars::expand(s, |name| variables.get(name).cloned());

        let source = layer.source.as_deref().map(expand).unwrap_or_default();
        if source.is_empty() {
            return Err(HermitError::NoSource {
                reference: reference.string(),
                platform: self.platform.to_string(),
            });
        }

        // which core platforms would fail to resolve a source
        let mut warnings = Vec::new();
        let mut unsupported = Vec::new();
        for core in CORE_PLATFORMS {
            let (core_layer, _, _) = self.merged_layer(&loaded.manifest, reference, core)?;
            if core_layer.source.is_none() {
                warnings.push(format!("{reference} has no source for {core}"));
                unsupported.push(core);
            }
        }

        let sha256_sums: SortedMap<String, String> =
            layer.sha256_sums.iter().map(|(k, v)| (expand(k), v.clone())).collect();
        let sha256 = layer.sha256.clone().or_else(|| sha256_sums.get(&source).cloned());

        let env_pairs: Vec<(String, String)> =
            layer.env.iter().map(|(k, v)| (k.clone(), expand(v))).collect();
        let env_ops =
            envars::infer(env_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let triggers = layer
            .triggers
            .iter()
            .map(|(event, actions)| {
                (*event, actions.iter().map(|a| a.expanded(&expand)).collect())
            })
            .collect();

        Ok(Package {
            reference: reference.clone(),
            description: loaded.manifest.description.clone(),
            source,
            mirrors: layer.mirrors.iter().map(|m| expand(m)).collect(),
            sha256,
            sha256_sums,
            root,
            dest,
            binaries: layer.binaries.iter().map(|b| expand(b)).collect(),
            apps: layer.apps.iter().map(|a| expand(a)).collect(),
            requires: layer.requires.clone(),
            runtime_deps: layer.runtime_dependencies.clone(),
            provides: layer.provides.clone(),
            env_ops,
            files: layer.files.iter().map(|(k, v)| (expand(k), expand(v))).collect(),
            triggers,
            update_interval,
            updated_at: None,
            etag: String::new(),
            dont_extract: layer.dont_extract.unwrap_or(false),
            mutable: layer.mutable.unwrap_or(false),
            strip: layer.strip.unwrap_or(0),
            test: layer.test.as_deref().map(expand),
            warnings,
            unsupported_platforms: unsupported,
            state: PackageState::Remote,
            linked: false,
        })
    }

    /// The template variables available to manifest strings
    fn variables(
        &self,
        reference: &Reference,
        version: Option<&Version>,
        root: &Utf8PathBuf,
        dest: &Utf8PathBuf,
    ) -> SortedMap<String, String> {
        let mut variables = SortedMap::new();
        variables.insert("name".to_string(), reference.name.clone());
        if let Some(version) = version {
            variables.insert("version".to_string(), version.to_string());
        }
        variables.insert("root".to_string(), root.to_string());
        variables.insert("dest".to_string(), dest.to_string());
        variables.insert("os".to_string(), self.platform.os.to_string());
        variables.insert("arch".to_string(), self.platform.arch.to_string());
        variables.insert("xarch".to_string(), self.platform.arch.xarch().to_string());
        if let Ok(home) = std::env::var("HOME") {
            variables.insert("HOME".to_string(), home);
        }
        if let Some(env_root) = &self.env_root {
            variables.insert("env".to_string(), env_root.to_string());
            variables.insert("HERMIT_ENV".to_string(), env_root.to_string());
            variables.insert("HERMIT_BIN".to_string(), env_root.join("bin").to_string());
        }
        let now = Utc::now();
        variables.insert("YYYY".to_string(), format!("{:04}", now.year()));
        variables.insert("MM".to_string(), format!("{:02}", now.month()));
        variables.insert("DD".to_string(), format!("{:02}", now.day()));
        variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};
    use crate::sources::Sources;
    use std::fs;

    fn resolver_for(dir: &camino::Utf8Path, manifests: &[(&str, &str)]) -> Resolver {
        let source_dir = dir.join("manifests");
        fs::create_dir_all(&source_dir).unwrap();
        for (name, text) in manifests {
            fs::write(source_dir.join(format!("{name}.hcl")), text).unwrap();
        }
        let sources = Sources::new(
            dir.join("sources"),
            reqwest::blocking::Client::new(),
            &[source_dir.to_string()],
        );
        Resolver::new(
            Loader::new(sources),
            Platform::new(Os::Linux, Arch::Amd64),
            dir.join("pkg"),
            Some(dir.join("project")),
        )
    }

    const TOOL: &str = r#"
description = "a tool"
binaries = ["bin/tool"]
source = "https://example.com/tool-${version}-${os}-${arch}.tar.gz"
env = {
  "TOOL_ROOT": "${root}"
}

version "1.0.0" {}
version "1.1.0" "1.1.1" {
  sha256 = "cafebabe"
}

channel "stable" {
  update = "1h"
  version = "1.1"
}
"#;

    #[test]
    fn resolves_name_to_highest_version() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let resolver = resolver_for(dir, &[("tool", TOOL)]);

        let package = resolver.resolve(&"tool".parse().unwrap()).unwrap();
        assert_eq!(package.reference.to_string(), "tool-1.1.1");
        assert_eq!(
            package.source,
            "https://example.com/tool-1.1.1-linux-amd64.tar.gz"
        );
        assert_eq!(package.sha256.as_deref(), Some("cafebabe"));
        // ${root} expanded into the env op
        let envars::Op::Set { name, value } = &package.env_ops[0] else {
            panic!("expected set op");
        };
        assert_eq!(name, "TOOL_ROOT");
        assert_eq!(value, &package.root.to_string());
    }

    #[test]
    fn resolves_prefix_and_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let resolver = resolver_for(dir, &[("tool", TOOL)]);

        let package = resolver.resolve(&"tool-1.0".parse().unwrap()).unwrap();
        assert_eq!(package.reference.to_string(), "tool-1.0.0");
        assert_eq!(package.sha256, None);

        let package = resolver.resolve(&"tool-1.1".parse().unwrap()).unwrap();
        assert_eq!(package.reference.to_string(), "tool-1.1.1");

        let err = resolver.resolve(&"tool-9".parse().unwrap()).unwrap_err();
        assert!(matches!(err, HermitError::UnknownPackage { .. }));
    }

    #[test]
    fn resolves_channels_through_version_selectors() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let resolver = resolver_for(dir, &[("tool", TOOL)]);

        let package = resolver.resolve(&"tool@stable".parse().unwrap()).unwrap();
        assert_eq!(package.reference.to_string(), "tool@stable");
        // the channel's version selector picks 1.1.1; ${version} follows it
        assert_eq!(
            package.source,
            "https://example.com/tool-1.1.1-linux-amd64.tar.gz"
        );
        assert_eq!(package.update_interval, Some(Duration::from_secs(3600)));
        // the extraction root is keyed by the channel, not the version
        assert!(package.root.as_str().ends_with("tool@stable"));
    }

    #[test]
    fn platform_blocks_overlay() {
        const PLATFORMED: &str = r#"
description = "platformed"
binaries = ["tool"]
version "1.0.0" {}
source = "https://example.com/default.tar.gz"
platform darwin arm64 {
  source = "https://example.com/darwin-arm64.tar.gz"
}
"#;
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let resolver = resolver_for(dir, &[("tool", PLATFORMED)]);

        let package = resolver.resolve(&"tool".parse().unwrap()).unwrap();
        assert_eq!(package.source, "https://example.com/default.tar.gz");

        let darwin = resolver.for_platform(Platform::new(Os::Darwin, Arch::Arm64));
        let package = darwin.resolve(&"tool".parse().unwrap()).unwrap();
        assert_eq!(package.source, "https://example.com/darwin-arm64.tar.gz");
    }

    #[test]
    fn missing_source_is_no_source() {
        const DARWIN_ONLY: &str = r#"
description = "darwin only"
binaries = ["tool"]
version "1.0.0" {}
platform darwin {
  source = "https://example.com/darwin.tar.gz"
}
"#;
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let resolver = resolver_for(dir, &[("tool", DARWIN_ONLY)]);

        let err = resolver.resolve(&"tool".parse().unwrap()).unwrap_err();
        assert!(matches!(err, HermitError::NoSource { .. }));

        let darwin = resolver.for_platform(Platform::new(Os::Darwin, Arch::Arm64));
        let package = darwin.resolve(&"tool".parse().unwrap()).unwrap();
        assert_eq!(package.unsupported_platforms.len(), 2);
        assert!(!package.warnings.is_empty());
    }

    #[test]
    fn virtual_names_resolve_through_providers() {
        const JDK_A: &str = r#"
description = "jdk a"
binaries = ["bin/java"]
provides = ["jdk"]
source = "https://example.com/a-${version}.tar.gz"
version "11.0.1" {}
"#;
        const JDK_B: &str = r#"
description = "jdk b"
binaries = ["bin/java"]
provides = ["jdk"]
source = "https://example.com/b-${version}.tar.gz"
version "17.0.1" {}
"#;
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let resolver = resolver_for(dir, &[("jdk-a", JDK_A), ("jdk-b", JDK_B)]);

        let err = resolver.resolve(&Selector::Name("jdk".to_string())).unwrap_err();
        let HermitError::MultipleProviders { virtual_name, providers } = err else {
            panic!("expected MultipleProviders");
        };
        assert_eq!(virtual_name, "jdk");
        assert_eq!(providers, vec!["jdk-a".to_string(), "jdk-b".to_string()]);
    }

    #[test]
    fn search_returns_all_references() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap();
        let resolver = resolver_for(dir, &[("tool", TOOL)]);

        let pattern = regex::Regex::new("^to").unwrap();
        let packages = resolver.search(&pattern).unwrap();
        let refs: Vec<String> =
            packages.iter().map(|p| p.reference.to_string()).collect();
        assert_eq!(refs, vec!["tool-1.0.0", "tool-1.1.0", "tool-1.1.1", "tool@stable"]);
    }
}
