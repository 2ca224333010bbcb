//! Per-project environments: a `bin/` directory of proxy symlinks, a config
//! file, and the operations over them.
//!
//! The proxy link chain routes every tool through hermit:
//!
//! ```text
//! <envDir>/bin/hermit             the proxy script
//! <envDir>/bin/activate-hermit    shell activation script
//! <envDir>/bin/hermit.hcl         per-environment config
//! <envDir>/bin/.<ref>.pkg         hidden marker symlink -> "hermit"
//! <envDir>/bin/<binary>           user-visible symlink -> ".<ref>.pkg"
//! ```

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;

use camino::{Utf8Path, Utf8PathBuf};
use include_dir::{include_dir, Dir};
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::EnvConfig;
use crate::envars::{self, Envars, Op, Transform};
use crate::errors::{HermitError, HermitResult};
use crate::manifest::actions::Event;
use crate::manifest::loader::Loader;
use crate::manifest::reference::Reference;
use crate::manifest::resolver::Resolver;
use crate::manifest::selector::Selector;
use crate::package::Package;
use crate::platform::{Platform, CORE_PLATFORMS};
use crate::sources::{Sources, DEFAULT_SOURCE};
use crate::state::State;
use crate::vars;
use crate::SortedMap;

/// Script templates written into `bin/` on init
static TEMPLATES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/templates");

/// Where the proxy script points users when hermit itself is missing
pub const DEFAULT_DIST_URL: &str = "https://github.com/cashapp/hermit/releases/download/stable";

/// Environment mutations accumulated by install/uninstall/upgrade, for the
/// caller (usually the shell hook) to apply.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    /// ops newly in effect
    pub add: Vec<Op>,
    /// ops to revert
    pub remove: Vec<Op>,
    /// messages queued by triggers, for display
    pub messages: Vec<String>,
}

impl Changes {
    /// Fold `other` into `self`
    pub fn merge(&mut self, other: Changes) {
        self.add.extend(other.add);
        self.remove.extend(other.remove);
        self.messages.extend(other.messages);
    }
}

/// A per-project hermit environment
#[derive(Debug)]
pub struct Environment {
    root: Utf8PathBuf,
    bin_dir: Utf8PathBuf,
    config: EnvConfig,
    state: State,
    resolver: Resolver,
    platform: Platform,
}

impl Environment {
    /// Create a new environment in `dir`: write the proxy script, the
    /// activation script, and a default `bin/hermit.hcl`.
    pub fn init(dir: &Utf8Path, config: &EnvConfig, dist_url: Option<&str>) -> HermitResult<()> {
        let bin_dir = dir.join("bin");
        fs::create_dir_all(&bin_dir)?;

        let dist_url = dist_url.unwrap_or(DEFAULT_DIST_URL);
        let mut written = Vec::new();
        for name in ["hermit", "activate-hermit"] {
            let template = TEMPLATES
                .get_file(name)
                .and_then(|f| f.contents_utf8())
                .ok_or_else(|| HermitError::msg(format!("missing template {name}")))?;
            let rendered = vars::expand(template, |var| match var {
                "HERMIT_DEFAULT_DIST_URL" => Some(dist_url.to_string()),
                _ => None,
            });
            let path = bin_dir.join(name);
            fs::write(&path, rendered)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
            written.push(path);
        }

        let config_path = bin_dir.join("hermit.hcl");
        if !config_path.exists() {
            config.save(&config_path)?;
        }
        written.push(config_path);

        if config.manage_git {
            git_add(dir, &written);
        }
        info!("initialized hermit environment in {dir}");
        Ok(())
    }

    /// Open the environment rooted at `dir`. Reads `bin/hermit.hcl` and
    /// resolves the symlink-free path; does not touch the filesystem
    /// otherwise.
    pub fn open(state: State, dir: &Utf8Path) -> HermitResult<Environment> {
        let root = Utf8PathBuf::try_from(
            fs::canonicalize(dir).map_err(|_| HermitError::NotAnEnvironment {
                dir: dir.to_owned(),
            })?,
        )?;
        let bin_dir = root.join("bin");
        if !bin_dir.join("hermit.hcl").exists() && !bin_dir.join("hermit").exists() {
            return Err(HermitError::NotAnEnvironment { dir: root });
        }
        let config = EnvConfig::load(&bin_dir.join("hermit.hcl"))?;

        let uris = config
            .sources
            .clone()
            .unwrap_or_else(|| vec![DEFAULT_SOURCE.to_string()]);
        let sources = Sources::new(state.sources_dir(), state.client().clone(), &uris);
        let platform = Platform::host();
        let resolver = Resolver::new(
            Loader::new(sources),
            platform,
            state.pkg_dir(),
            Some(root.clone()),
        );
        Ok(Environment { root, bin_dir, config, state, resolver, platform })
    }

    /// The environment root directory
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The environment's `bin/` directory
    pub fn bin_dir(&self) -> &Utf8Path {
        &self.bin_dir
    }

    /// The environment's configuration
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// The global state backing this environment
    pub fn state(&self) -> &State {
        &self.state
    }

    /// The environment's resolver
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolve a selector and annotate the result with local state
    pub fn resolve(&self, selector: &Selector) -> HermitResult<Package> {
        let mut package = self.resolver.resolve(selector)?;
        self.state.annotate(&mut package)?;
        Ok(package)
    }

    /// Resolve a selector to every matching package (globs may match many)
    pub fn resolve_each(&self, selector: &Selector) -> HermitResult<Vec<Package>> {
        let mut packages = self.resolver.resolve_each(selector)?;
        for package in &mut packages {
            self.state.annotate(package)?;
        }
        Ok(packages)
    }

    /// Sync the environment's manifest sources
    pub fn sync(&self, force: bool) -> HermitResult<()> {
        self.resolver.loader().sources().sync(force)
    }

    /// References installed into this environment, from the hidden marker
    /// links.
    pub fn installed_refs(&self) -> HermitResult<Vec<Reference>> {
        let mut refs = Vec::new();
        let entries = match self.bin_dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(reference) =
                name.strip_prefix('.').and_then(|n| n.strip_suffix(".pkg"))
            {
                refs.push(reference.parse()?);
            }
        }
        refs.sort_by_key(|r: &Reference| r.string());
        Ok(refs)
    }

    /// Resolve every installed reference to a package
    pub fn installed_packages(&self) -> HermitResult<Vec<Package>> {
        self.installed_refs()?
            .into_iter()
            .map(|reference| self.resolve(&Selector::exact(reference)))
            .collect()
    }

    /// Install a package into the environment.
    ///
    /// An already-installed package of the same name at a different reference
    /// is uninstalled first and the resulting changes merged.
    pub fn install(&self, package: &mut Package) -> HermitResult<Changes> {
        let mut changes = Changes::default();

        for installed in self.installed_refs()? {
            if installed.name == package.reference.name {
                if installed == package.reference {
                    debug!("{installed} is already installed");
                } else {
                    let old = self.resolve(&Selector::exact(installed))?;
                    changes.merge(self.uninstall(&old)?);
                }
            }
        }

        package.ensure_supported(self.platform)?;
        if !package.unsupported_platforms.is_empty() {
            changes.messages.extend(package.warnings.iter().cloned());
        }

        // runtime dependencies must be materialized before the package works
        let deps = self.resolve_runtime_deps(package)?;
        let mut dep_binaries: SortedMap<String, Reference> = SortedMap::new();
        for mut dep in deps {
            self.state.cache_and_unpack(&mut dep)?;
            for binary in dep.resolve_binaries()? {
                let name = binary.file_name().unwrap_or_default().to_string();
                if let Some(owner) = dep_binaries.get(&name) {
                    if *owner != dep.reference {
                        return Err(HermitError::BinaryConflict {
                            binary: name,
                            wanted: dep.reference.string(),
                            owner: owner.string(),
                        });
                    }
                } else {
                    dep_binaries.insert(name, dep.reference.clone());
                }
            }
        }

        changes.messages.extend(self.state.cache_and_unpack(package)?);
        self.link_package(package)?;
        self.copy_package_files(package)?;

        self.state.db().set(
            &package.reference.string(),
            crate::db::DbEntry {
                etag: package.etag.clone(),
                update_checked_at: Some(chrono::Utc::now()),
            },
        )?;
        changes.messages.extend(self.run_trigger(package, Event::Install)?);
        changes.add.extend(package.env_ops.iter().cloned());
        info!("installed {}", package.reference);
        Ok(changes)
    }

    /// Create the proxy link chain for every binary (and app bundle) of the
    /// package.
    fn link_package(&self, package: &Package) -> HermitResult<()> {
        let marker = format!(".{}.pkg", package.reference);
        let marker_path = self.bin_dir.join(&marker);
        let mut created = vec![marker_path.clone()];

        let mut names: Vec<String> = package
            .resolve_binaries()?
            .iter()
            .filter_map(|b| b.file_name().map(|n| n.to_string()))
            .collect();
        names.extend(package.apps.iter().map(|app| app.trim_end_matches(".app").to_string()));

        // refuse before creating anything if a binary belongs to another package
        for name in &names {
            let link = self.bin_dir.join(name);
            match fs::read_link(&link) {
                Ok(target) if target.to_str() == Some(marker.as_str()) => {}
                Ok(target) => {
                    let owner = target
                        .to_str()
                        .and_then(|t| t.strip_prefix('.'))
                        .and_then(|t| t.strip_suffix(".pkg"))
                        .unwrap_or("unknown")
                        .to_string();
                    return Err(HermitError::BinaryConflict {
                        binary: name.clone(),
                        wanted: package.reference.string(),
                        owner,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        if fs::read_link(&marker_path).is_err() {
            std::os::unix::fs::symlink("hermit", &marker_path)?;
        }
        for name in &names {
            let link = self.bin_dir.join(name);
            if fs::read_link(&link).is_ok() {
                continue;
            }
            debug!("linking {link} -> {marker}");
            std::os::unix::fs::symlink(&marker, &link)?;
            created.push(link);
        }

        if self.config.manage_git {
            git_add(&self.root, &created);
        }
        Ok(())
    }

    /// Run a trigger with the extracted tree temporarily writable. The
    /// read-only lock is re-applied afterwards regardless of the outcome.
    fn run_trigger(&self, package: &Package, event: Event) -> HermitResult<Vec<String>> {
        let locked = !package.mutable && package.dest.exists();
        if locked {
            archive::unlock_tree(&package.dest)?;
        }
        let result = package.trigger(event);
        if locked {
            archive::lock_tree(&package.dest)?;
        }
        result
    }

    /// Copy the package's declared `files` into the environment
    fn copy_package_files(&self, package: &Package) -> HermitResult<()> {
        for (to, from) in &package.files {
            let src = package.dest.join(from);
            let dst = self.root.join(to);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dst)?;
        }
        Ok(())
    }

    /// Uninstall a package: remove its marker and every user-visible link
    /// that resolves to it. The package store entry is left for other
    /// environments; the env op inverse lands in `Changes::remove`.
    pub fn uninstall(&self, package: &Package) -> HermitResult<Changes> {
        let mut changes = Changes::default();
        changes.messages.extend(self.run_trigger(package, Event::Uninstall)?);

        let marker = format!(".{}.pkg", package.reference);
        for entry in self.bin_dir.read_dir_utf8()? {
            let entry = entry?;
            let path = entry.path();
            let Ok(target) = fs::read_link(path) else {
                continue;
            };
            if target.to_str() == Some(marker.as_str()) {
                fs::remove_file(path)?;
            }
        }
        let marker_path = self.bin_dir.join(&marker);
        if marker_path.symlink_metadata().is_ok() {
            fs::remove_file(&marker_path)?;
        }

        self.state.db().delete(&package.reference.string())?;
        changes.remove.extend(package.env_ops.iter().cloned());
        info!("uninstalled {}", package.reference);
        Ok(changes)
    }

    /// Upgrade one installed package: channels re-check their origin,
    /// versioned references re-resolve their name and move to the latest
    /// version.
    pub fn upgrade(&self, package: &mut Package) -> HermitResult<Changes> {
        if package.reference.is_channel() {
            let mut changes = Changes::default();
            changes.messages.extend(self.state.upgrade_channel(package)?);
            return Ok(changes);
        }
        let latest = self.resolve(&Selector::Name(package.reference.name.clone()))?;
        if latest.reference == package.reference {
            debug!("{} is already the latest version", package.reference);
            return Ok(Changes::default());
        }
        info!("upgrading {} to {}", package.reference, latest.reference);
        let mut changes = self.uninstall(package)?;
        let mut latest = latest;
        changes.merge(self.install(&mut latest)?);
        *package = latest;
        Ok(changes)
    }

    /// Resolve the package a user-visible binary link belongs to. The chain
    /// is `bin/<name> -> bin/.<ref>.pkg -> bin/hermit`; the middle link
    /// encodes the reference.
    pub fn resolve_link(&self, path: &Utf8Path) -> HermitResult<(Reference, Package)> {
        let name = path
            .file_name()
            .ok_or_else(|| HermitError::msg(format!("{path} is not a binary link")))?;
        let link = self.bin_dir.join(name);
        let target = if name.starts_with('.') && name.ends_with(".pkg") {
            name.to_string()
        } else {
            fs::read_link(&link)
                .map_err(|_| HermitError::msg(format!("{link} is not a hermit binary link")))?
                .to_string_lossy()
                .into_owned()
        };
        let reference: Reference = target
            .strip_prefix('.')
            .and_then(|t| t.strip_suffix(".pkg"))
            .ok_or_else(|| HermitError::msg(format!("{link} is not a hermit binary link")))?
            .parse()?;
        let package = self.resolve(&Selector::exact(reference.clone()))?;
        Ok((reference, package))
    }

    /// Resolve the runtime (and install-time) dependency closure of
    /// `package`, rejecting cycles.
    ///
    /// Virtual dependency names resolve through `provides`: a provider
    /// already installed (or already in the closure) is preferred, several
    /// uninstalled candidates yield [`HermitError::MultipleProviders`].
    pub fn resolve_runtime_deps(&self, package: &Package) -> HermitResult<Vec<Package>> {
        let installed = self.installed_packages().unwrap_or_default();
        let mut closure: SortedMap<String, Package> = SortedMap::new();
        let mut stack = vec![package.reference.name.clone()];
        self.resolve_deps_into(package, &installed, &mut closure, &mut stack)?;
        Ok(closure.into_values().collect())
    }

    fn resolve_deps_into(
        &self,
        package: &Package,
        installed: &[Package],
        closure: &mut SortedMap<String, Package>,
        stack: &mut Vec<String>,
    ) -> HermitResult<()> {
        for dep in package.requires.iter().chain(package.runtime_deps.iter()) {
            if stack.contains(dep) {
                let mut chain = stack.clone();
                chain.push(dep.clone());
                return Err(HermitError::CyclicDependency { chain: chain.join(" -> ") });
            }
            if closure.contains_key(dep) {
                continue;
            }
            let resolved = self.resolve_dep(dep, installed, closure)?;
            stack.push(dep.clone());
            self.resolve_deps_into(&resolved, installed, closure, stack)?;
            stack.pop();
            closure.insert(dep.clone(), resolved);
        }
        Ok(())
    }

    fn resolve_dep(
        &self,
        name: &str,
        installed: &[Package],
        closure: &SortedMap<String, Package>,
    ) -> HermitResult<Package> {
        // a chosen provider (installed or already in the closure) satisfies a
        // virtual name without further resolution
        let chosen = installed
            .iter()
            .chain(closure.values())
            .find(|p| p.reference.name == name || p.provides.iter().any(|v| v == name));
        if let Some(chosen) = chosen {
            return Ok(chosen.clone());
        }
        self.resolve(&Selector::Name(name.to_string()))
    }

    /// The ops that activate hermit itself, before any package env
    pub fn hermit_ops(&self) -> Vec<Op> {
        vec![
            Op::Set { name: "HERMIT_ENV".to_string(), value: self.root.to_string() },
            Op::Set { name: "HERMIT_BIN".to_string(), value: self.bin_dir.to_string() },
            Op::Set { name: "ACTIVE_HERMIT".to_string(), value: self.root.to_string() },
            Op::Prepend { name: "PATH".to_string(), value: self.bin_dir.to_string() },
        ]
    }

    /// The full op sequence that activates this environment: hermit base ops,
    /// each installed package's ops, then the local config's env.
    pub fn activation_ops(&self) -> HermitResult<Vec<Op>> {
        let mut ops = self.hermit_ops();
        for package in self.installed_packages()? {
            ops.extend(package.env_ops);
        }
        ops.extend(envars::infer(
            self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ));
        Ok(ops)
    }

    /// The expanded variable set after applying all activation ops to either
    /// the current process env or an empty one.
    pub fn envars(&self, inherit_parent: bool) -> HermitResult<Envars> {
        let initial = if inherit_parent { process_env() } else { Envars::new() };
        let mut transform = Transform::new(self.root.as_str(), initial);
        transform.apply_all(&self.activation_ops()?);
        Ok(transform.combined())
    }

    /// Execute a binary from the environment, replacing the current process
    /// image. Ensures the owning package and its runtime dependencies are
    /// unpacked and, for channels, up to date.
    pub fn exec(&self, binary: &str, args: &[String]) -> HermitResult<()> {
        // hermit invoking itself through the proxy: re-exec with the env set
        if binary == "hermit" {
            let exe = std::env::current_exe()?;
            let err = std::process::Command::new(exe)
                .args(args)
                .env("HERMIT_ENV", self.root.as_str())
                .exec();
            return Err(err.into());
        }

        let (_, mut package) = self.resolve_link(&self.bin_dir.join(binary))?;
        if package.reference.is_channel() {
            self.state.ensure_channel_up_to_date(&mut package)?;
        }
        self.state.cache_and_unpack(&mut package)?;

        let mut dep_ops = Vec::new();
        for mut dep in self.resolve_runtime_deps(&package)? {
            self.state.cache_and_unpack(&mut dep)?;
            dep_ops.extend(dep.env_ops);
        }
        self.run_trigger(&package, Event::Exec)?;

        let target = package
            .resolve_binaries()?
            .into_iter()
            .find(|b| b.file_name() == Some(binary))
            .ok_or_else(|| HermitError::msg(format!(
                "{} does not provide binary {binary}",
                package.reference
            )))?;

        let mut ops = self.hermit_ops();
        ops.extend(dep_ops);
        for installed in self.installed_packages()? {
            ops.extend(installed.env_ops);
        }
        ops.extend(envars::infer(
            self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ));

        let mut transform = Transform::new(self.root.as_str(), process_env());
        transform.apply_all(&ops);

        debug!("exec {target} {args:?}");
        let err = std::process::Command::new(target.as_std_path())
            .args(args)
            .env_clear()
            .envs(transform.combined())
            .exec();
        Err(err.into())
    }

    /// Run the package's manifest `test` command with the package's binaries
    /// and env in scope.
    pub fn test(&self, package: &mut Package) -> HermitResult<()> {
        let Some(test) = package.test.clone() else {
            debug!("{} has no test command", package.reference);
            return Ok(());
        };
        self.state.cache_and_unpack(package)?;

        let mut env = self.envars(true)?;
        let farm = self.state.binaries_dir(package);
        let path = match env.get("PATH") {
            Some(existing) => format!("{farm}:{existing}"),
            None => farm.to_string(),
        };
        env.insert("PATH".to_string(), path);

        info!("testing {} with {test:?}", package.reference);
        let expr = duct::cmd("sh", ["-c", test.as_str()])
            .dir(self.root.as_std_path())
            .full_env(env);
        expr.run().map_err(|err| HermitError::msg(format!(
            "test for {} failed: {err}",
            package.reference
        )))?;
        Ok(())
    }

    /// Validate that `name` resolves on every core platform, returning
    /// per-platform warnings. Only fails when *every* core platform fails.
    /// With `check_sources` set, each resolved source URL is probed.
    pub fn validate_manifest(
        &self,
        name: &str,
        check_sources: bool,
    ) -> HermitResult<Vec<String>> {
        let mut warnings = Vec::new();
        let mut succeeded = 0;
        let mut last_error = None;
        for platform in CORE_PLATFORMS {
            let resolver = self.resolver.for_platform(platform);
            match resolver.resolve(&Selector::Name(name.to_string())) {
                Ok(package) => {
                    succeeded += 1;
                    if check_sources {
                        if let Err(err) = self.state.cache().validate(&package.source) {
                            warnings
                                .push(format!("{platform}: {} is unreachable: {err}", package.source));
                        }
                    }
                }
                Err(err) => {
                    warnings.push(format!("{platform}: {err}"));
                    last_error = Some(err);
                }
            }
        }
        if succeeded == 0 {
            return Err(last_error.unwrap_or_else(|| HermitError::UnknownPackage {
                selector: name.to_string(),
            }));
        }
        Ok(warnings)
    }
}

/// The current process environment as an [`Envars`] map
pub fn process_env() -> Envars {
    std::env::vars().collect()
}

/// `git add -f` the given paths if `dir` is inside a git work tree
fn git_add(dir: &Utf8Path, paths: &[Utf8PathBuf]) {
    let inside = duct::cmd("git", ["rev-parse", "--is-inside-work-tree"])
        .dir(dir.as_std_path())
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !inside {
        return;
    }
    let mut args = vec!["add", "-f", "--"];
    args.extend(paths.iter().map(|p| p.as_str()));
    if let Err(err) = duct::cmd("git", &args)
        .dir(dir.as_std_path())
        .stdout_capture()
        .stderr_capture()
        .run()
    {
        warn!("git add failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateConfig;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_tgz(path: &Utf8Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    /// A project dir, a manifest source dir with a `tool` package backed by a
    /// local tarball, and an open environment over them.
    fn test_env(dir: &Utf8Path) -> Environment {
        let archive = dir.join("artifacts/tool-1.0.0.tar.gz");
        fs::create_dir_all(archive.parent().unwrap()).unwrap();
        write_tgz(&archive, &[("tool", "#!/bin/sh\necho tool\n"), ("helper", "#!/bin/sh\n")]);

        let manifests = dir.join("manifests");
        fs::create_dir_all(&manifests).unwrap();
        fs::write(
            manifests.join("tool.hcl"),
            format!(
                r#"
description = "a tool"
binaries = ["tool", "helper"]
source = "file://{}/artifacts/tool-${{version}}.tar.gz"
env = {{
  "TOOL_HOME": "${{HERMIT_ENV}}/.tool"
}}
version "1.0.0" {{}}
"#,
                dir
            ),
        )
        .unwrap();

        let project = dir.join("project");
        let state =
            State::open(dir.join("state"), StateConfig::default()).unwrap();
        let config = EnvConfig {
            manage_git: false,
            sources: Some(vec![manifests.to_string()]),
            ..EnvConfig::default()
        };
        Environment::init(&project, &config, None).unwrap();
        Environment::open(state, &project).unwrap()
    }

    #[test]
    fn init_writes_the_proxy_and_activation_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);

        let proxy = env.bin_dir().join("hermit");
        assert!(proxy.exists());
        let mode = fs::metadata(&proxy).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(env.bin_dir().join("activate-hermit").exists());
        assert!(env.bin_dir().join("hermit.hcl").exists());
        let script = fs::read_to_string(&proxy).unwrap();
        assert!(script.contains(DEFAULT_DIST_URL));
    }

    #[test]
    fn install_creates_the_proxy_link_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);

        let mut package = env.resolve(&"tool".parse().unwrap()).unwrap();
        let changes = env.install(&mut package).unwrap();
        assert!(!changes.add.is_empty());

        // bin/tool -> .tool-1.0.0.pkg -> hermit
        let link = env.bin_dir().join("tool");
        let marker = fs::read_link(&link).unwrap();
        assert_eq!(marker.to_str().unwrap(), ".tool-1.0.0.pkg");
        let proxy = fs::read_link(env.bin_dir().join(".tool-1.0.0.pkg")).unwrap();
        assert_eq!(proxy.to_str().unwrap(), "hermit");

        assert_eq!(
            env.installed_refs().unwrap(),
            vec!["tool-1.0.0".parse::<Reference>().unwrap()]
        );

        // resolve_link walks the chain back to the package
        let (reference, resolved) = env.resolve_link(&link).unwrap();
        assert_eq!(reference.to_string(), "tool-1.0.0");
        assert_eq!(resolved.reference, reference);

        // the db records the installation
        assert!(env.state().db().get("tool-1.0.0").unwrap().is_some());
    }

    #[test]
    fn install_then_uninstall_restores_the_bin_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);

        let mut package = env.resolve(&"tool".parse().unwrap()).unwrap();
        env.install(&mut package).unwrap();
        let changes = env.uninstall(&package).unwrap();

        assert!(!env.bin_dir().join("tool").symlink_metadata().is_ok());
        assert!(!env.bin_dir().join("helper").symlink_metadata().is_ok());
        assert!(!env.bin_dir().join(".tool-1.0.0.pkg").symlink_metadata().is_ok());
        assert!(env.installed_refs().unwrap().is_empty());
        // the inverse ops are handed back for the shell to revert
        assert_eq!(changes.remove.len(), package.env_ops.len());
    }

    #[test]
    fn activation_ops_compose_and_revert() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);

        let mut package = env.resolve(&"tool".parse().unwrap()).unwrap();
        env.install(&mut package).unwrap();

        let ops = env.activation_ops().unwrap();
        let mut initial = Envars::new();
        initial.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

        let mut transform = Transform::new(env.root().as_str(), initial.clone());
        transform.apply_all(&ops);
        let combined = transform.combined();
        assert_eq!(
            combined.get("PATH").unwrap(),
            &format!("{}:/usr/bin:/bin", env.bin_dir())
        );
        assert_eq!(combined.get("HERMIT_ENV").unwrap(), env.root().as_str());
        assert_eq!(
            combined.get("TOOL_HOME").unwrap(),
            &format!("{}/.tool", env.root())
        );

        transform.revert_all(&ops);
        assert_eq!(transform.combined(), initial);
    }

    #[test]
    fn envars_without_inherit_is_self_contained() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);
        let vars = env.envars(false).unwrap();
        assert_eq!(vars.get("HERMIT_ENV").unwrap(), env.root().as_str());
        assert_eq!(vars.get("PATH").unwrap(), env.bin_dir().as_str());
    }

    #[test]
    fn conflicting_binaries_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);

        // a second package shipping the same `tool` binary
        let archive = dir.join("artifacts/other-2.0.0.tar.gz");
        write_tgz(&archive, &[("tool", "#!/bin/sh\necho other\n")]);
        fs::write(
            dir.join("manifests/other.hcl"),
            format!(
                r#"
description = "conflicting tool"
binaries = ["tool"]
source = "file://{}/artifacts/other-${{version}}.tar.gz"
version "2.0.0" {{}}
"#,
                dir
            ),
        )
        .unwrap();

        let mut package = env.resolve(&"tool".parse().unwrap()).unwrap();
        env.install(&mut package).unwrap();

        let mut other = env.resolve(&"other".parse().unwrap()).unwrap();
        let err = env.install(&mut other).unwrap_err();
        let HermitError::BinaryConflict { binary, owner, .. } = err else {
            panic!("expected BinaryConflict, got {err}");
        };
        assert_eq!(binary, "tool");
        assert_eq!(owner, "tool-1.0.0");

        // bin/tool still resolves to the original package
        let (reference, _) = env.resolve_link(&env.bin_dir().join("tool")).unwrap();
        assert_eq!(reference.to_string(), "tool-1.0.0");
    }

    #[test]
    fn virtual_dependency_with_chosen_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);

        for (name, version) in [("jdk-a", "11.0.1"), ("jdk-b", "17.0.1")] {
            let archive = dir.join(format!("artifacts/{name}-{version}.tar.gz"));
            write_tgz(&archive, &[("java", "#!/bin/sh\n")]);
            fs::write(
                dir.join(format!("manifests/{name}.hcl")),
                format!(
                    r#"
description = "{name}"
binaries = ["java"]
provides = ["jdk"]
source = "file://{dir}/artifacts/{name}-${{version}}.tar.gz"
version "{version}" {{}}
"#,
                ),
            )
            .unwrap();
        }
        let archive = dir.join("artifacts/consumer-1.0.0.tar.gz");
        write_tgz(&archive, &[("consumer", "#!/bin/sh\n")]);
        fs::write(
            dir.join("manifests/consumer.hcl"),
            format!(
                r#"
description = "needs a jdk"
binaries = ["consumer"]
requires = ["jdk"]
source = "file://{dir}/artifacts/consumer-${{version}}.tar.gz"
version "1.0.0" {{}}
"#,
            ),
        )
        .unwrap();

        // with no provider chosen, the virtual dep is ambiguous
        let consumer = env.resolve(&"consumer".parse().unwrap()).unwrap();
        let err = env.resolve_runtime_deps(&consumer).unwrap_err();
        assert!(matches!(err, HermitError::MultipleProviders { .. }));

        // with jdk-a installed, resolution chooses it and adds nothing new
        let mut jdk_a = env.resolve(&"jdk-a".parse().unwrap()).unwrap();
        env.install(&mut jdk_a).unwrap();
        let deps = env.resolve_runtime_deps(&consumer).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].reference.to_string(), "jdk-a-11.0.1");
    }

    #[test]
    fn cyclic_requires_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let env = test_env(dir);

        for (name, dep) in [("ying", "yang"), ("yang", "ying")] {
            let archive = dir.join(format!("artifacts/{name}-1.0.0.tar.gz"));
            write_tgz(&archive, &[(name, "#!/bin/sh\n")]);
            fs::write(
                dir.join(format!("manifests/{name}.hcl")),
                format!(
                    r#"
description = "{name}"
binaries = ["{name}"]
requires = ["{dep}"]
source = "file://{dir}/artifacts/{name}-${{version}}.tar.gz"
version "1.0.0" {{}}
"#,
                ),
            )
            .unwrap();
        }

        let ying = env.resolve(&"ying".parse().unwrap()).unwrap();
        let err = env.resolve_runtime_deps(&ying).unwrap_err();
        let HermitError::CyclicDependency { chain } = err else {
            panic!("expected CyclicDependency, got {err}");
        };
        assert!(chain.contains("ying -> yang"));
    }
}
