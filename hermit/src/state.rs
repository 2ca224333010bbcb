//! The global per-user state root: cache, package store, synced sources,
//! lock, and DB.
//!
//! Layout:
//!
//! ```text
//! .lock                 single advisory lock
//! cache/                content-addressed artifact cache
//! pkg/<ref>/            extracted packages
//! binaries/<ref>/       per-package symlink farm
//! sources/<digest>/     synced manifest trees
//! db                    single-file KV store
//! ```
//!
//! All write paths take `.lock` with a bounded timeout; read paths (resolve,
//! search, listing) do not.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::archive;
use crate::cache::Cache;
use crate::db::{Db, DbEntry};
use crate::errors::{HermitError, HermitResult};
use crate::lock::FileLock;
use crate::manifest::actions::Event;
use crate::package::{Package, PackageState};

/// Default `.lock` acquisition timeout
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// A `(pattern, replacement)` rewrite producing extra mirror URLs from a
/// package's source URL.
#[derive(Debug, Clone)]
pub struct AutoMirror {
    /// regex matched against the source URL
    pub pattern: regex::Regex,
    /// replacement template (regex capture groups allowed)
    pub replacement: String,
}

/// Tunables for the state root
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// how long to wait for `.lock`
    pub lock_timeout: Duration,
    /// auto-mirror rewrites applied to every source URL
    pub auto_mirrors: Vec<AutoMirror>,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig { lock_timeout: DEFAULT_LOCK_TIMEOUT, auto_mirrors: Vec::new() }
    }
}

/// Handle to the state root
#[derive(Debug, Clone)]
pub struct State {
    root: Utf8PathBuf,
    cache: Cache,
    db: Db,
    config: StateConfig,
    client: reqwest::blocking::Client,
}

impl State {
    /// Open (creating if necessary) the state root at `root`
    pub fn open(root: Utf8PathBuf, config: StateConfig) -> HermitResult<State> {
        let client = reqwest::blocking::Client::builder().build()?;
        fs::create_dir_all(root.join("pkg"))?;
        fs::create_dir_all(root.join("binaries"))?;
        fs::create_dir_all(root.join("sources"))?;
        let cache = Cache::open(root.join("cache"), client.clone())?;
        let db = Db::open(root.join("db"));
        Ok(State { root, cache, db, config, client })
    }

    /// The conventional state root for this user: `$HERMIT_STATE_DIR`, or
    /// `~/.cache/hermit`.
    pub fn default_root() -> HermitResult<Utf8PathBuf> {
        if let Ok(dir) = std::env::var("HERMIT_STATE_DIR") {
            return Ok(Utf8PathBuf::from(dir));
        }
        let home = std::env::var("HOME")
            .map_err(|_| HermitError::msg("neither HERMIT_STATE_DIR nor HOME is set"))?;
        Ok(Utf8PathBuf::from(home).join(".cache").join("hermit"))
    }

    /// The state root directory
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The artifact cache
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The per-package DB
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The shared HTTP client
    pub fn client(&self) -> &reqwest::blocking::Client {
        &self.client
    }

    /// Where packages extract
    pub fn pkg_dir(&self) -> Utf8PathBuf {
        self.root.join("pkg")
    }

    /// Where synced manifest sources live
    pub fn sources_dir(&self) -> Utf8PathBuf {
        self.root.join("sources")
    }

    /// The symlink farm for one package
    pub fn binaries_dir(&self, package: &Package) -> Utf8PathBuf {
        self.root.join("binaries").join(package.reference.string())
    }

    /// Take the cross-process state lock
    pub fn acquire_lock(&self) -> HermitResult<FileLock> {
        FileLock::acquire(&self.root.join(".lock"), self.config.lock_timeout)
    }

    /// Whether the package's tree exists in the store
    pub fn is_extracted(&self, package: &Package) -> bool {
        package.root.exists()
    }

    /// Whether every resolved binary has a correct link in the package's
    /// symlink farm.
    pub fn binaries_linked(&self, package: &Package) -> bool {
        if !self.is_extracted(package) {
            return false;
        }
        let farm = self.binaries_dir(package);
        let Ok(binaries) = package.resolve_binaries() else {
            return false;
        };
        binaries.iter().all(|binary| {
            let link = farm.join(binary.file_name().unwrap_or_default());
            fs::read_link(&link).map(|target| target == binary.as_std_path()).unwrap_or(false)
        })
    }

    /// Fill in the package fields backed by the DB and local store state
    pub fn annotate(&self, package: &mut Package) -> HermitResult<()> {
        if let Some(entry) = self.db.get(&package.reference.string())? {
            package.etag = entry.etag;
            package.updated_at = entry.update_checked_at;
        }
        let digests = package.expected_digests(&package.source);
        package.state = if self.is_extracted(package) {
            PackageState::Installed
        } else if self.cache.contains(digests.first().map(|d| d.as_str()), &package.source) {
            PackageState::Downloaded
        } else {
            PackageState::Remote
        };
        package.linked = self.binaries_linked(package);
        Ok(())
    }

    /// The package's mirror list: manifest mirrors plus generated
    /// auto-mirrors.
    fn mirrors(&self, package: &Package) -> Vec<String> {
        let mut mirrors = package.mirrors.clone();
        for auto in &self.config.auto_mirrors {
            if auto.pattern.is_match(&package.source) {
                mirrors
                    .push(auto.pattern.replace(&package.source, &auto.replacement).to_string());
            }
        }
        mirrors
    }

    /// Ensure the package is downloaded, extracted, and its binaries linked.
    ///
    /// Uses double-checked locking: the fast path checks without the lock,
    /// then re-checks after acquiring it, so two contending processes produce
    /// a single extracted tree and neither returns early. Returns any
    /// messages produced by the `unpack` trigger.
    pub fn cache_and_unpack(&self, package: &mut Package) -> HermitResult<Vec<String>> {
        if self.is_extracted(package) && self.binaries_linked(package) {
            package.state = PackageState::Installed;
            package.linked = true;
            return Ok(Vec::new());
        }
        let _lock = self.acquire_lock()?;
        self.cache_and_unpack_locked(package)
    }

    /// [`State::cache_and_unpack`] for callers that already hold the lock.
    /// The lock is non-reentrant, so nested acquisition would deadlock until
    /// the timeout.
    fn cache_and_unpack_locked(&self, package: &mut Package) -> HermitResult<Vec<String>> {
        if self.is_extracted(package) && self.binaries_linked(package) {
            package.state = PackageState::Installed;
            package.linked = true;
            return Ok(Vec::new());
        }

        let digests = package.expected_digests(&package.source);
        let mirrors = self.mirrors(package);
        let (archive_path, etag) = self.cache.download(&digests, &package.source, &mirrors)?;
        if !etag.is_empty() {
            package.etag = etag;
        }

        let mut messages = Vec::new();
        if !self.is_extracted(package) {
            archive::extract(package, &archive_path)?;
            match package.trigger(Event::Unpack) {
                Ok(trigger_messages) => messages = trigger_messages,
                Err(err) => {
                    // roll extraction back so a later attempt starts clean
                    let _ = archive::unlock_tree(&package.dest);
                    let _ = fs::remove_dir_all(&package.dest);
                    return Err(err);
                }
            }
            if !package.mutable {
                archive::lock_tree(&package.dest)?;
            }
        }

        self.link_binaries(package)?;
        package.state = PackageState::Installed;
        package.linked = true;
        Ok(messages)
    }

    /// Create (or refresh) the symlink farm entry for every resolved binary
    fn link_binaries(&self, package: &Package) -> HermitResult<()> {
        let farm = self.binaries_dir(package);
        fs::create_dir_all(&farm)?;
        for binary in package.resolve_binaries()? {
            let name = binary
                .file_name()
                .ok_or_else(|| HermitError::msg(format!("binary {binary} has no name")))?;
            let link = farm.join(name);
            match fs::read_link(&link) {
                Ok(target) if target == binary.as_std_path() => continue,
                Ok(_) => fs::remove_file(&link)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            debug!("linking {link} -> {binary}");
            std::os::unix::fs::symlink(&binary, &link)?;
        }
        Ok(())
    }

    /// Re-check a channel package against its origin and refresh it if the
    /// origin moved.
    ///
    /// A transport failure on the HEAD probe is recovered locally: the stored
    /// ETag is retained and `update_checked_at` is not advanced.
    pub fn upgrade_channel(&self, package: &mut Package) -> HermitResult<Vec<String>> {
        if !package.reference.is_channel() {
            return Err(HermitError::msg(format!(
                "{} is not a channel and cannot be upgraded in place",
                package.reference
            )));
        }

        let entry = self.db.get(&package.reference.string())?.unwrap_or_default();
        let server_etag = match self.cache.etag(&package.source) {
            Ok(etag) => etag,
            Err(err) => {
                warn!("update check for {} failed, keeping {:?}: {err}", package.reference, entry.etag);
                return Ok(Vec::new());
            }
        };

        let _lock = self.acquire_lock()?;
        let mut messages = Vec::new();
        let mut etag = server_etag.clone();
        if entry.etag.is_empty() || server_etag != entry.etag {
            info!("{} has changed upstream, refreshing", package.reference);
            let digests = package.expected_digests(&package.source);
            self.cache.evict(digests.first().map(|d| d.as_str()), &package.source)?;
            self.remove_tree(package)?;
            messages = self.cache_and_unpack_locked(package)?;
            if !package.etag.is_empty() {
                etag = package.etag.clone();
            }
        } else {
            debug!("{} is unchanged upstream", package.reference);
        }

        package.etag = etag.clone();
        package.updated_at = Some(chrono::Utc::now());
        self.db.set(
            &package.reference.string(),
            DbEntry { etag, update_checked_at: package.updated_at },
        )?;
        Ok(messages)
    }

    /// Upgrade the channel iff its update interval has elapsed. A zero
    /// interval means never auto-check.
    pub fn ensure_channel_up_to_date(&self, package: &mut Package) -> HermitResult<Vec<String>> {
        if !package.reference.is_channel() {
            return Ok(Vec::new());
        }
        let Some(interval) = package.update_interval else {
            return Ok(Vec::new());
        };
        if interval.is_zero() {
            return Ok(Vec::new());
        }
        let entry = self.db.get(&package.reference.string())?.unwrap_or_default();
        let due = match entry.update_checked_at {
            None => true,
            Some(checked) => {
                let age = chrono::Utc::now().signed_duration_since(checked);
                age.to_std().map(|age| age >= interval).unwrap_or(true)
            }
        };
        if due {
            self.upgrade_channel(package)
        } else {
            Ok(Vec::new())
        }
    }

    /// Delete the extracted tree. If the tree contains the currently running
    /// hermit, rename it aside instead so the mapped binary survives.
    fn remove_tree(&self, package: &Package) -> HermitResult<()> {
        if !package.root.exists() {
            return Ok(());
        }
        let running_inside = std::env::current_exe()
            .ok()
            .map(|exe| exe.starts_with(package.root.as_std_path()))
            .unwrap_or(false);
        if running_inside {
            let aside = Utf8PathBuf::from(format!("{}.old", package.root));
            if aside.exists() {
                let _ = archive::unlock_tree(&aside);
                fs::remove_dir_all(&aside)?;
            }
            fs::rename(&package.root, &aside)?;
            return Ok(());
        }
        archive::unlock_tree(&package.root)?;
        fs::remove_dir_all(&package.root)?;
        Ok(())
    }

    /// Remove a package's extracted tree and symlink farm. The caller holds
    /// the lock.
    pub fn remove_package(&self, package: &Package) -> HermitResult<()> {
        self.remove_tree(package)?;
        let farm = self.binaries_dir(package);
        if farm.exists() {
            fs::remove_dir_all(&farm)?;
        }
        Ok(())
    }

    /// Remove every extracted package and symlink farm
    pub fn clean_packages(&self) -> HermitResult<()> {
        let _lock = self.acquire_lock()?;
        for dir in ["pkg", "binaries"] {
            let root = self.root.join(dir);
            if root.exists() {
                archive::unlock_tree(&root)?;
                fs::remove_dir_all(&root)?;
            }
            fs::create_dir_all(&root)?;
        }
        Ok(())
    }

    /// Remove every per-package symlink farm, leaving extracted trees intact
    pub fn clean_binaries(&self) -> HermitResult<()> {
        let _lock = self.acquire_lock()?;
        let root = self.root.join("binaries");
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(())
    }

    /// Remove the artifact cache
    pub fn clean_cache(&self) -> HermitResult<()> {
        let _lock = self.acquire_lock()?;
        self.cache.clean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::reference::Reference;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::time::SystemTime;

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

    fn test_package(state: &State, dir: &Utf8Path, reference: &str) -> Package {
        let archive = dir.join("tool.tar.gz");
        write_tgz(&archive, &[("tool", "#!/bin/sh\necho tool\n")]);
        let reference: Reference = reference.parse().unwrap();
        let root = state.pkg_dir().join(reference.string());
        Package {
            reference,
            description: String::new(),
            source: format!("file://{archive}"),
            mirrors: vec![],
            sha256: None,
            sha256_sums: Default::default(),
            root: root.clone(),
            dest: root,
            binaries: vec!["tool".to_string()],
            apps: vec![],
            requires: vec![],
            runtime_deps: vec![],
            provides: vec![],
            env_ops: vec![],
            files: Default::default(),
            triggers: Default::default(),
            update_interval: None,
            updated_at: None,
            etag: String::new(),
            dont_extract: false,
            mutable: false,
            strip: 0,
            test: None,
            warnings: vec![],
            unsupported_platforms: vec![],
            state: PackageState::Remote,
            linked: false,
        }
    }

    fn state_in(dir: &Utf8Path) -> State {
        State::open(dir.join("state"), StateConfig::default()).unwrap()
    }

    #[test]
    fn cache_and_unpack_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let state = state_in(dir);
        let mut package = test_package(&state, dir, "tool-1.0.0");

        state.cache_and_unpack(&mut package).unwrap();
        assert!(package.root.join("tool").exists());
        assert_eq!(package.state, PackageState::Installed);
        assert!(package.linked);

        let farm_link = state.binaries_dir(&package).join("tool");
        let target = fs::read_link(&farm_link).unwrap();
        assert_eq!(target, package.root.join("tool").as_std_path());

        // second call does no I/O: the cached artifact is untouched
        let cache_path = state.cache.path_for(None, &package.source);
        let before = fs::metadata(&cache_path).unwrap().modified().unwrap();
        state.cache_and_unpack(&mut package).unwrap();
        let after = fs::metadata(&cache_path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn extracted_tree_is_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let state = state_in(dir);
        let mut package = test_package(&state, dir, "tool-1.0.0");
        state.cache_and_unpack(&mut package).unwrap();

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&package.root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o500);

        // and remove_package can still delete it
        let _lock = state.acquire_lock().unwrap();
        state.remove_package(&package).unwrap();
        assert!(!package.root.exists());
        assert!(!state.binaries_dir(&package).exists());
    }

    #[test]
    fn upgrade_channel_keeps_etag_on_probe_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let state = state_in(dir);
        let mut package = test_package(&state, dir, "tool@stable");
        package.update_interval = Some(Duration::from_secs(3600));

        state.cache_and_unpack(&mut package).unwrap();
        state
            .db
            .set(
                "tool@stable",
                DbEntry { etag: "e1".to_string(), update_checked_at: None },
            )
            .unwrap();

        // point the source at a URL whose HEAD will fail
        package.source = "https://127.0.0.1:1/tool.tar.gz".to_string();
        state.upgrade_channel(&mut package).unwrap();

        let entry = state.db.get("tool@stable").unwrap().unwrap();
        assert_eq!(entry.etag, "e1");
        assert_eq!(entry.update_checked_at, None);
    }

    #[test]
    fn upgrade_channel_refreshes_on_etag_change() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let state = state_in(dir);
        let mut package = test_package(&state, dir, "tool@stable");
        package.update_interval = Some(Duration::from_secs(3600));

        state.cache_and_unpack(&mut package).unwrap();
        // stored etag empty -> the next check always refreshes
        let before = SystemTime::now();
        state.upgrade_channel(&mut package).unwrap();

        let entry = state.db.get("tool@stable").unwrap().unwrap();
        assert!(entry.update_checked_at.is_some());
        let checked: SystemTime = entry.update_checked_at.unwrap().into();
        assert!(checked >= before);
        assert!(package.root.join("tool").exists());
    }

    #[test]
    fn up_to_date_channel_is_not_rechecked() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let state = state_in(dir);
        let mut package = test_package(&state, dir, "tool@stable");
        package.update_interval = Some(Duration::from_secs(3600));
        state.cache_and_unpack(&mut package).unwrap();

        let now = chrono::Utc::now();
        state
            .db
            .set("tool@stable", DbEntry { etag: "e1".to_string(), update_checked_at: Some(now) })
            .unwrap();

        // probe would fail loudly if attempted; a fresh entry means no probe
        package.source = "https://127.0.0.1:1/tool.tar.gz".to_string();
        state.ensure_channel_up_to_date(&mut package).unwrap();
        let entry = state.db.get("tool@stable").unwrap().unwrap();
        assert_eq!(entry.update_checked_at, Some(now));
    }
}
