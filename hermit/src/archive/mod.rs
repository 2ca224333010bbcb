//! Archive identification and extraction.
//!
//! The kind is sniffed from the filename extension, falling back to magic
//! bytes. Extraction is stream-based where the format allows, strips an
//! optional number of leading path components, preserves permissions, and
//! rejects entries escaping the target root before creating any file.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{HermitError, HermitResult};
use crate::package::Package;

mod rpm;

/// The archive formats hermit understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// uncompressed tar
    Tar,
    /// gzip-compressed tar
    TarGz,
    /// bzip2-compressed tar
    TarBz2,
    /// xz-compressed tar
    TarXz,
    /// zip
    Zip,
    /// 7-zip
    SevenZip,
    /// Debian package (ar container around data.tar.*)
    Deb,
    /// RPM package (cpio payload)
    Rpm,
    /// Apple installer package
    Pkg,
    /// a raw executable, copied verbatim and marked executable
    Binary,
}

/// Identify the archive kind of `path` from its extension, falling back to
/// magic bytes.
pub fn detect(path: &Utf8Path) -> HermitResult<ArchiveKind> {
    let name = path.file_name().unwrap_or("").to_ascii_lowercase();
    let by_name = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        Some(ArchiveKind::TarBz2)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Some(ArchiveKind::TarXz)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if name.ends_with(".7z") {
        Some(ArchiveKind::SevenZip)
    } else if name.ends_with(".deb") {
        Some(ArchiveKind::Deb)
    } else if name.ends_with(".rpm") {
        Some(ArchiveKind::Rpm)
    } else if name.ends_with(".pkg") {
        Some(ArchiveKind::Pkg)
    } else {
        None
    };
    if let Some(kind) = by_name {
        return Ok(kind);
    }
    sniff(path)
}

fn sniff(path: &Utf8Path) -> HermitResult<ArchiveKind> {
    let mut file = fs::File::open(path)?;
    let mut head = [0u8; 8];
    let n = file.read(&mut head)?;
    let head = &head[..n];
    let kind = if head.starts_with(&[0x1f, 0x8b]) {
        ArchiveKind::TarGz
    } else if head.starts_with(b"BZh") {
        ArchiveKind::TarBz2
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        ArchiveKind::TarXz
    } else if head.starts_with(b"PK") {
        ArchiveKind::Zip
    } else if head.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]) {
        ArchiveKind::SevenZip
    } else if head.starts_with(b"!<arch>") {
        ArchiveKind::Deb
    } else if head.starts_with(&[0xed, 0xab, 0xee, 0xdb]) {
        ArchiveKind::Rpm
    } else if head.starts_with(b"xar!") {
        ArchiveKind::Pkg
    } else if is_tar(&mut file)? {
        ArchiveKind::Tar
    } else {
        ArchiveKind::Binary
    };
    Ok(kind)
}

fn is_tar(file: &mut fs::File) -> HermitResult<bool> {
    let mut magic = [0u8; 5];
    if file.seek(SeekFrom::Start(257)).is_err() {
        return Ok(false);
    }
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == b"ustar"),
        Err(_) => Ok(false),
    }
}

/// Extract `archive` into `package.dest`, creating the target directory
/// first. With `dont-extract` set the archive is copied in as-is under its
/// basename. The caller runs the `unpack` trigger afterwards and then
/// [`lock_tree`]s the result unless the package is mutable.
pub fn extract(package: &Package, archive: &Utf8Path) -> HermitResult<()> {
    fs::create_dir_all(&package.dest)?;

    if package.dont_extract {
        let name = source_basename(package);
        let dest = package.dest.join(name);
        fs::copy(archive, &dest)?;
        return Ok(());
    }

    let kind = detect(archive)?;
    debug!("extracting {archive} as {kind:?} into {}", package.dest);
    let strip = package.strip;
    let dest = &package.dest;
    let fail = |message: String| HermitError::ExtractionFailed {
        path: archive.to_owned(),
        message,
    };

    match kind {
        ArchiveKind::Tar => untar(fs::File::open(archive)?, dest, strip),
        ArchiveKind::TarGz => {
            untar(flate2::read::GzDecoder::new(fs::File::open(archive)?), dest, strip)
        }
        ArchiveKind::TarBz2 => {
            untar(bzip2::read::BzDecoder::new(fs::File::open(archive)?), dest, strip)
        }
        ArchiveKind::TarXz => {
            untar(xz2::read::XzDecoder::new(fs::File::open(archive)?), dest, strip)
        }
        ArchiveKind::Zip => unzip(archive, dest, strip),
        ArchiveKind::SevenZip => {
            let staging = tempfile::tempdir_in(
                dest.parent().unwrap_or(Utf8Path::new(".")),
            )?;
            sevenz_rust::decompress_file(archive.as_std_path(), staging.path())
                .map_err(|err| fail(err.to_string()))?;
            let staging_path = Utf8Path::from_path(staging.path())
                .ok_or_else(|| fail("non-utf8 staging path".to_string()))?;
            move_stripped(staging_path, dest, strip)
        }
        ArchiveKind::Deb => undeb(archive, dest, strip),
        ArchiveKind::Rpm => rpm::extract(archive, dest, strip),
        ArchiveKind::Pkg => unpkg(archive, dest, strip),
        ArchiveKind::Binary => {
            let name = source_basename(package);
            let out = dest.join(name);
            fs::copy(archive, &out)?;
            fs::set_permissions(&out, fs::Permissions::from_mode(0o755))?;
            Ok(())
        }
    }
}

/// The basename the extracted artifact takes for raw binaries and
/// `dont-extract` packages: derived from the source URL so it is stable
/// across cache layouts.
fn source_basename(package: &Package) -> String {
    let uri = package.source.split(['?', '#']).next().unwrap_or("");
    let name = uri.rsplit('/').find(|s| !s.is_empty()).unwrap_or("");
    if name.is_empty() {
        package.reference.name.clone()
    } else {
        name.to_string()
    }
}

/// Remove `strip` leading components; `None` means the entry vanishes
fn strip_components(path: &Path, strip: usize) -> Option<PathBuf> {
    let mut components = path.components();
    for _ in 0..strip {
        components.next()?;
    }
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Join `rel` under `dest`, rejecting absolute paths and `..` traversal
fn safe_join(dest: &Utf8Path, rel: &Path) -> HermitResult<Utf8PathBuf> {
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(HermitError::ExtractionFailed {
                    path: dest.to_owned(),
                    message: format!("entry {rel:?} escapes the extraction root"),
                })
            }
        }
    }
    let rel = Utf8Path::from_path(rel).ok_or_else(|| HermitError::ExtractionFailed {
        path: dest.to_owned(),
        message: format!("non-utf8 entry {rel:?}"),
    })?;
    Ok(dest.join(rel))
}

pub(crate) fn untar<R: Read>(reader: R, dest: &Utf8Path, strip: usize) -> HermitResult<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(stripped) = strip_components(&path, strip) else {
            continue;
        };
        let out = safe_join(dest, &stripped)?;
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(out.as_std_path())?;
    }
    Ok(())
}

fn unzip(archive: &Utf8Path, dest: &Utf8Path, strip: usize) -> HermitResult<()> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|err| HermitError::ExtractionFailed {
        path: archive.to_owned(),
        message: err.to_string(),
    })?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|err| HermitError::ExtractionFailed {
            path: archive.to_owned(),
            message: err.to_string(),
        })?;
        let Some(name) = entry.enclosed_name() else {
            return Err(HermitError::ExtractionFailed {
                path: archive.to_owned(),
                message: format!("entry {:?} escapes the extraction root", entry.name()),
            });
        };
        let Some(stripped) = strip_components(&name, strip) else {
            continue;
        };
        let out = safe_join(dest, &stripped)?;
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut writer)?;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&out, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Debian packages are an `ar` container holding `data.tar.*`
fn undeb(archive: &Utf8Path, dest: &Utf8Path, strip: usize) -> HermitResult<()> {
    let mut ar = ar::Archive::new(fs::File::open(archive)?);
    while let Some(entry) = ar.next_entry() {
        let entry = entry?;
        let name = String::from_utf8_lossy(entry.header().identifier()).to_string();
        if !name.starts_with("data.tar") {
            continue;
        }
        return match name.trim_start_matches("data.tar") {
            ".gz" => untar(flate2::read::GzDecoder::new(entry), dest, strip),
            ".xz" => untar(xz2::read::XzDecoder::new(entry), dest, strip),
            ".bz2" => untar(bzip2::read::BzDecoder::new(entry), dest, strip),
            ".zst" => untar(
                zstd::stream::read::Decoder::new(entry).map_err(HermitError::Io)?,
                dest,
                strip,
            ),
            "" => untar(entry, dest, strip),
            other => Err(HermitError::ExtractionFailed {
                path: archive.to_owned(),
                message: format!("unsupported deb payload compression {other:?}"),
            }),
        };
    }
    Err(HermitError::ExtractionFailed {
        path: archive.to_owned(),
        message: "deb contains no data.tar member".to_string(),
    })
}

/// Apple installer packages expand via the system `pkgutil`, which exists on
/// every macOS install; there is nothing sensible to do elsewhere.
fn unpkg(archive: &Utf8Path, dest: &Utf8Path, strip: usize) -> HermitResult<()> {
    if !cfg!(target_os = "macos") {
        return Err(HermitError::ExtractionFailed {
            path: archive.to_owned(),
            message: "Apple pkg archives can only be extracted on macOS".to_string(),
        });
    }
    let staging = dest.with_extension("pkg-staging");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    duct::cmd(
        "pkgutil",
        ["--expand-full", archive.as_str(), staging.as_str()],
    )
    .run()
    .map_err(|err| HermitError::Subprocess {
        command: "pkgutil --expand-full".to_string(),
        message: err.to_string(),
    })?;
    let result = move_stripped(&staging, dest, strip);
    let _ = fs::remove_dir_all(&staging);
    result
}

/// Move the contents of `src` into `dest`, dropping `strip` leading levels.
/// Used for formats whose extractors cannot strip in-stream.
fn move_stripped(src: &Utf8Path, dest: &Utf8Path, strip: usize) -> HermitResult<()> {
    let mut roots = vec![src.to_owned()];
    for _ in 0..strip {
        let mut next = Vec::new();
        for root in roots {
            for child in root.read_dir_utf8()? {
                let child = child?;
                if child.file_type()?.is_dir() {
                    next.push(child.path().to_owned());
                }
            }
        }
        roots = next;
    }
    fs::create_dir_all(dest)?;
    for root in roots {
        for child in root.read_dir_utf8()? {
            let child = child?;
            let target = dest.join(child.file_name());
            fs::rename(child.path(), target)?;
        }
    }
    Ok(())
}

/// Re-lock an extracted tree read-only: directories to `0500`, files keep
/// their read/execute bits but lose write.
pub fn lock_tree(root: &Utf8Path) -> HermitResult<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(|err| HermitError::msg(format!("walk {root}: {err}")))?;
        let meta = entry.metadata().map_err(|err| HermitError::msg(err.to_string()))?;
        if meta.file_type().is_symlink() {
            continue;
        }
        let mode = if meta.is_dir() { 0o500 } else { meta.permissions().mode() & 0o555 };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// The inverse of [`lock_tree`]: `chmod -R +w`, so the tree can be modified
/// or deleted.
pub fn unlock_tree(root: &Utf8Path) -> HermitResult<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| HermitError::msg(format!("walk {root}: {err}")))?;
        let meta = entry.metadata().map_err(|err| HermitError::msg(err.to_string()))?;
        if meta.file_type().is_symlink() {
            continue;
        }
        let mode = if meta.is_dir() {
            meta.permissions().mode() | 0o700
        } else {
            meta.permissions().mode() | 0o200
        };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_tgz(path: &Utf8Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            let name_bytes = name.as_bytes();
            header.as_gnu_mut().unwrap().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn package_into(dest: &Utf8Path, strip: usize) -> Package {
        use crate::manifest::reference::Reference;
        use crate::package::PackageState;
        Package {
            reference: "tool-1.0.0".parse::<Reference>().unwrap(),
            description: String::new(),
            source: "https://example.com/tool-1.0.0.tar.gz".to_string(),
            mirrors: vec![],
            sha256: None,
            sha256_sums: Default::default(),
            root: dest.to_owned(),
            dest: dest.to_owned(),
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
            strip,
            test: None,
            warnings: vec![],
            unsupported_platforms: vec![],
            state: PackageState::Remote,
            linked: false,
        }
    }

    #[test]
    fn detects_by_extension_and_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();

        let tgz = dir.join("a.tar.gz");
        write_tgz(&tgz, &[("tool", "x")]);
        assert_eq!(detect(&tgz).unwrap(), ArchiveKind::TarGz);

        // same bytes, extension withheld: magic sniffing takes over
        let bare = dir.join("mystery");
        fs::copy(&tgz, &bare).unwrap();
        assert_eq!(detect(&bare).unwrap(), ArchiveKind::TarGz);

        let exe = dir.join("tool");
        fs::write(&exe, b"#!/bin/sh\necho hi\n").unwrap();
        assert_eq!(detect(&exe).unwrap(), ArchiveKind::Binary);
    }

    #[test]
    fn extracts_tgz_with_strip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let tgz = dir.join("tool.tar.gz");
        write_tgz(&tgz, &[("tool-1.0.0/bin/tool", "binary"), ("tool-1.0.0/README", "docs")]);

        let dest = dir.join("pkg");
        let package = package_into(&dest, 1);
        extract(&package, &tgz).unwrap();
        assert_eq!(fs::read_to_string(dest.join("bin/tool")).unwrap(), "binary");
        assert!(dest.join("README").exists());
        assert!(!dest.join("tool-1.0.0").exists());
    }

    #[test]
    fn rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let tgz = dir.join("evil.tar.gz");
        write_tgz(&tgz, &[("../evil", "pwned")]);

        let dest = dir.join("pkg");
        let package = package_into(&dest, 0);
        let err = extract(&package, &tgz).unwrap_err();
        assert!(matches!(err, HermitError::ExtractionFailed { .. }));
        assert!(!dir.join("evil").exists());
    }

    #[test]
    fn raw_binary_is_copied_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let raw = dir.join("download");
        fs::write(&raw, b"\x7fELF...").unwrap();

        let dest = dir.join("pkg");
        let mut package = package_into(&dest, 0);
        package.source = "https://example.com/tool".to_string();
        extract(&package, &raw).unwrap();

        let out = dest.join("tool");
        assert!(out.exists());
        let mode = fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn dont_extract_copies_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let tgz = dir.join("tool.tar.gz");
        write_tgz(&tgz, &[("inner", "x")]);

        let dest = dir.join("pkg");
        let mut package = package_into(&dest, 0);
        package.dont_extract = true;
        extract(&package, &tgz).unwrap();
        assert!(dest.join("tool-1.0.0.tar.gz").exists());
        assert!(!dest.join("inner").exists());
    }

    #[test]
    fn lock_and_unlock_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let root = dir.join("tree");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file"), b"x").unwrap();

        lock_tree(&root).unwrap();
        let mode = fs::metadata(root.join("sub")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o500);
        assert_eq!(
            fs::metadata(root.join("sub/file")).unwrap().permissions().mode() & 0o200,
            0
        );

        unlock_tree(&root).unwrap();
        fs::write(root.join("sub/file"), b"y").unwrap();
        fs::remove_dir_all(&root).unwrap();
    }
}
