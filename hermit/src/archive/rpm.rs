//! RPM payload extraction.
//!
//! An rpm is a 96-byte lead, a signature header, a main header, and a
//! compressed cpio (newc) payload. The header structures are only skipped
//! over; the payload compression is sniffed from its magic bytes. The newc
//! format itself is a trivial ASCII layout, read directly.

use std::fs;
use std::io::{Cursor, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use camino::Utf8Path;

use crate::errors::{HermitError, HermitResult};

use super::{safe_join, strip_components};

const LEAD_LEN: usize = 96;
const HEADER_MAGIC: [u8; 4] = [0x8e, 0xad, 0xe8, 0x01];

/// Extract the payload of the rpm at `archive` into `dest`
pub fn extract(archive: &Utf8Path, dest: &Utf8Path, strip: usize) -> HermitResult<()> {
    let fail = |message: String| HermitError::ExtractionFailed {
        path: archive.to_owned(),
        message,
    };

    let mut file = fs::File::open(archive)?;
    let mut lead = [0u8; LEAD_LEN];
    file.read_exact(&mut lead).map_err(|_| fail("truncated rpm lead".to_string()))?;
    if lead[..4] != [0xed, 0xab, 0xee, 0xdb] {
        return Err(fail("not an rpm".to_string()));
    }

    // signature header, padded to 8 bytes; then the main header, unpadded
    skip_header(&mut file, true).map_err(|err| fail(err))?;
    skip_header(&mut file, false).map_err(|err| fail(err))?;

    // what remains is the compressed payload
    let mut magic = [0u8; 6];
    let n = file.read(&mut magic)?;
    let head = Cursor::new(magic[..n].to_vec());
    let payload = head.chain(file);
    let reader: Box<dyn Read> = if magic.starts_with(&[0x1f, 0x8b]) {
        Box::new(flate2::read::GzDecoder::new(payload))
    } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Box::new(xz2::read::XzDecoder::new(payload))
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Box::new(zstd::stream::read::Decoder::new(payload)?)
    } else if magic.starts_with(b"BZh") {
        Box::new(bzip2::read::BzDecoder::new(payload))
    } else {
        return Err(fail(format!("unrecognized rpm payload compression {magic:02x?}")));
    };

    uncpio(reader, archive, dest, strip)
}

/// Skip one rpm header structure: magic, reserved, index count, store size
fn skip_header(file: &mut fs::File, pad: bool) -> Result<(), String> {
    let mut intro = [0u8; 16];
    file.read_exact(&mut intro).map_err(|_| "truncated rpm header".to_string())?;
    if intro[..4] != HEADER_MAGIC {
        return Err("bad rpm header magic".to_string());
    }
    let nindex = u32::from_be_bytes(intro[8..12].try_into().unwrap()) as u64;
    let hsize = u32::from_be_bytes(intro[12..16].try_into().unwrap()) as u64;
    let mut body_len = nindex * 16 + hsize;
    if pad {
        body_len = (body_len + 7) & !7;
    }
    std::io::copy(&mut file.take(body_len), &mut std::io::sink())
        .map_err(|err| err.to_string())?;
    Ok(())
}

/// Read a newc cpio stream, writing entries under `dest`
fn uncpio<R: Read>(
    mut reader: R,
    archive: &Utf8Path,
    dest: &Utf8Path,
    strip: usize,
) -> HermitResult<()> {
    let fail = |message: String| HermitError::ExtractionFailed {
        path: archive.to_owned(),
        message,
    };

    loop {
        let mut header = [0u8; 110];
        reader.read_exact(&mut header).map_err(|_| fail("truncated cpio header".to_string()))?;
        if &header[..6] != b"070701" && &header[..6] != b"070702" {
            return Err(fail("bad cpio magic".to_string()));
        }
        let field = |i: usize| -> Result<u64, HermitError> {
            let s = std::str::from_utf8(&header[6 + i * 8..6 + (i + 1) * 8])
                .map_err(|_| fail("bad cpio field".to_string()))?;
            u64::from_str_radix(s, 16).map_err(|_| fail(format!("bad cpio field {s:?}")))
        };
        let mode = field(1)?;
        let filesize = field(6)? as usize;
        let namesize = field(11)? as usize;

        let mut name = vec![0u8; namesize];
        reader.read_exact(&mut name).map_err(|_| fail("truncated cpio name".to_string()))?;
        // the name is NUL-terminated and the header+name block pads to 4
        skip_padding(&mut reader, (110 + namesize) % 4)?;
        let name = String::from_utf8_lossy(&name[..namesize.saturating_sub(1)]).to_string();

        if name == "TRAILER!!!" {
            break;
        }

        let mut data = vec![0u8; filesize];
        reader.read_exact(&mut data).map_err(|_| fail("truncated cpio data".to_string()))?;
        skip_padding(&mut reader, filesize % 4)?;

        let rel = PathBuf::from(name.trim_start_matches("./"));
        if rel.as_os_str().is_empty() {
            continue;
        }
        let Some(stripped) = strip_components(&rel, strip) else {
            continue;
        };
        let out = safe_join(dest, &stripped)?;

        match mode & 0o170000 {
            0o040000 => {
                fs::create_dir_all(&out)?;
            }
            0o120000 => {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)?;
                }
                let target = String::from_utf8_lossy(&data).to_string();
                std::os::unix::fs::symlink(target, &out)?;
            }
            _ => {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&out, &data)?;
                fs::set_permissions(&out, fs::Permissions::from_mode(mode as u32 & 0o7777))?;
            }
        }
    }
    Ok(())
}

fn skip_padding<R: Read>(reader: &mut R, misalign: usize) -> HermitResult<()> {
    if misalign == 0 {
        return Ok(());
    }
    let mut pad = [0u8; 4];
    reader.read_exact(&mut pad[..4 - misalign])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal newc cpio stream
    fn newc(entries: &[(&str, u64, &[u8])]) -> Vec<u8> {
        fn write_entry(out: &mut Vec<u8>, name: &str, mode: u64, data: &[u8]) {
            let namesize = name.len() + 1;
            write!(
                out,
                "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
                0, mode, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, namesize, 0
            )
            .unwrap();
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            for _ in 0..((4 - (110 + namesize) % 4) % 4) {
                out.push(0);
            }
            out.extend_from_slice(data);
            for _ in 0..((4 - data.len() % 4) % 4) {
                out.push(0);
            }
        }
        let mut out = Vec::new();
        for (name, mode, data) in entries {
            write_entry(&mut out, name, *mode, data);
        }
        write_entry(&mut out, "TRAILER!!!", 0, b"");
        out
    }

    #[test]
    fn reads_newc_streams() {
        let stream = newc(&[
            ("./usr", 0o040755, b""),
            ("./usr/bin", 0o040755, b""),
            ("./usr/bin/tool", 0o100755, b"#!/bin/sh\n"),
        ]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let dest = dir.join("out");
        uncpio(stream.as_slice(), Utf8Path::new("test.rpm"), &dest, 1).unwrap();
        assert_eq!(fs::read(dest.join("bin/tool")).unwrap(), b"#!/bin/sh\n");
        let mode = fs::metadata(dest.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn rejects_traversal() {
        let stream = newc(&[("../evil", 0o100644, b"x")]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let dest = dir.join("out");
        let err = uncpio(stream.as_slice(), Utf8Path::new("test.rpm"), &dest, 0).unwrap_err();
        assert!(matches!(err, HermitError::ExtractionFailed { .. }));
    }
}
