//! The persistent per-package database.
//!
//! A single JSON document keyed by `Reference.string()`, holding the mutable
//! state a [`crate::package::Package`] view doesn't carry: the origin ETag
//! and when the channel was last checked. Writes go through a temp file and
//! an atomic rename; serialization across processes is provided by the state
//! lock, not by this file.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::HermitResult;
use crate::SortedMap;

/// Mutable per-package state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbEntry {
    /// last ETag seen from the origin
    #[serde(default)]
    pub etag: String,
    /// when the origin was last probed for updates
    #[serde(default)]
    pub update_checked_at: Option<DateTime<Utc>>,
}

/// Handle to the single-file KV store
#[derive(Debug, Clone)]
pub struct Db {
    path: Utf8PathBuf,
}

impl Db {
    /// Open the database at `path`. The file is created lazily on first write.
    pub fn open(path: Utf8PathBuf) -> Db {
        Db { path }
    }

    fn load(&self) -> HermitResult<SortedMap<String, DbEntry>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SortedMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, entries: &SortedMap<String, DbEntry>) -> HermitResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(
            self.path.parent().unwrap_or(Utf8Path::new(".")),
        )?;
        serde_json::to_writer_pretty(&mut tmp, entries)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Fetch the entry for a reference, if any
    pub fn get(&self, reference: &str) -> HermitResult<Option<DbEntry>> {
        Ok(self.load()?.get(reference).cloned())
    }

    /// Insert or replace the entry for a reference
    pub fn set(&self, reference: &str, entry: DbEntry) -> HermitResult<()> {
        let mut entries = self.load()?;
        entries.insert(reference.to_string(), entry);
        self.store(&entries)
    }

    /// Remove the entry for a reference
    pub fn delete(&self, reference: &str) -> HermitResult<()> {
        let mut entries = self.load()?;
        if entries.remove(reference).is_some() {
            self.store(&entries)?;
        }
        Ok(())
    }

    /// Pretty-print the whole database
    pub fn dump(&self, writer: &mut dyn Write) -> HermitResult<()> {
        let entries = self.load()?;
        serde_json::to_writer_pretty(&mut *writer, &entries)?;
        writeln!(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_delete_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let db = Db::open(dir.join("db"));

        assert_eq!(db.get("go-1.20.1").unwrap(), None);

        let entry = DbEntry { etag: "e1".to_string(), update_checked_at: Some(Utc::now()) };
        db.set("go-1.20.1", entry.clone()).unwrap();
        assert_eq!(db.get("go-1.20.1").unwrap(), Some(entry));

        db.delete("go-1.20.1").unwrap();
        assert_eq!(db.get("go-1.20.1").unwrap(), None);
    }

    #[test]
    fn dump_is_valid_json() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let db = Db::open(dir.join("db"));
        db.set("node@latest", DbEntry { etag: "abc".to_string(), update_checked_at: None })
            .unwrap();

        let mut out = Vec::new();
        db.dump(&mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["node@latest"]["etag"], "abc");
    }
}
