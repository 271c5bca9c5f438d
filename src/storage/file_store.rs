// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Filesystem operations for one tenant.
//!
//! Plain blocking I/O. JSON records and raw parts are both written to a
//! sibling `.tmp` file first and renamed into place, so a reader never sees a
//! half-written header.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use super::TenantPaths;

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    Json(serde_json::Error),
    NotFound(String),
    AlreadyExists(String),
    /// A part name that would escape the file directory.
    InvalidPartName(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
            StorageError::Json(e) => write!(f, "JSON error: {e}"),
            StorageError::NotFound(entity) => write!(f, "Not found: {entity}"),
            StorageError::AlreadyExists(entity) => write!(f, "Already exists: {entity}"),
            StorageError::InvalidPartName(name) => write!(f, "Invalid part name: {name}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Json(e)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Tenant-scoped file store.
#[derive(Debug, Clone)]
pub struct FileStore {
    paths: TenantPaths,
}

impl FileStore {
    /// Open the store, creating the tenant directory layout if needed.
    pub fn open(paths: TenantPaths) -> StorageResult<Self> {
        for dir in [
            paths.drives_dir(),
            paths.temp_root(),
            paths.clients_dir(),
            paths.connections_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &TenantPaths {
        &self.paths
    }

    /// Write, read back and delete a probe file.
    pub fn health_check(&self) -> StorageResult<()> {
        let probe = self.paths.root().join(".health_check");
        let data = b"health_check_data";
        fs::write(&probe, data)?;
        let read = fs::read(&probe)?;
        fs::remove_file(&probe)?;
        if read != data {
            return Err(StorageError::Io(io::Error::other("health check data mismatch")));
        }
        Ok(())
    }

    // ========== JSON Records ==========

    pub fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> StorageResult<T> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Like [`FileStore::read_json`] but a missing file is `None`.
    pub fn try_read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> StorageResult<Option<T>> {
        match self.read_json(path) {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_json<T: Serialize>(&self, path: impl AsRef<Path>, value: &T) -> StorageResult<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let temp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            serde_json::to_writer(&mut writer, value)?;
            writer.flush()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    // ========== Raw Parts ==========

    pub fn write_raw(&self, path: impl AsRef<Path>, data: &[u8]) -> StorageResult<u64> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let temp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            writer.write_all(data)?;
            writer.flush()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(data.len() as u64)
    }

    pub fn read_raw(&self, path: impl AsRef<Path>) -> StorageResult<Vec<u8>> {
        Ok(fs::read(path.as_ref())?)
    }

    /// Move a file, creating the destination directory.
    pub fn move_file(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> StorageResult<()> {
        let to = to.as_ref();
        ensure_parent(to)?;
        fs::rename(from.as_ref(), to)?;
        Ok(())
    }

    // ========== Directory Operations ==========

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    pub fn delete(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        fs::remove_file(path.as_ref())?;
        Ok(())
    }

    /// Remove a directory tree. A missing directory is not an error.
    pub fn delete_dir(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        match fs::remove_dir_all(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stems of files in `dir` with the given extension.
    pub fn list_files(&self, dir: impl AsRef<Path>, extension: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries(dir.as_ref(), false)?
            .into_iter()
            .filter_map(|name| {
                let path = Path::new(&name);
                (path.extension()? == extension)
                    .then(|| path.file_stem()?.to_str().map(str::to_string))
                    .flatten()
            })
            .collect())
    }

    /// Names of every regular file in `dir`.
    pub fn list_file_names(&self, dir: impl AsRef<Path>) -> StorageResult<Vec<String>> {
        self.entries(dir.as_ref(), false)
    }

    pub fn list_dirs(&self, dir: impl AsRef<Path>) -> StorageResult<Vec<String>> {
        self.entries(dir.as_ref(), true)
    }

    fn entries(&self, dir: &Path, dirs: bool) -> StorageResult<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let wanted = if dirs { path.is_dir() } else { path.is_file() };
            if wanted {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

fn ensure_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let paths = TenantPaths::new(dir.path(), &"frodo.dotyou.cloud".parse().unwrap());
        let store = FileStore::open(paths).unwrap();
        (dir, store)
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Record {
        id: String,
        value: i32,
    }

    #[test]
    fn open_creates_layout() {
        let (_dir, store) = test_store();
        assert!(store.paths().drives_dir().is_dir());
        assert!(store.paths().temp_root().is_dir());
        assert!(store.paths().connections_dir().is_dir());
    }

    #[test]
    fn write_and_read_json() {
        let (_dir, store) = test_store();
        let record = Record {
            id: "r-1".to_string(),
            value: 42,
        };
        let path = store.paths().clients_dir().join("r-1.json");
        store.write_json(&path, &record).unwrap();

        let read: Record = store.read_json(&path).unwrap();
        assert_eq!(read, record);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_json_is_none() {
        let (_dir, store) = test_store();
        let read: Option<Record> = store
            .try_read_json(store.paths().clients_dir().join("nope.json"))
            .unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn raw_parts_and_moves() {
        let (_dir, store) = test_store();
        let from = store.paths().temp_root().join("a").join("part");
        let to = store.paths().drives_dir().join("b").join("part");

        assert_eq!(store.write_raw(&from, b"\x00\x01bytes").unwrap(), 7);
        store.move_file(&from, &to).unwrap();

        assert!(!store.exists(&from));
        assert_eq!(store.read_raw(&to).unwrap(), b"\x00\x01bytes");
    }

    #[test]
    fn listing_filters_by_kind() {
        let (_dir, store) = test_store();
        let dir = store.paths().connections_dir();
        store.write_json(dir.join("sam.dotyou.cloud.json"), &1).unwrap();
        store.write_raw(dir.join("notes.txt"), b"x").unwrap();
        fs::create_dir_all(dir.join("nested")).unwrap();

        assert_eq!(store.list_files(&dir, "json").unwrap(), vec!["sam.dotyou.cloud"]);
        assert_eq!(store.list_file_names(&dir).unwrap().len(), 2);
        assert_eq!(store.list_dirs(&dir).unwrap(), vec!["nested"]);
    }

    #[test]
    fn delete_dir_is_idempotent() {
        let (_dir, store) = test_store();
        let target = store.paths().temp_root().join("gone");
        store.write_raw(target.join("x"), b"1").unwrap();
        store.delete_dir(&target).unwrap();
        store.delete_dir(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn health_check_works() {
        let (_dir, store) = test_store();
        store.health_check().unwrap();
    }
}
