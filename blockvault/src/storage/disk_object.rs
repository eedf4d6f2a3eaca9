//! `ObjectStorage` backed by a plain directory, one file per key with `/`
//! mapped to a nested path (§4.10). Useful for local testing and for small
//! archives that do not warrant a real object-store account.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::ObjectStorage;

pub struct DiskObjectStore {
    root: PathBuf,
}

impl DiskObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStorage for DiskObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(Error::NotFound(key.to_string())),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let prefix_path = self.path_for(prefix);
        let (dir, file_prefix) = if prefix.ends_with('/') || prefix.is_empty() {
            (prefix_path.clone(), String::new())
        } else {
            (
                prefix_path.parent().unwrap_or(&self.root).to_path_buf(),
                prefix_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
        };
        walk(&self.root, &dir, &file_prefix, &mut out)?;
        out.sort();
        Ok(out)
    }
}

fn walk(root: &Path, dir: &Path, file_prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, "", out)?;
        } else {
            let name = path.file_name().unwrap().to_string_lossy();
            if name.starts_with(file_prefix) {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                out.push(rel);
            }
        }
    }
    Ok(())
}
