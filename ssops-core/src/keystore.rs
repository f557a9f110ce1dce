//! On-disk key store.
//!
//! One pair of files per key under `~/.ssops`: `<name>` holds the private
//! key record (JSON), `<name>.pub` the SPKI PEM.  Writes are durable —
//! write, flush, fsync the file, then fsync the directory — so a key that
//! has been reported as stored survives a crash immediately after.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::types::PrivateKeyRecord;

/// Store directory name under the user's home.
pub const STORE_DIR: &str = ".ssops";

#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// The default store at `$HOME/.ssops`.
    ///
    /// The directory itself may not exist yet; it is created on the first
    /// write, and its absence is only an error when reading.
    pub fn open_default() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| Error::ConfigInvalid("HOME is not set".to_string()))?;
        Ok(Self {
            root: PathBuf::from(home).join(STORE_DIR),
        })
    }

    /// A store rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a key record and its public key.
    ///
    /// Refuses to overwrite an existing key unless `force` is set (used by
    /// re-protection, where replacing the record is the point).
    pub fn write(
        &self,
        record: &PrivateKeyRecord,
        public_key_pem: &str,
        force: bool,
    ) -> Result<()> {
        check_name(&record.name)?;
        fs::create_dir_all(&self.root)?;

        let key_path = self.root.join(&record.name);
        if !force && key_path.exists() {
            return Err(Error::KeyExists(record.name.clone()));
        }

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Error::ConfigInvalid(format!("serializing key record: {e}")))?;
        write_durable(&key_path, json.as_bytes())?;
        write_durable(&pub_path(&key_path), public_key_pem.as_bytes())?;
        sync_dir(&self.root)?;

        debug!(key = %record.name, store = %self.root.display(), "stored key");
        Ok(())
    }

    /// Load a key record and its public key PEM.
    pub fn load(&self, name: &str) -> Result<(PrivateKeyRecord, String)> {
        check_name(name)?;
        if !self.root.is_dir() {
            return Err(Error::KeyStoreMissing(self.root.display().to_string()));
        }

        let key_path = self.root.join(name);
        if !key_path.is_file() {
            return Err(Error::KeyMissing(name.to_string()));
        }
        let record: PrivateKeyRecord = serde_json::from_str(&fs::read_to_string(&key_path)?)
            .map_err(|e| Error::ConfigInvalid(format!("key record {name:?}: {e}")))?;

        let pub_path = pub_path(&key_path);
        if !pub_path.is_file() {
            return Err(Error::KeyMissing(format!("{name}.pub")));
        }
        let public_key_pem = fs::read_to_string(&pub_path)?;

        Ok((record, public_key_pem))
    }

    /// Names that have both a record and a `.pub` file, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.ends_with(".pub") {
                continue;
            }
            if self.root.join(format!("{name}.pub")).is_file() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn pub_path(key_path: &Path) -> PathBuf {
    let mut os = key_path.as_os_str().to_owned();
    os.push(".pub");
    PathBuf::from(os)
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(Error::ConfigInvalid(format!("invalid key name {name:?}")));
    }
    Ok(())
}

/// Write, flush, fsync.  The caller fsyncs the directory afterwards.
fn write_durable(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}
