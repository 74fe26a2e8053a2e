// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Reservierte Schlüssel.
pub const KEY_PRIVATE: &[u8] = b"private";
pub const KEY_FLEET: &[u8] = b"fleet";
pub const KEY_WINDOW: &[u8] = b"window";
const KEY_FLEET_LEGACY: &[u8] = b"fleet_id";

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Corrupt(String),
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "store io error: {e}"),
            Self::Corrupt(what) => write!(f, "store corrupt: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}
impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Byte-Keyed-Store: eine Datei pro Schlüssel, Dateinamen hex-kodiert.
/// Einzel-Key-Operationen sind nach Rückkehr dauerhaft (Tempfile + Rename,
/// optional fsync auf Datei und Verzeichnis).
pub struct ClientStore {
    dir: PathBuf,
    fsync: bool,
}

impl ClientStore {
    pub fn open<P: AsRef<Path>>(root: P, fsync: bool) -> Result<Self, StoreError> {
        let dir = root.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        if fsync {
            Self::fsync_dir(&dir)?;
        }
        let store = Self { dir, fsync };
        store.migrate_fleet_key()?;
        Ok(store)
    }

    fn fsync_dir(dir: &Path) -> Result<(), StoreError> {
        let f = OpenOptions::new().read(true).open(dir)?;
        f.sync_all()?;
        Ok(())
    }

    fn key_path(&self, key: &[u8]) -> PathBuf {
        self.dir.join(format!("{}.bin", hex::encode(key)))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let target = self.key_path(key);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value)?;
        if self.fsync {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&target)
            .map_err(|e| StoreError::Corrupt(format!("persist failed: {e}")))?;
        if self.fsync {
            let f = OpenOptions::new().read(true).open(&target)?;
            f.sync_all()?;
            Self::fsync_dir(&self.dir)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let mut f = File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    pub fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::Io(e)),
        }
        if self.fsync {
            Self::fsync_dir(&self.dir)?;
        }
        Ok(())
    }

    /// Alle Schlüssel, sortiert. `private` erscheint nie im Listing.
    pub fn list(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".bin") else {
                continue;
            };
            let key = hex::decode(stem)
                .map_err(|_| StoreError::Corrupt(format!("bad key file name: {name}")))?;
            if key == KEY_PRIVATE {
                continue;
            }
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }

    /// Liefert den Client-Schlüssel; legt beim ersten Zugriff einen an.
    pub fn ensure_private_key(&self) -> Result<[u8; 32], StoreError> {
        if let Some(raw) = self.get(KEY_PRIVATE)? {
            if raw.len() != 32 {
                return Err(StoreError::Corrupt("private key length".to_string()));
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(&raw);
            return Ok(out);
        }
        let secret = dc_crypto::generate_secret();
        self.put(KEY_PRIVATE, &secret)?;
        Ok(secret)
    }

    pub fn fleet(&self) -> Result<Option<[u8; 20]>, StoreError> {
        let Some(raw) = self.get(KEY_FLEET)? else {
            return Ok(None);
        };
        if raw.len() != 20 {
            return Err(StoreError::Corrupt("fleet address length".to_string()));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&raw);
        Ok(Some(out))
    }

    // Altbestand: `fleet_id` enthält die Adresse hex-kodiert.
    fn migrate_fleet_key(&self) -> Result<(), StoreError> {
        let Some(raw) = self.get(KEY_FLEET_LEGACY)? else {
            return Ok(());
        };
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        let stripped = text.strip_prefix("0x").unwrap_or(text);
        let addr = hex::decode(stripped)
            .map_err(|_| StoreError::Corrupt(format!("legacy fleet_id: {text}")))?;
        if addr.len() != 20 {
            return Err(StoreError::Corrupt(format!("legacy fleet_id: {text}")));
        }
        if self.get(KEY_FLEET)?.is_none() {
            self.put(KEY_FLEET, &addr)?;
        }
        self.del(KEY_FLEET_LEGACY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_del_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let store = ClientStore::open(dir.path(), false).expect("open store");
        assert!(store.get(b"k").expect("get").is_none());
        store.put(b"k", b"v1").expect("put");
        assert_eq!(store.get(b"k").expect("get").expect("some"), b"v1");
        store.put(b"k", b"v2").expect("overwrite");
        assert_eq!(store.get(b"k").expect("get").expect("some"), b"v2");
        store.del(b"k").expect("del");
        assert!(store.get(b"k").expect("get").is_none());
        // del ist idempotent
        store.del(b"k").expect("del again");
    }

    #[test]
    fn list_hides_private() {
        let dir = TempDir::new().expect("tempdir");
        let store = ClientStore::open(dir.path(), false).expect("open store");
        store.put(KEY_PRIVATE, &[1u8; 32]).expect("put private");
        store.put(b"fleet", &[2u8; 20]).expect("put fleet");
        store.put(b"bns:pi-taipei", &[3u8; 20]).expect("put bns");
        let keys = store.list().expect("list");
        assert_eq!(keys, vec![b"bns:pi-taipei".to_vec(), b"fleet".to_vec()]);
    }

    #[test]
    fn ensure_private_key_is_stable() {
        let dir = TempDir::new().expect("tempdir");
        let store = ClientStore::open(dir.path(), false).expect("open store");
        let a = store.ensure_private_key().expect("first");
        let b = store.ensure_private_key().expect("second");
        assert_eq!(a, b);
        // bleibt unsichtbar
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn migrates_legacy_fleet_id() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = ClientStore::open(dir.path(), false).expect("open store");
            store
                .put(b"fleet_id", b"0x6000000000000000000000000000000000000000")
                .expect("seed legacy");
        }
        let store = ClientStore::open(dir.path(), false).expect("reopen");
        let fleet = store.fleet().expect("fleet").expect("migrated");
        assert_eq!(fleet, {
            let mut a = [0u8; 20];
            a[0] = 0x60;
            a
        });
        assert!(store.get(b"fleet_id").expect("get").is_none());
    }

    #[test]
    fn fsync_mode_writes() {
        let dir = TempDir::new().expect("tempdir");
        let store = ClientStore::open(dir.path(), true).expect("open store fsync");
        store.put(b"window", &[9u8; 8]).expect("put");
        assert_eq!(store.get(b"window").expect("get").expect("some"), [9u8; 8]);
    }
}
