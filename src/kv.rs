//! Byte-keyed snapshot storage backing the read-model projector.
//!
//! The contract is deliberately small: `get` and `put` on byte keys, with
//! per-key read-your-writes. No atomicity across keys is required -- each
//! projection owns its own key. [`MemoryKv`] serves tests and embedded
//! use; [`FileKv`] persists one file per key with atomic temp-then-rename
//! writes so readers never observe a partial value.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

/// Byte-keyed, byte-valued store used for projection snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()>;
}

/// In-memory [`SnapshotStore`] backed by a mutexed map.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    /// An empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the value under `key`, if any. Test hook for cache
    /// transparency checks.
    pub fn delete(&self, key: &[u8]) {
        self.entries
            .lock()
            .expect("kv mutex poisoned")
            .remove(key);
    }
}

impl SnapshotStore for MemoryKv {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .expect("kv mutex poisoned")
            .get(key)
            .cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        self.entries
            .lock()
            .expect("kv mutex poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

/// Configuration for the on-disk store: values live under
/// `<storage_dir>/<db_name>/`.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Parent directory for all databases.
    pub storage_dir: PathBuf,
    /// Name of this database's subdirectory.
    pub db_name: String,
}

/// On-disk [`SnapshotStore`]: one file per key, hex-encoded key as the
/// file name.
///
/// Writes go to a `.tmp` sibling first and are renamed into place, so a
/// crash mid-write leaves the previous value intact.
#[derive(Debug)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Open (creating if needed) the database directory.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory cannot be created.
    pub fn start(config: &KvConfig) -> io::Result<Self> {
        let dir = config.storage_dir.join(&config.db_name);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Release the store. Files stay on disk; a later [`FileKv::start`]
    /// with the same config sees them again.
    pub fn stop(self) {}

    fn path_for(&self, key: &[u8]) -> PathBuf {
        let name: String = key.iter().map(|b| format!("{b:02x}")).collect();
        self.dir.join(name)
    }
}

impl SnapshotStore for FileKv {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
