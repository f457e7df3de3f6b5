//! On-disk LRU cache: one JSON file per entry.

use std::fs::{self, File, FileTimes};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{CacheEntry, InferenceCache};
use crate::error::GeppettoError;

const DEFAULT_MAX_SIZE: u64 = 1 << 30;
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Entries stored as `<dir>/<fingerprint>` JSON files.
///
/// Reads refresh the file's access and modification times; eviction
/// after each write removes the least recently touched files until both
/// the entry and byte bounds hold. Writes go through a temporary file
/// and a rename, so an interrupted write never leaves a partial entry.
#[derive(Debug)]
pub struct DiskCache {
    directory: PathBuf,
    max_size: u64,
    max_entries: usize,
    lock: RwLock<()>,
}

impl DiskCache {
    /// `~/.geppetto/cache/chat`, when a home directory exists.
    pub fn default_directory() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".geppetto").join("cache").join("chat"))
    }

    /// A cache in `directory`, created if missing, with default bounds
    /// (1 GiB, 10 000 entries).
    ///
    /// # Errors
    ///
    /// [`GeppettoError::Io`] if the directory cannot be created.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, GeppettoError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            max_size: DEFAULT_MAX_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
            lock: RwLock::new(()),
        })
    }

    /// Sets the total byte bound; also the largest accepted entry.
    #[must_use]
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the entry bound.
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// The cache directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Removes every entry file.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::Io`] if the directory cannot be read or a file
    /// cannot be removed.
    pub fn clear(&self) -> Result<(), GeppettoError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        for file in self.entry_files()? {
            fs::remove_file(&file.path)?;
        }
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }

    fn entry_files(&self) -> Result<Vec<EntryFile>, GeppettoError> {
        let mut files = Vec::new();
        for dirent in fs::read_dir(&self.directory)? {
            let dirent = dirent?;
            if dirent.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = dirent.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            files.push(EntryFile {
                path: dirent.path(),
                size: meta.len(),
                touched: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }

    /// Evicts oldest-first until both bounds hold. `keep` (the entry just
    /// written) is never evicted.
    fn enforce_limits(&self, keep: &Path) -> Result<(), GeppettoError> {
        let mut files = self.entry_files()?;
        files.sort_by_key(|f| f.touched);

        let mut count = files.len();
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        for file in &files {
            if count <= self.max_entries && total <= self.max_size {
                break;
            }
            if file.path == keep {
                continue;
            }
            debug!(path = %file.path.display(), "evicting cache entry");
            fs::remove_file(&file.path)?;
            count -= 1;
            total = total.saturating_sub(file.size);
        }
        Ok(())
    }
}

struct EntryFile {
    path: PathBuf,
    size: u64,
    touched: SystemTime,
}

fn touch(path: &Path) -> std::io::Result<()> {
    let now = SystemTime::now();
    File::options()
        .write(true)
        .open(path)?
        .set_times(FileTimes::new().set_accessed(now).set_modified(now))
}

fn cache_write(e: impl std::fmt::Display) -> GeppettoError {
    GeppettoError::CacheWrite(e.to_string())
}

impl InferenceCache for DiskCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, GeppettoError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let path = self.entry_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = touch(&path) {
            warn!(path = %path.display(), error = %e, "failed to update cache entry times");
        }
        match serde_json::from_slice::<CacheEntry>(&data) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "corrupt cache entry, removing");
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), GeppettoError> {
        let data = serde_json::to_vec(entry).map_err(cache_write)?;
        let size = data.len() as u64;
        if size > self.max_size {
            return Err(cache_write(format!(
                "entry size {size} exceeds maximum size {}",
                self.max_size
            )));
        }

        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let path = self.entry_path(key);
        debug!(path = %path.display(), blocks = entry.messages.len(), size, "writing cache entry");

        let mut tmp = NamedTempFile::new_in(&self.directory).map_err(cache_write)?;
        tmp.write_all(&data).map_err(cache_write)?;
        tmp.persist(&path).map_err(|e| cache_write(e.error))?;

        if let Err(e) = self.enforce_limits(&path) {
            warn!(error = %e, "failed to enforce cache limits");
        }
        Ok(())
    }
}
