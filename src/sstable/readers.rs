//! Reference-counted file-descriptor cache for SSTable readers.
//!
//! All readers of one file share a single descriptor, keyed by the
//! canonicalized path. A descriptor whose last reader is dropped is not
//! closed immediately: its path joins a FIFO release queue bounded by
//! `cache_size`, and only entries evicted from that queue while still at
//! refcount zero are closed. A path reacquired while queued keeps its
//! descriptor.
//!
//! Readers use positioned reads exclusively, so the shared descriptor has
//! no cursor to race on. Eviction is cooperative: a descriptor is never
//! closed mid-use.

use super::reader::SSTableReader;
use crate::error::{Error, Result};

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct ReaderManager {
    shared: Arc<Mutex<Shared>>,
    cache_size: usize,
}

pub(crate) struct Shared {
    fd_mapping: HashMap<PathBuf, FdEntry>,
    release_queue: VecDeque<PathBuf>,
    cache_size: usize,
}

struct FdEntry {
    refcount: u32,
    file: Arc<File>,
}

impl ReaderManager {
    pub fn new(cache_size: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                fd_mapping: HashMap::new(),
                release_queue: VecDeque::new(),
                cache_size,
            })),
            cache_size,
        }
    }

    /// Open a reader over the file, reusing the cached descriptor when one
    /// exists. Failure to open an expected file is fatal.
    pub fn create_reader(&self, path: &Path) -> Result<SSTableReader> {
        let canonical = path
            .canonicalize()
            .map_err(|e| Error::IO(format!("can't open sstable {}: {e}", path.display())))?;

        let file = {
            let mut shared = self.shared.lock()?;
            match shared.fd_mapping.get_mut(&canonical) {
                Some(entry) => {
                    entry.refcount += 1;
                    Arc::clone(&entry.file)
                }
                None => {
                    let file = File::open(&canonical).map_err(|e| {
                        Error::IO(format!("can't open sstable {}: {e}", canonical.display()))
                    })?;
                    let file = Arc::new(file);
                    shared.fd_mapping.insert(
                        canonical.clone(),
                        FdEntry {
                            refcount: 1,
                            file: Arc::clone(&file),
                        },
                    );
                    file
                }
            }
        };

        match SSTableReader::open(file, canonical.clone(), Arc::clone(&self.shared)) {
            Ok(reader) => Ok(reader),
            Err(err) => {
                // the reader was never constructed, undo its refcount
                release(&self.shared, &canonical);
                Err(err)
            }
        }
    }

    /// Close the cached descriptor, if any, and remove the file from disk.
    /// The caller guarantees no reader is live over it.
    pub fn unlink(&self, path: &Path) -> Result<()> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.shared.lock()?.fd_mapping.remove(&canonical);
        std::fs::remove_file(&canonical)?;
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, path: &Path) -> Option<u32> {
        let canonical = path.canonicalize().ok()?;
        let shared = self.shared.lock().ok()?;
        shared.fd_mapping.get(&canonical).map(|e| e.refcount)
    }

    #[cfg(test)]
    pub(crate) fn cached_paths(&self) -> usize {
        self.shared.lock().map(|s| s.fd_mapping.len()).unwrap_or(0)
    }
}

/// Drop one reference to a path. At refcount zero the path is queued for
/// release, and the queue is trimmed back to the cache bound, closing any
/// evicted descriptor that was not reacquired in the meantime.
pub(crate) fn release(shared: &Mutex<Shared>, path: &Path) {
    let Ok(mut shared) = shared.lock() else {
        return;
    };
    let Some(entry) = shared.fd_mapping.get_mut(path) else {
        return;
    };
    entry.refcount -= 1;
    if entry.refcount > 0 {
        return;
    }
    shared.release_queue.push_back(path.to_path_buf());
    while shared.release_queue.len() > shared.cache_size {
        let Some(candidate) = shared.release_queue.pop_front() else {
            break;
        };
        if shared
            .fd_mapping
            .get(&candidate)
            .is_some_and(|entry| entry.refcount == 0)
        {
            shared.fd_mapping.remove(&candidate);
        }
    }
}
