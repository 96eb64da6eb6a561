//! Bounded cache of open backing-file handles

use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use lru::LruCache;

use crate::torrent::TorrentFile;

const DEFAULT_MAX_OPEN_FILES: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(limit) => limit,
    None => unreachable!(),
};

/// Keeps recently used backing files open, keyed by their index in the
/// torrent's file list.
///
/// Evicted handles are closed and transparently re-opened on the next access.
pub struct FileHandleCache {
    root: PathBuf,
    handles: LruCache<usize, File>,
}

impl FileHandleCache {
    /// Creates a cache rooted at the download directory.
    ///
    /// A limit of zero falls back to 64 handles.
    pub fn new(root: PathBuf, max_open_files: usize) -> Self {
        let limit = NonZeroUsize::new(max_open_files).unwrap_or(DEFAULT_MAX_OPEN_FILES);
        Self {
            root,
            handles: LruCache::new(limit),
        }
    }

    /// Absolute path of a torrent file.
    pub fn path_of(&self, file: &TorrentFile) -> PathBuf {
        self.root.join(file.relative_path())
    }

    /// Returns an open read/write handle, creating the file and its parent
    /// directories when missing.
    ///
    /// # Errors
    /// - `io::Error` - Directory creation or open failed
    pub fn handle(&mut self, file_index: usize, file: &TorrentFile) -> io::Result<&mut File> {
        if !self.handles.contains(&file_index) {
            let path = self.path_of(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            tracing::trace!("Opened {}", path.display());
            self.handles.put(file_index, opened);
        }

        self.handles
            .get_mut(&file_index)
            .ok_or_else(|| io::Error::other("file handle evicted while in use"))
    }

    /// Number of handles currently open.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Closes every handle.
    pub fn clear(&mut self) {
        self.handles.clear();
    }
}
