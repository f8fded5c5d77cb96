//! On-disk audio cache keyed by content ID.
//!
//! The directory itself is the index: an entry is a regular file named
//! `<id>.<ext>` and its size is the only metadata. Nothing is ever evicted.
//! Whether an entry is *playable* is decided by callers against a size
//! threshold; this module reports what is on disk, truncated files included.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::security::is_safe_content_id;

/// URL prefix the backend serves the cache directory under.
pub const CACHE_URL_PREFIX: &str = "/audio_cache";

/// One file found in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub id: String,
    pub file_name: String,
    pub size_bytes: u64,
}

/// Storage operations the resolution engine needs. The filesystem
/// implementation is the only one shipped; the trait keeps the engine
/// independent of where bytes actually live.
pub trait CacheIndex: Send + Sync {
    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.stat(id)?.is_some())
    }

    /// Size in bytes of the stored entry, or `None` when absent.
    fn stat(&self, id: &str) -> Result<Option<u64>>;

    /// Stores everything `reader` yields as the entry for `id`, fully
    /// replacing any previous content. Returns the number of bytes written.
    /// On error no entry is left behind for `id` beyond what existed before.
    fn put(&self, id: &str, reader: &mut dyn Read) -> Result<u64>;

    /// Every entry currently stored, sorted by file name.
    fn list(&self) -> Result<Vec<CacheEntry>>;

    /// URL clients use to fetch the stored entry.
    fn public_url(&self, id: &str) -> String;
}

/// [`CacheIndex`] over a flat directory.
#[derive(Debug, Clone)]
pub struct FsCacheIndex {
    root: PathBuf,
    extension: String,
}

impl FsCacheIndex {
    /// Opens the cache rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>, extension: impl Into<String>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating cache directory {}", root.display()))?;
        Ok(Self {
            root,
            extension: extension.into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(&self, id: &str) -> String {
        format!("{id}.{}", self.extension)
    }

    /// Path the entry for `id` lives at. Rejects IDs that are not a single
    /// safe path segment.
    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !is_safe_content_id(id) {
            bail!("refusing unsafe content id {id:?}");
        }
        Ok(self.root.join(self.file_name(id)))
    }
}

impl CacheIndex for FsCacheIndex {
    fn stat(&self, id: &str) -> Result<Option<u64>> {
        let path = self.path_for(id)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
        }
    }

    fn put(&self, id: &str, reader: &mut dyn Read) -> Result<u64> {
        let path = self.path_for(id)?;
        // Stage inside the cache directory so the final rename never crosses
        // filesystems. Dropping the temp file on error removes it.
        let mut staged = NamedTempFile::with_prefix_in(".partial-", &self.root)
            .with_context(|| format!("creating staging file in {}", self.root.display()))?;
        let written = io::copy(reader, staged.as_file_mut())
            .with_context(|| format!("writing audio for {id}"))?;
        staged
            .as_file_mut()
            .flush()
            .with_context(|| format!("flushing audio for {id}"))?;
        staged
            .persist(&path)
            .with_context(|| format!("moving audio into {}", path.display()))?;
        Ok(written)
    }

    fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry =
                entry.with_context(|| format!("listing cache directory {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            let size_bytes = entry
                .metadata()
                .with_context(|| format!("stat {}", path.display()))?
                .len();
            entries.push(CacheEntry {
                id: id.to_owned(),
                file_name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes,
            });
        }
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(entries)
    }

    fn public_url(&self, id: &str) -> String {
        format!("{CACHE_URL_PREFIX}/{}", self.file_name(id))
    }
}
