//! Blob storage implementation.

use crate::error::{RepoError, Result};
use crate::paths::{PathResolver, RelativePath};
use crate::types::Digest;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::SystemTime;
use tempfile::NamedTempFile;
use walkdir::{DirEntry, WalkDir};

/// Prefix of in-flight temp files; never listed as payloads.
const TEMP_PREFIX: &str = ".depot-tmp";

/// Size and modification time of a payload file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(metadata: &fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// Cached bytes, valid while the file still carries `stamp`.
struct CachedPayload {
    stamp: FileStamp,
    contents: Vec<u8>,
}

/// Raw payload storage under the repository root.
///
/// Files hold the payload bytes verbatim, so the root can be archived and
/// restored without any knowledge of this type. The disk is authoritative:
/// cached bytes are only served while the file's size and mtime match.
pub struct BlobStore {
    resolver: PathResolver,

    /// LRU cache of recently read or written payloads.
    cache: Mutex<LruCache<RelativePath, CachedPayload>>,
}

impl BlobStore {
    /// Create blob storage rooted at the resolver's root.
    pub fn new(resolver: PathResolver, cache_size: usize) -> Result<Self> {
        fs::create_dir_all(resolver.root())?;

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            resolver,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Write a payload, replacing anything already at `path`.
    ///
    /// Bytes go to a temp file in the target directory which is synced and
    /// then renamed over the destination, so readers see either the old
    /// payload or the complete new one.
    pub fn write(&self, path: &RelativePath, content: &[u8]) -> Result<Digest> {
        let target = self.resolver.absolute(path);
        let wrap = |source: io::Error| RepoError::PayloadWrite {
            path: target.clone(),
            source,
        };

        let dir = target.parent().unwrap_or_else(|| self.root());
        fs::create_dir_all(dir).map_err(wrap)?;

        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(wrap)?;
        file.write_all(content).map_err(wrap)?;
        file.as_file().sync_all().map_err(wrap)?;
        Self::persist(file, &target).map_err(wrap)?;

        let mut cache = self.cache.lock();
        match fs::metadata(&target) {
            Ok(metadata) => {
                cache.put(
                    path.clone(),
                    CachedPayload {
                        stamp: FileStamp::of(&metadata),
                        contents: content.to_vec(),
                    },
                );
            }
            Err(_) => {
                cache.pop(path);
            }
        }

        Ok(Digest::from_bytes(content))
    }

    fn persist(file: NamedTempFile, target: &Path) -> io::Result<()> {
        file.persist(target).map(|_| ()).map_err(|e| e.error)
    }

    /// Read a payload. Returns `None` if no file exists at `path`.
    pub fn read(&self, path: &RelativePath) -> Result<Option<Vec<u8>>> {
        let full_path = self.resolver.absolute(path);

        let Some(stamp) = Self::stamp(&full_path)? else {
            self.cache.lock().pop(path);
            return Ok(None);
        };

        if let Some(cached) = self.cache.lock().get(path) {
            if cached.stamp == stamp {
                return Ok(Some(cached.contents.clone()));
            }
        }

        let Some(contents) = Self::read_file(&full_path)? else {
            self.cache.lock().pop(path);
            return Ok(None);
        };

        self.cache.lock().put(
            path.clone(),
            CachedPayload {
                stamp,
                contents: contents.clone(),
            },
        );
        Ok(Some(contents))
    }

    /// Read a payload straight from disk, bypassing the cache.
    pub fn read_uncached(&self, path: &RelativePath) -> Result<Option<Vec<u8>>> {
        Self::read_file(&self.resolver.absolute(path))
    }

    fn stamp(full_path: &Path) -> Result<Option<FileStamp>> {
        match fs::metadata(full_path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(FileStamp::of(&metadata))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_file(full_path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(full_path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a payload file exists.
    pub fn exists(&self, path: &RelativePath) -> bool {
        self.resolver.absolute(path).is_file()
    }

    /// Delete a payload file. Returns false if it was already gone.
    pub fn delete(&self, path: &RelativePath) -> Result<bool> {
        self.cache.lock().pop(path);

        match fs::remove_file(self.resolver.absolute(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every file under the root, as `/`-separated names relative to it.
    ///
    /// Names are reported as found. Files put there by hand or restored from
    /// an archive need not be valid payload locations.
    pub fn list(&self) -> Result<Vec<String>> {
        self.files()?
            .iter()
            .map(|entry| relative_string(self.root(), entry.path()))
            .collect()
    }

    /// Get total size of all files under the root.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.files()? {
            total += entry.metadata()?.len();
        }
        Ok(total)
    }

    fn files(&self) -> Result<Vec<DirEntry>> {
        let mut files = Vec::new();

        if !self.root().exists() {
            return Ok(files);
        }

        for entry in WalkDir::new(self.root()).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            files.push(entry);
        }

        Ok(files)
    }

    /// Drop all cached payloads, e.g. after the root was replaced wholesale.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

/// `/`-joined path of `path` relative to `root`.
pub(crate) fn relative_string(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        RepoError::PathTraversal(format!("{} is outside {}", path.display(), root.display()))
    })?;

    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(segments.join("/"))
}
