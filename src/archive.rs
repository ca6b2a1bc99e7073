//! Whole-repository snapshots as zip archives.
//!
//! Export walks the repository root and writes every directory and file,
//! with `/`-separated names relative to the root. Directories get explicit
//! `name/` entries so empty ones survive a round trip. Import optionally
//! clears the root, then extracts every entry over whatever remains.
//!
//! Neither direction looks at package or artifact records.
//!
//! A failure part-way through extraction leaves the root partially
//! extracted; entries already written stay on disk.

use crate::blobs::relative_string;
use crate::error::{RepoError, Result};
use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Counts of what an export or import touched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub directories: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Snapshots and restores a repository root.
#[derive(Clone, Debug)]
pub struct ArchiveEngine {
    root: PathBuf,
}

impl ArchiveEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the whole root into a zip archive at `dest`.
    pub fn export(&self, dest: impl AsRef<Path>) -> Result<ArchiveSummary> {
        let dest = dest.as_ref();
        if dest.starts_with(&self.root) {
            return Err(RepoError::Archive(format!(
                "refusing to write archive {} inside the repository root",
                dest.display()
            )));
        }

        fs::create_dir_all(&self.root)?;

        let file = File::create(dest)?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut summary = ArchiveSummary::default();

        for entry in WalkDir::new(&self.root).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let name = relative_string(&self.root, entry.path())?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                zip.add_directory(format!("{}/", name), options)?;
                summary.directories += 1;
            } else if file_type.is_file() {
                zip.start_file(name, options)?;
                let mut source = File::open(entry.path())?;
                summary.bytes += io::copy(&mut source, &mut zip)?;
                summary.files += 1;
            } else {
                debug!(path = %entry.path().display(), "skipping non-regular entry");
            }
        }

        zip.finish()?;

        info!(
            dest = %dest.display(),
            directories = summary.directories,
            files = summary.files,
            bytes = summary.bytes,
            "exported repository"
        );
        Ok(summary)
    }

    /// Restore the root from the archive at `archive`.
    ///
    /// With `empty`, the existing root is removed first. Every entry name is
    /// checked before anything on disk is touched; an entry that would
    /// escape the root fails the whole import.
    pub fn import(&self, archive: impl AsRef<Path>, empty: bool) -> Result<ArchiveSummary> {
        let file = File::open(archive.as_ref())?;
        self.import_from(file, empty)
    }

    /// Like [`ArchiveEngine::import`], reading from any seekable source.
    pub fn import_from<R: Read + Seek>(&self, reader: R, empty: bool) -> Result<ArchiveSummary> {
        let mut zip = ZipArchive::new(reader)?;
        let entries = Self::plan(&mut zip)?;

        if empty && self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;

        let mut summary = ArchiveSummary::default();
        for (index, relative, is_dir) in entries {
            let target = self.root.join(&relative);
            if is_dir {
                fs::create_dir_all(&target)?;
                summary.directories += 1;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut entry = zip.by_index(index)?;
            let mut out = File::create(&target)?;
            summary.bytes += io::copy(&mut entry, &mut out)?;
            summary.files += 1;
        }

        info!(
            root = %self.root.display(),
            empty,
            directories = summary.directories,
            files = summary.files,
            bytes = summary.bytes,
            "imported repository"
        );
        Ok(summary)
    }

    /// Validate every entry name up front, returning (index, path, is_dir).
    fn plan<R: Read + Seek>(zip: &mut ZipArchive<R>) -> Result<Vec<(usize, PathBuf, bool)>> {
        let mut entries = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let entry = zip.by_index(index)?;
            let relative = entry
                .enclosed_name()
                .map(Path::to_path_buf)
                .ok_or_else(|| RepoError::PathTraversal(entry.name().to_string()))?;

            // "./" style entries name the root itself.
            if relative.as_os_str().is_empty() {
                continue;
            }
            entries.push((index, relative, entry.is_dir()));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("colony")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("colony/1.0.0"), b"one").unwrap();
        fs::write(root.join("colony/2.0.0"), b"two").unwrap();
    }

    #[test]
    fn test_export_writes_directories_and_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        populate(&root);

        let engine = ArchiveEngine::new(&root);
        let archive = dir.path().join("snapshot.zip");
        let summary = engine.export(&archive).unwrap();

        assert_eq!(summary.directories, 2);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, 6);

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["colony/", "colony/1.0.0", "colony/2.0.0", "empty/"]
        );
    }

    #[test]
    fn test_export_refuses_destination_inside_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        populate(&root);

        let engine = ArchiveEngine::new(&root);
        let result = engine.export(root.join("snapshot.zip"));
        assert!(matches!(result, Err(RepoError::Archive(_))));
    }

    #[test]
    fn test_import_keeps_empty_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        populate(&root);

        let archive = dir.path().join("snapshot.zip");
        ArchiveEngine::new(&root).export(&archive).unwrap();

        let restored = dir.path().join("restored");
        ArchiveEngine::new(&restored).import(&archive, true).unwrap();

        assert!(restored.join("empty").is_dir());
        assert_eq!(fs::read(restored.join("colony/2.0.0")).unwrap(), b"two");
    }

    #[test]
    fn test_import_rejects_escaping_entries() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        populate(&root);

        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buffer);
            zip.start_file("../outside", FileOptions::default()).unwrap();
            zip.write_all(b"evil").unwrap();
            zip.finish().unwrap();
        }
        buffer.set_position(0);

        let result = ArchiveEngine::new(&root).import_from(buffer, true);
        assert!(matches!(result, Err(RepoError::PathTraversal(_))));

        // Validation happens before the root is cleared.
        assert_eq!(fs::read(root.join("colony/1.0.0")).unwrap(), b"one");
        assert!(!dir.path().join("outside").exists());
    }

    #[test]
    fn test_import_rejects_non_zip() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        populate(&root);

        let result = ArchiveEngine::new(&root).import_from(Cursor::new(b"not a zip".to_vec()), true);
        assert!(matches!(result, Err(RepoError::Archive(_))));
        assert!(root.join("colony/1.0.0").exists());
    }
}
