//! Main Repository struct tying all components together.

use crate::archive::{ArchiveEngine, ArchiveSummary};
use crate::blobs::BlobStore;
use crate::error::{RepoError, Result};
use crate::locks::KeyedLocks;
use crate::model::{Artifact, Package, DEFAULT_PACKAGE_KIND};
use crate::paths::{PathResolver, RelativePath};
use crate::records::{Filter, Sort, Table};
use crate::types::{ArtifactKey, Digest, Info, Timestamp, BRANCH_KEY, TIMESTAMP_KEY};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the repository root.
pub const ROOT_ENV: &str = "REPO_PATH";

/// Environment variable overriding the record data directory.
pub const DATA_PATH_ENV: &str = "REPO_DATA_PATH";

/// Repository configuration.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    /// Directory holding artifact payloads; what export and import operate on.
    pub root: PathBuf,

    /// Directory holding package and artifact records. Must not be inside `root`.
    pub data_path: PathBuf,

    /// Payload cache size (number of payloads).
    pub blob_cache_size: usize,

    /// Whether to create the repository if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("repo"),
            data_path: PathBuf::from("repo.db"),
            blob_cache_size: 256,
            create_if_missing: true,
        }
    }
}

impl RepoConfig {
    /// Defaults overridden by `REPO_PATH` and `REPO_DATA_PATH` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = env::var_os(ROOT_ENV) {
            config.root = PathBuf::from(root);
        }
        if let Some(data_path) = env::var_os(DATA_PATH_ENV) {
            config.data_path = PathBuf::from(data_path);
        }
        config
    }

    /// Root and data directory under a single base directory.
    pub fn in_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            root: base.join("repo"),
            data_path: base.join("repo.db"),
            ..Self::default()
        }
    }
}

/// Everything needed to publish one artifact.
#[derive(Clone, Debug)]
pub struct PublishRequest {
    pub package: String,
    pub version: String,

    /// Payload bytes; stored under the repository root when present.
    pub data: Option<Vec<u8>>,

    /// External location for artifacts not stored locally.
    pub url: Option<String>,

    /// Identifier for the package if this publish creates it.
    pub identifier: Option<String>,

    pub info: Option<Info>,

    /// Recorded as `info["branch"]`.
    pub branch: Option<String>,

    /// Kind for the package if this publish creates it.
    pub kind: String,

    pub content_type: Option<String>,

    /// Overwrite an existing artifact with the same version.
    pub replace: bool,
}

impl PublishRequest {
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            data: None,
            url: None,
            identifier: None,
            info: None,
            branch: None,
            kind: DEFAULT_PACKAGE_KIND.to_string(),
            content_type: None,
            replace: true,
        }
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn info(mut self, info: Info) -> Self {
        self.info = Some(info);
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }
}

/// Result of resolving an artifact for download.
#[derive(Clone, Debug, PartialEq)]
pub enum Retrieved {
    /// Payload stored under the repository root.
    Local(Download),
    /// External artifact; the caller should redirect here.
    Redirect(String),
}

/// A locally stored payload ready to serve.
#[derive(Clone, Debug, PartialEq)]
pub struct Download {
    pub contents: Vec<u8>,
    pub file_name: String,
    pub content_type: Option<String>,
}

/// Mismatches between records and the files under the root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// (package, version) of artifacts whose package does not exist.
    pub orphan_artifacts: Vec<(String, String)>,

    /// (package, version) of local artifacts whose payload file is missing.
    pub missing_payloads: Vec<(String, String)>,

    /// (package, version) of local artifacts whose payload digest differs.
    pub corrupt_payloads: Vec<(String, String)>,

    /// Files under the root that no artifact points at.
    pub untracked_files: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_artifacts.is_empty()
            && self.missing_payloads.is_empty()
            && self.corrupt_payloads.is_empty()
            && self.untracked_files.is_empty()
    }
}

/// What an archive import did, and how records line up afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOutcome {
    pub archive: ArchiveSummary,
    pub consistency: ConsistencyReport,
}

/// Repository statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoStats {
    pub package_count: u64,
    pub artifact_count: u64,
    pub payload_count: u64,
    pub payload_size_bytes: u64,
}

/// Magic bytes for the repository manifest.
const REPO_MAGIC: &[u8; 4] = b"DPT\0";

/// Current repository format version.
const REPO_VERSION: u8 = 1;

/// The artifact repository.
///
/// Provides a unified interface for:
/// - Publishing artifacts and creating their packages
/// - Resolving the latest or a specific version for download
/// - Package bookkeeping (latest pointer, branches, cascade delete)
/// - Exporting and importing the payload root as a zip archive
pub struct Repository {
    /// Repository configuration.
    config: RepoConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    resolver: PathResolver,

    /// Payload storage.
    blobs: BlobStore,

    archive: ArchiveEngine,

    packages: Table<Package>,

    artifacts: Table<Artifact>,

    /// Serializes publishes of the same (package, version).
    publish_locks: KeyedLocks<(String, String)>,

    /// Serializes package creation and package record updates.
    package_lock: Mutex<()>,

    /// Shared by publishes and reads, exclusive for deletes, archives and
    /// consistency checks.
    gate: RwLock<()>,
}

impl Repository {
    /// Open an existing repository or create a new one.
    pub fn open_or_create(config: RepoConfig) -> Result<Self> {
        if config.data_path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(RepoError::NotInitialized)
        }
    }

    /// Create a new repository.
    pub fn create(config: RepoConfig) -> Result<Self> {
        Self::check_layout(&config)?;

        fs::create_dir_all(&config.data_path)?;
        let lock_file = Self::acquire_lock(&config.data_path)?;

        if config.data_path.join("MANIFEST").exists() {
            return Err(RepoError::Config(format!(
                "{} already holds a repository",
                config.data_path.display()
            )));
        }
        Self::write_manifest(&config.data_path)?;

        let packages = Table::new(&config.data_path)?;
        let artifacts = Table::new(&config.data_path)?;

        info!(root = %config.root.display(), data = %config.data_path.display(), "created repository");
        Self::assemble(config, lock_file, packages, artifacts)
    }

    /// Open an existing repository.
    pub fn open(config: RepoConfig) -> Result<Self> {
        Self::check_layout(&config)?;
        Self::verify_manifest(&config.data_path)?;

        let lock_file = Self::acquire_lock(&config.data_path)?;

        let packages = Table::load(&config.data_path)?;
        let artifacts = Table::load(&config.data_path)?;

        debug!(
            root = %config.root.display(),
            packages = packages.count(),
            artifacts = artifacts.count(),
            "opened repository"
        );
        Self::assemble(config, lock_file, packages, artifacts)
    }

    fn assemble(
        config: RepoConfig,
        lock_file: File,
        packages: Table<Package>,
        artifacts: Table<Artifact>,
    ) -> Result<Self> {
        let resolver = PathResolver::new(&config.root);
        let blobs = BlobStore::new(resolver.clone(), config.blob_cache_size)?;
        let archive = ArchiveEngine::new(&config.root);

        Ok(Self {
            config,
            _lock_file: lock_file,
            resolver,
            blobs,
            archive,
            packages,
            artifacts,
            publish_locks: KeyedLocks::new(),
            package_lock: Mutex::new(()),
            gate: RwLock::new(()),
        })
    }

    // --- Publishing ---

    /// Publish one artifact, creating its package on first use.
    ///
    /// The payload is written before the artifact record is saved, so a
    /// failed write never leaves a record pointing at missing bytes. The
    /// package is saved before the payload is written and survives a later
    /// failure.
    pub fn publish(&self, request: PublishRequest) -> Result<Artifact> {
        let PublishRequest {
            package: name,
            version,
            data,
            url,
            identifier,
            info: mut metadata,
            branch,
            kind,
            content_type,
            replace,
        } = request;

        if name.is_empty() {
            return Err(RepoError::Validation("package name must not be empty".into()));
        }
        if version.is_empty() {
            return Err(RepoError::Validation("version must not be empty".into()));
        }

        // Resolved even for external artifacts, so that every stored pair owns
        // a distinct location and the per-pair lock is a per-file lock.
        let target = self.resolver.resolve(&name, &version)?;

        let _gate = self.gate.read();
        let _key = self.publish_locks.lock((name.clone(), version.clone()));

        let existing = self.artifacts.first(&artifact_filter(&name, &version), None);
        if existing.is_some() && !replace {
            return Err(RepoError::DuplicateArtifact {
                package: name,
                version,
            });
        }

        if let Some(branch) = branch {
            metadata
                .get_or_insert_with(Info::new)
                .insert(BRANCH_KEY.to_string(), serde_json::Value::String(branch));
        }
        if let Some(metadata) = metadata.as_mut() {
            metadata.insert(
                TIMESTAMP_KEY.to_string(),
                serde_json::json!(Timestamp::now().as_secs_f64()),
            );
        }

        self.ensure_package(&name, identifier.as_deref(), &kind)?;

        let (path, digest) = match data {
            Some(bytes) => {
                let digest = self.blobs.write(&target, &bytes)?;
                (Some(target.into_string()), Some(digest.to_hex()))
            }
            None => (None, None),
        };

        let replaced = existing.is_some();
        let mut artifact = existing.unwrap_or_else(|| Artifact::new(name.as_str(), version.as_str()));
        let previous_path = artifact.path.take();
        artifact.info = metadata;
        artifact.path = path;
        artifact.digest = digest;
        artifact.url = url;
        artifact.content_type = content_type;
        artifact.modified = Timestamp::now();
        let artifact = self.artifacts.save(artifact)?;

        // A local artifact re-published as external no longer owns its file.
        if let (Some(previous), None) = (previous_path, artifact.path.as_ref()) {
            self.discard_payload(&previous);
        }

        self.designate_latest(&name, &artifact.version)?;

        info!(
            package = %name,
            version = %artifact.version,
            local = artifact.is_local(),
            replaced,
            "published artifact"
        );
        Ok(artifact)
    }

    /// Publish uploaded file contents; new packages get kind "artifact".
    pub fn import_file(
        &self,
        package: &str,
        version: &str,
        data: impl Into<Vec<u8>>,
        content_type: Option<&str>,
        replace: bool,
    ) -> Result<Artifact> {
        let mut request = PublishRequest::new(package, version)
            .data(data)
            .kind("artifact")
            .replace(replace);
        request.content_type = content_type.map(str::to_string);
        self.publish(request)
    }

    /// Publish an external artifact; new packages get kind "artifact".
    pub fn import_url(&self, package: &str, version: &str, url: &str, replace: bool) -> Result<Artifact> {
        self.publish(
            PublishRequest::new(package, version)
                .url(url)
                .kind("artifact")
                .replace(replace),
        )
    }

    /// Publish into an existing package, recording the branch it came from.
    pub fn upload_artifact(
        &self,
        package: &str,
        version: &str,
        branch: &str,
        data: Option<Vec<u8>>,
    ) -> Result<Artifact> {
        self.package(package)?;

        let mut request = PublishRequest::new(package, version).branch(branch);
        request.data = data;
        self.publish(request)
    }

    fn ensure_package(&self, name: &str, identifier: Option<&str>, kind: &str) -> Result<Package> {
        let _guard = self.package_lock.lock();

        if let Some(package) = self.packages.first(&package_filter(name), None) {
            return Ok(package);
        }

        let package = Package::new(name, identifier.unwrap_or(name), Some(kind.to_string()));
        let package = self.persist_package(package)?;
        info!(package = %name, identifier = %package.identifier, "created package");
        Ok(package)
    }

    fn designate_latest(&self, name: &str, version: &str) -> Result<Package> {
        let _guard = self.package_lock.lock();

        let mut package = self.packages.first(&package_filter(name), None).ok_or_else(|| {
            RepoError::ReferentialInconsistency(format!("package {} vanished during publish", name))
        })?;
        package.latest = Some(version.to_string());
        self.persist_package(package)
    }

    // --- Retrieval ---

    /// Resolve an artifact for download.
    ///
    /// Without a version, the artifact with the greatest version string wins.
    /// Versions compare as plain strings, so "2.0.0" beats "10.0.0".
    pub fn retrieve(&self, package: Option<&str>, version: Option<&str>) -> Result<Retrieved> {
        let _gate = self.gate.read();
        let artifact = self.select(package, version)?;
        debug!(package = %artifact.package, version = %artifact.version, "retrieving artifact");
        self.materialize_current(artifact)
    }

    /// Resolve the single artifact a capability key grants access to.
    pub fn retrieve_by_key(&self, key: &ArtifactKey) -> Result<Retrieved> {
        let _gate = self.gate.read();
        let artifact = self.artifacts.get(&Filter::new().eq("key", key.as_str()), None)?;
        self.materialize_current(artifact)
    }

    /// The artifact `retrieve` would pick, without reading its payload.
    pub fn artifact(&self, package: Option<&str>, version: Option<&str>) -> Result<Artifact> {
        self.select(package, version)
    }

    /// Metadata of the selected artifact.
    pub fn info(&self, package: &str, version: Option<&str>) -> Result<Option<Info>> {
        Ok(self.select(Some(package), version)?.info)
    }

    /// All artifacts of a package, most recently published first.
    pub fn artifacts(&self, package: &str) -> Vec<Artifact> {
        let mut artifacts = self.artifacts.find(&Filter::new().eq("package", package), None);
        artifacts.sort_by(|a, b| {
            let a = a.timestamp().unwrap_or(f64::MIN);
            let b = b.timestamp().unwrap_or(f64::MIN);
            b.total_cmp(&a)
        });
        artifacts
    }

    /// The artifact the package's `latest` points at, if any.
    pub fn latest_artifact(&self, package: &str) -> Result<Option<Artifact>> {
        let package = self.package(package)?;
        Ok(package
            .latest
            .and_then(|latest| self.artifacts.first(&artifact_filter(&package.name, &latest), None)))
    }

    fn select(&self, package: Option<&str>, version: Option<&str>) -> Result<Artifact> {
        let filter = Filter::new()
            .eq_opt("package", package.filter(|p| !p.is_empty()))
            .eq_opt("version", version.filter(|v| !v.is_empty()));
        self.artifacts.get(&filter, Some(&Sort::desc("version")))
    }

    /// Materialize under the artifact's publish lock, so the record and its
    /// payload file are read from the same publish.
    fn materialize_current(&self, selected: Artifact) -> Result<Retrieved> {
        let _key = self
            .publish_locks
            .lock((selected.package.clone(), selected.version.clone()));

        let artifact = match selected.id {
            Some(id) => self.artifacts.get_by_id(id).unwrap_or(selected),
            None => selected,
        };
        self.materialize(&artifact)
    }

    fn materialize(&self, artifact: &Artifact) -> Result<Retrieved> {
        if !artifact.is_local() {
            return artifact
                .url
                .clone()
                .map(Retrieved::Redirect)
                .ok_or_else(|| RepoError::NoPayload {
                    package: artifact.package.clone(),
                    version: artifact.version.clone(),
                });
        }

        let package = self
            .packages
            .first(&package_filter(&artifact.package), None)
            .ok_or_else(|| {
                RepoError::ReferentialInconsistency(format!(
                    "artifact {} {} references missing package",
                    artifact.package, artifact.version
                ))
            })?;

        Ok(Retrieved::Local(Download {
            contents: self.read_payload(artifact)?,
            file_name: artifact.file_name(&package),
            content_type: artifact.content_type.clone(),
        }))
    }

    fn read_payload(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        let path = self.payload_path(artifact)?;
        let contents = self.blobs.read(&path)?;
        verify_payload(artifact, path, contents)
    }

    fn payload_path(&self, artifact: &Artifact) -> Result<RelativePath> {
        self.resolver.parse(artifact.path.as_deref().unwrap_or_default())
    }

    // --- Packages ---

    /// Explicitly create an empty package.
    pub fn create_package(&self, name: &str, identifier: Option<&str>, kind: Option<&str>) -> Result<Package> {
        self.resolver.check_package(name)?;

        let _gate = self.gate.read();
        let _guard = self.package_lock.lock();

        let package = Package::new(name, identifier.unwrap_or(name), kind.map(str::to_string));
        let package = self.persist_package(package)?;
        info!(package = %name, "created package");
        Ok(package)
    }

    pub fn package(&self, name: &str) -> Result<Package> {
        self.packages.get(&package_filter(name), None)
    }

    /// All packages, by name.
    pub fn packages(&self) -> Vec<Package> {
        self.packages.find(&Filter::new(), Some(&Sort::asc("name")))
    }

    /// Save changes to a package record, re-syncing `latest_timestamp`.
    pub fn save_package(&self, package: Package) -> Result<Package> {
        let _gate = self.gate.read();
        let _guard = self.package_lock.lock();
        self.persist_package(package)
    }

    /// Point `latest` at an existing version.
    pub fn set_latest(&self, name: &str, version: &str) -> Result<Package> {
        let _gate = self.gate.read();
        let _guard = self.package_lock.lock();

        let mut package = self.package(name)?;
        self.artifacts.get(&artifact_filter(name, version), None)?;
        package.latest = Some(version.to_string());
        self.persist_package(package)
    }

    /// Recompute the package's branch list from its artifacts.
    ///
    /// Branches appear in the order their first artifact was created.
    pub fn set_branches(&self, name: &str) -> Result<Package> {
        let _gate = self.gate.read();
        let _guard = self.package_lock.lock();

        let mut package = self.package(name)?;
        let mut branches: Vec<String> = Vec::new();
        for artifact in self.artifacts.find(&Filter::new().eq("package", name), None) {
            let Some(branch) = artifact.branch() else {
                continue;
            };
            if !branches.iter().any(|known| known == branch) {
                branches.push(branch.to_string());
            }
        }

        debug!(package = %name, branches = ?branches, "recomputed branches");
        package.branches = branches;
        self.persist_package(package)
    }

    /// Pre-save bookkeeping, then write. Callers hold `package_lock`.
    fn persist_package(&self, mut package: Package) -> Result<Package> {
        if let Some(latest) = package.latest.as_deref() {
            if let Some(artifact) = self.artifacts.first(&artifact_filter(&package.name, latest), None) {
                package.latest_timestamp = artifact.timestamp().map(|seconds| seconds as i64);
            }
        }
        package.modified = Timestamp::now();
        self.packages.save(package)
    }

    // --- Deletion ---

    /// Delete one artifact and its payload file.
    pub fn delete_artifact(&self, package: &str, version: &str) -> Result<()> {
        let _gate = self.gate.write();

        let artifact = self.artifacts.get(&artifact_filter(package, version), None)?;
        self.remove_artifact(&artifact)?;

        let _guard = self.package_lock.lock();
        if let Some(mut owner) = self.packages.first(&package_filter(package), None) {
            if owner.latest.as_deref() == Some(version) {
                owner.latest = None;
                owner.latest_timestamp = None;
                self.persist_package(owner)?;
            }
        }

        info!(package = %package, version = %version, "deleted artifact");
        Ok(())
    }

    /// Delete a package and every artifact that references it.
    ///
    /// Returns the number of artifacts removed.
    pub fn delete_package(&self, name: &str) -> Result<usize> {
        let _gate = self.gate.write();
        let _guard = self.package_lock.lock();

        let package = self.package(name)?;

        let artifacts = self.artifacts.find(&Filter::new().eq("package", name), None);
        for artifact in &artifacts {
            self.remove_artifact(artifact)?;
        }

        if let Some(id) = package.id {
            self.packages.delete(id)?;
        }

        info!(package = %name, artifacts = artifacts.len(), "deleted package");
        Ok(artifacts.len())
    }

    fn remove_artifact(&self, artifact: &Artifact) -> Result<()> {
        if let Some(id) = artifact.id {
            self.artifacts.delete(id)?;
        }
        if let Some(path) = artifact.path.as_deref() {
            self.discard_payload(path);
        }
        Ok(())
    }

    /// Remove a payload file no record points at any more.
    fn discard_payload(&self, stored: &str) {
        let removed = self
            .resolver
            .parse(stored)
            .and_then(|path| self.blobs.delete(&path));
        if let Err(e) = removed {
            warn!(path = %stored, error = %e, "failed to remove payload");
        }
    }

    // --- Archives ---

    /// Write the payload root into a zip archive at `dest`.
    pub fn export(&self, dest: impl AsRef<Path>) -> Result<ArchiveSummary> {
        let _gate = self.gate.write();
        self.archive.export(dest)
    }

    /// Export into a fresh temporary file and return its path.
    ///
    /// The file is kept; removing it is up to the caller.
    pub fn export_temp(&self) -> Result<PathBuf> {
        let temp = tempfile::Builder::new()
            .prefix("depot-")
            .suffix(".zip")
            .tempfile()?;
        let path = temp.into_temp_path().keep().map_err(|e| RepoError::Io(e.error))?;
        self.export(&path)?;
        Ok(path)
    }

    /// Restore the payload root from an archive file.
    ///
    /// Records are not touched. The returned report lists where they no
    /// longer match the restored files; reconciling is up to the operator.
    pub fn import(&self, archive: impl AsRef<Path>, empty: bool) -> Result<ImportOutcome> {
        let _gate = self.gate.write();
        let summary = self.archive.import(archive, empty);
        self.finish_import(summary)
    }

    /// Restore the payload root from archive bytes, e.g. an upload.
    pub fn import_bytes(&self, archive: Vec<u8>, empty: bool) -> Result<ImportOutcome> {
        let _gate = self.gate.write();
        let summary = self.archive.import_from(Cursor::new(archive), empty);
        self.finish_import(summary)
    }

    fn finish_import(&self, summary: Result<ArchiveSummary>) -> Result<ImportOutcome> {
        // Even a failed import may have changed files under the root.
        self.blobs.clear_cache();
        let summary = summary?;

        let consistency = self.consistency_report()?;
        if !consistency.is_clean() {
            warn!(
                orphans = consistency.orphan_artifacts.len(),
                missing = consistency.missing_payloads.len(),
                corrupt = consistency.corrupt_payloads.len(),
                untracked = consistency.untracked_files.len(),
                "records do not match imported files"
            );
        }

        Ok(ImportOutcome {
            archive: summary,
            consistency,
        })
    }

    // --- Consistency ---

    /// Compare records against each other and against the files on disk.
    ///
    /// Holds the repository gate exclusively so no publish is half done.
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        let _gate = self.gate.write();
        self.consistency_report()
    }

    fn consistency_report(&self) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        let mut tracked = HashSet::new();

        for artifact in self.artifacts.find(&Filter::new(), None) {
            let id = (artifact.package.clone(), artifact.version.clone());

            if self.packages.first(&package_filter(&artifact.package), None).is_none() {
                report.orphan_artifacts.push(id.clone());
            }

            if !artifact.is_local() {
                continue;
            }
            let Ok(path) = self.payload_path(&artifact) else {
                report.missing_payloads.push(id);
                continue;
            };
            tracked.insert(path.as_str().to_string());

            // Straight from disk; the cache must not vouch for a file.
            let contents = self.blobs.read_uncached(&path)?;
            match verify_payload(&artifact, path, contents) {
                Ok(_) => {}
                Err(RepoError::DigestMismatch { .. }) => report.corrupt_payloads.push(id),
                Err(RepoError::ReferentialInconsistency(_)) => report.missing_payloads.push(id),
                Err(e) => return Err(e),
            }
        }

        report.untracked_files = self
            .blobs
            .list()?
            .into_iter()
            .filter(|name| !tracked.contains(name))
            .collect();

        Ok(report)
    }

    // --- Repository Operations ---

    /// Get repository statistics.
    pub fn stats(&self) -> Result<RepoStats> {
        Ok(RepoStats {
            package_count: self.packages.count() as u64,
            artifact_count: self.artifacts.count() as u64,
            payload_count: self.blobs.list()?.len() as u64,
            payload_size_bytes: self.blobs.total_size()?,
        })
    }

    /// Rewrite all record tables to disk.
    pub fn sync(&self) -> Result<()> {
        self.packages.sync()?;
        self.artifacts.sync()?;
        Ok(())
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// The payload root.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    // --- Private Helpers ---

    fn check_layout(config: &RepoConfig) -> Result<()> {
        let root = comparable_path(&config.root)?;
        let data_path = comparable_path(&config.data_path)?;
        if data_path.starts_with(&root) {
            return Err(RepoError::Config(format!(
                "data path {} must not be inside the repository root {}",
                config.data_path.display(),
                config.root.display()
            )));
        }
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(REPO_MAGIC)?;
        file.write_all(&[REPO_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RepoError::NotInitialized,
            _ => RepoError::Io(e),
        })?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != REPO_MAGIC {
            return Err(RepoError::InvalidFormat("Invalid repository magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != REPO_VERSION {
            return Err(RepoError::InvalidFormat(format!(
                "Unsupported repository version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| RepoError::Locked)?;

        Ok(lock_file)
    }
}

/// Absolute form of `path` with `.` and `..` resolved and symlinks followed
/// as far as the path exists. Works for paths not created yet.
fn comparable_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other.as_os_str()),
        }
    }

    let mut existing = lexical.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            return Ok(missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part: &OsString| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(lexical.clone()),
        }
    }
}

/// Check payload bytes against the artifact that points at them.
fn verify_payload(artifact: &Artifact, path: RelativePath, contents: Option<Vec<u8>>) -> Result<Vec<u8>> {
    let contents = contents.ok_or_else(|| {
        RepoError::ReferentialInconsistency(format!(
            "payload {} of {} {} is missing",
            path, artifact.package, artifact.version
        ))
    })?;

    if let Some(expected) = &artifact.digest {
        let got = Digest::from_bytes(&contents).to_hex();
        if &got != expected {
            return Err(RepoError::DigestMismatch {
                path: path.into_string(),
                expected: expected.clone(),
                got,
            });
        }
    }
    Ok(contents)
}

fn package_filter(name: &str) -> Filter {
    Filter::new().eq("name", name)
}

fn artifact_filter(package: &str, version: &str) -> Filter {
    Filter::new().eq("package", package).eq("version", version)
}
