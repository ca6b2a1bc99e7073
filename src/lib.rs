//! # Depot
//!
//! Storage and versioning engine for an artifact repository: named packages,
//! each holding any number of versioned artifacts whose payloads live either
//! under a repository root directory or at an external URL.
//!
//! ## Core Concepts
//!
//! - **Packages**: Named collections with a `latest` pointer and branch list
//! - **Artifacts**: One version of a package, local payload or external URL
//! - **Keys**: Per-artifact capability tokens for direct retrieval
//! - **Archives**: Zip snapshots of the whole payload root
//!
//! ## Example
//!
//! ```ignore
//! use depot::{PublishRequest, RepoConfig, Repository, Retrieved};
//!
//! let repo = Repository::open_or_create(RepoConfig::from_env())?;
//!
//! // Publish a payload; the package is created on first use
//! repo.publish(PublishRequest::new("colony", "1.0.0").data(bytes).branch("master"))?;
//!
//! // Download the greatest version
//! match repo.retrieve(Some("colony"), None)? {
//!     Retrieved::Local(download) => serve(download.file_name, download.contents),
//!     Retrieved::Redirect(url) => redirect(url),
//! }
//!
//! // Snapshot the payload root
//! let archive = repo.export_temp()?;
//! ```

pub mod archive;
pub mod blobs;
pub mod error;
pub mod locks;
pub mod model;
pub mod paths;
pub mod records;
pub mod repository;
pub mod types;

// Re-exports
pub use archive::{ArchiveEngine, ArchiveSummary};
pub use blobs::BlobStore;
pub use error::{RepoError, Result};
pub use model::{Artifact, ArtifactView, Package};
pub use paths::{PathResolver, RelativePath};
pub use records::{Entity, Filter, Order, Sort, Table};
pub use repository::{
    ConsistencyReport, Download, ImportOutcome, PublishRequest, RepoConfig, RepoStats,
    Repository, Retrieved,
};
pub use types::{ArtifactKey, Digest, EntityId, Info, Timestamp};
