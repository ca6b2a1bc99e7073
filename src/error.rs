//! Error types for the artifact repository.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicated artifact: {package} {version}")]
    DuplicateArtifact { package: String, version: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Path escapes the repository root: {0}")]
    PathTraversal(String),

    #[error("Failed to write payload at {}: {source}", path.display())]
    PayloadWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact {package} {version} has neither a stored payload nor a URL")]
    NoPayload { package: String, version: String },

    #[error("Referential inconsistency: {0}")]
    ReferentialInconsistency(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Payload digest mismatch for {path}: expected {expected}, got {got}")]
    DigestMismatch {
        path: String,
        expected: String,
        got: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Repository is locked by another process")]
    Locked,

    #[error("Repository not initialized")]
    NotInitialized,
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RepoError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RepoError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RepoError::Deserialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for RepoError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => RepoError::Io(io),
            other => RepoError::Archive(other.to_string()),
        }
    }
}

impl From<walkdir::Error> for RepoError {
    fn from(e: walkdir::Error) -> Self {
        RepoError::Io(e.into())
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepoError>;
