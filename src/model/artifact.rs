//! Artifact entity.

use super::Package;
use crate::records::Entity;
use crate::types::{ArtifactKey, EntityId, Info, Timestamp, BRANCH_KEY, TIMESTAMP_KEY};
use serde::{Deserialize, Serialize};

/// One version of a package's content.
///
/// The payload is either stored under the repository root (`path` set) or
/// lives elsewhere and is reached by redirecting to `url`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Option<EntityId>,

    /// Capability token granting access to this artifact alone.
    pub key: ArtifactKey,

    /// Free-form version label ("1.2.3", "master", "stable", ...).
    pub version: String,

    /// Open metadata, never shown to unauthenticated readers.
    pub info: Option<Info>,

    /// MIME type served with the payload.
    pub content_type: Option<String>,

    /// Payload location relative to the repository root.
    pub path: Option<String>,

    /// SHA-256 of the payload at `path`, hex encoded.
    pub digest: Option<String>,

    /// External location of the payload.
    pub url: Option<String>,

    /// Name of the owning package.
    pub package: String,

    pub created: Timestamp,
    pub modified: Timestamp,
}

impl Artifact {
    /// A fresh artifact with a newly generated key and no payload.
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: None,
            key: ArtifactKey::generate(),
            version: version.into(),
            info: None,
            content_type: None,
            path: None,
            digest: None,
            url: None,
            package: package.into(),
            created: now,
            modified: now,
        }
    }

    pub fn is_local(&self) -> bool {
        self.path.as_deref().is_some_and(|path| !path.is_empty())
    }

    /// Publish time recorded in `info`, in fractional Unix seconds.
    pub fn timestamp(&self) -> Option<f64> {
        self.info.as_ref()?.get(TIMESTAMP_KEY)?.as_f64()
    }

    /// Branch recorded in `info`.
    pub fn branch(&self) -> Option<&str> {
        self.info
            .as_ref()?
            .get(BRANCH_KEY)?
            .as_str()
            .filter(|branch| !branch.is_empty())
    }

    /// Download name: `{package}-{version}.{package kind or "artifact"}`.
    pub fn file_name(&self, package: &Package) -> String {
        format!("{}-{}.{}", package.name, self.version, package.file_suffix())
    }

    /// The fields that may be shown without authentication.
    pub fn public_view(&self) -> ArtifactView {
        ArtifactView {
            package: self.package.clone(),
            version: self.version.clone(),
            content_type: self.content_type.clone(),
            is_local: self.is_local(),
            created: self.created,
            modified: self.modified,
        }
    }
}

/// Public projection of an [`Artifact`]; no key, metadata or locations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactView {
    pub package: String,
    pub version: String,
    pub content_type: Option<String>,
    pub is_local: bool,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl Entity for Artifact {
    const KIND: &'static str = "artifact";

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "key" => Some(self.key.as_str().to_string()),
            "version" => Some(self.version.clone()),
            "package" => Some(self.package.clone()),
            "content_type" => self.content_type.clone(),
            "path" => self.path.clone(),
            "url" => self.url.clone(),
            "branch" => self.branch().map(str::to_string),
            _ => None,
        }
    }

    fn required_fields() -> &'static [&'static str] {
        &["key", "version", "package"]
    }

    fn unique_fields() -> &'static [&'static str] {
        &["key"]
    }

    fn immutable_fields() -> &'static [&'static str] {
        &["key", "version", "package"]
    }
}
