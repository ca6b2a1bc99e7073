//! Package entity.

use crate::records::Entity;
use crate::types::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};

/// Default `kind` given to packages created by a publish.
pub const DEFAULT_PACKAGE_KIND: &str = "package";

/// Suffix used in derived file names when a package has no kind.
pub const FALLBACK_SUFFIX: &str = "artifact";

/// A named collection of versioned artifacts.
///
/// `name` and `identifier` are unique and immutable. `latest`,
/// `latest_timestamp` and `branches` are derived caches, recomputed by the
/// repository at defined points rather than kept continuously in sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: Option<EntityId>,

    /// Human readable name; artifacts reference the package by it.
    pub name: String,

    /// Technical identifier, not meant to be readable.
    pub identifier: String,

    /// Free-form classification ("package", "artifact", ...).
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Version of the most recently designated artifact.
    pub latest: Option<String>,

    /// Publish time of the latest artifact, in whole Unix seconds.
    pub latest_timestamp: Option<i64>,

    /// Distinct branch names across the artifacts, first seen first.
    pub branches: Vec<String>,

    pub created: Timestamp,
    pub modified: Timestamp,
}

impl Package {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>, kind: Option<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: None,
            name: name.into(),
            identifier: identifier.into(),
            kind,
            latest: None,
            latest_timestamp: None,
            branches: Vec::new(),
            created: now,
            modified: now,
        }
    }

    /// Extension used for downloaded file names.
    pub fn file_suffix(&self) -> &str {
        match self.kind.as_deref() {
            Some(kind) if !kind.is_empty() => kind,
            _ => FALLBACK_SUFFIX,
        }
    }
}

impl Entity for Package {
    const KIND: &'static str = "package";

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "name" => Some(self.name.clone()),
            "identifier" => Some(self.identifier.clone()),
            "type" => self.kind.clone(),
            "latest" => self.latest.clone(),
            _ => None,
        }
    }

    fn required_fields() -> &'static [&'static str] {
        &["name", "identifier"]
    }

    fn unique_fields() -> &'static [&'static str] {
        &["name", "identifier"]
    }

    fn immutable_fields() -> &'static [&'static str] {
        &["name", "identifier"]
    }
}
