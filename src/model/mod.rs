//! Package and artifact entities.

mod artifact;
mod package;

pub use artifact::{Artifact, ArtifactView};
pub use package::{Package, DEFAULT_PACKAGE_KIND, FALLBACK_SUFFIX};
