//! Payload storage under the repository root.
//!
//! Payloads are plain files at `{package}/{version}`, written with a
//! temp-file-then-rename so a crash never exposes a partial payload.

mod storage;

pub use storage::BlobStore;
pub(crate) use storage::relative_string;
