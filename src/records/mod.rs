//! Embedded record store.
//!
//! Entities are kept in per-kind tables that are loaded fully into memory
//! and rewritten atomically on every mutation. Lookups are field-equality
//! filters with an optional sort, which is all the repository needs.

mod query;
mod table;

pub use query::{Filter, Order, Sort};
pub use table::Table;

use crate::types::EntityId;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed record that can live in a [`Table`].
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync {
    /// Kind name, also used as the table file stem.
    const KIND: &'static str;

    /// Identifier, `None` until first saved.
    fn id(&self) -> Option<EntityId>;

    fn set_id(&mut self, id: EntityId);

    /// String value of a named field, for filtering, sorting and constraints.
    fn field(&self, name: &str) -> Option<String>;

    /// Fields that must be present and non-empty.
    fn required_fields() -> &'static [&'static str] {
        &[]
    }

    /// Fields whose value must be unique across the table.
    fn unique_fields() -> &'static [&'static str] {
        &[]
    }

    /// Fields that cannot change once saved.
    fn immutable_fields() -> &'static [&'static str] {
        &[]
    }
}
