//! Filters and sort orders over entity fields.

use super::Entity;
use std::cmp::Ordering;

/// Conjunction of field-equality clauses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<(String, String)>,
}

impl Filter {
    /// A filter matching every entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    /// Require `field == value` when a value is given.
    pub fn eq_opt(self, field: impl Into<String>, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.eq(field, value),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches<E: Entity>(&self, entity: &E) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| entity.field(field).as_deref() == Some(value.as_str()))
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Sort on a single field.
///
/// Values compare as plain strings, byte by byte, so "10.0.0" sorts
/// before "2.0.0". Missing values sort lowest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub order: Order,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: Order::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: Order::Descending,
        }
    }

    pub fn compare<E: Entity>(&self, a: &E, b: &E) -> Ordering {
        let ordering = a.field(&self.field).cmp(&b.field(&self.field));
        match self.order {
            Order::Ascending => ordering,
            Order::Descending => ordering.reverse(),
        }
    }
}
