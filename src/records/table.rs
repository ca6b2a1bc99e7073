//! Persistent entity table.

use super::{Entity, Filter, Sort};
use crate::error::{RepoError, Result};
use crate::types::EntityId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Magic bytes for table files.
const TABLE_MAGIC: &[u8; 4] = b"TBL\0";

/// Current table format version.
const TABLE_VERSION: u8 = 1;

/// On-disk and in-memory contents of a table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "E: Entity")]
struct TableState<E> {
    /// Next id to assign.
    next_id: u64,

    /// All rows by id, in creation order.
    rows: BTreeMap<EntityId, E>,
}

impl<E> Default for TableState<E> {
    fn default() -> Self {
        Self {
            next_id: 1,
            rows: BTreeMap::new(),
        }
    }
}

/// A table of entities of one kind, backed by a single file.
pub struct Table<E: Entity> {
    /// Path to the table file.
    path: PathBuf,

    state: RwLock<TableState<E>>,
}

impl<E: Entity> Table<E> {
    /// Create an empty table that will persist to `dir/{KIND}.tbl`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let table = Self {
            path: Self::file_path(dir.as_ref()),
            state: RwLock::new(TableState::default()),
        };
        table.save_state(&table.state.read())?;
        Ok(table)
    }

    /// Load the table from `dir`, starting empty if no file exists yet.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = Self::file_path(dir.as_ref());
        let state = if path.exists() {
            Self::load_state(&path)?
        } else {
            TableState::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn file_path(dir: &Path) -> PathBuf {
        dir.join(format!("{}.tbl", E::KIND))
    }

    // --- Queries ---

    /// All entities matching `filter`, ordered by `sort` (creation order otherwise).
    pub fn find(&self, filter: &Filter, sort: Option<&Sort>) -> Vec<E> {
        let mut found: Vec<E> = self
            .state
            .read()
            .rows
            .values()
            .filter(|entity| filter.matches(*entity))
            .cloned()
            .collect();

        // Stable, so ties keep creation order.
        if let Some(sort) = sort {
            found.sort_by(|a, b| sort.compare(a, b));
        }
        found
    }

    /// First entity matching `filter` under `sort`, if any.
    pub fn first(&self, filter: &Filter, sort: Option<&Sort>) -> Option<E> {
        let state = self.state.read();
        let mut candidates = state.rows.values().filter(|entity| filter.matches(*entity));
        let best = match sort {
            // min_by returns the first of equal elements.
            Some(sort) => candidates.min_by(|a, b| sort.compare(*a, *b)),
            None => candidates.next(),
        };
        best.cloned()
    }

    /// Like [`Table::first`], failing with `NotFound` when nothing matches.
    pub fn get(&self, filter: &Filter, sort: Option<&Sort>) -> Result<E> {
        self.first(filter, sort)
            .ok_or_else(|| RepoError::NotFound(format!("{} matching {:?}", E::KIND, filter)))
    }

    pub fn get_by_id(&self, id: EntityId) -> Option<E> {
        self.state.read().rows.get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.state.read().rows.len()
    }

    // --- Mutations ---

    /// Validate and persist an entity, assigning an id on first save.
    pub fn save(&self, mut entity: E) -> Result<E> {
        Self::check_required(&entity)?;

        let mut state = self.state.write();

        if let Some(id) = entity.id() {
            let previous = state
                .rows
                .get(&id)
                .ok_or_else(|| RepoError::NotFound(format!("{} {}", E::KIND, id)))?;
            Self::check_immutable(previous, &entity)?;
        }
        Self::check_unique(&state, &entity)?;

        let assigned_id = match entity.id() {
            Some(id) => id,
            None => {
                let id = EntityId(state.next_id);
                state.next_id += 1;
                entity.set_id(id);
                id
            }
        };

        let previous = state.rows.insert(assigned_id, entity.clone());
        if let Err(e) = self.save_state(&state) {
            // Keep memory in step with the file we failed to write.
            match previous {
                Some(previous) => state.rows.insert(assigned_id, previous),
                None => state.rows.remove(&assigned_id),
            };
            return Err(e);
        }

        Ok(entity)
    }

    /// Delete an entity by id. Returns false if it did not exist.
    pub fn delete(&self, id: EntityId) -> Result<bool> {
        let mut state = self.state.write();
        let Some(removed) = state.rows.remove(&id) else {
            return Ok(false);
        };

        if let Err(e) = self.save_state(&state) {
            state.rows.insert(id, removed);
            return Err(e);
        }
        Ok(true)
    }

    /// Rewrite the table file from memory.
    pub fn sync(&self) -> Result<()> {
        self.save_state(&self.state.read())
    }

    // --- Constraints ---

    fn check_required(entity: &E) -> Result<()> {
        for field in E::required_fields() {
            match entity.field(field) {
                None => {
                    return Err(RepoError::Validation(format!(
                        "{}.{} must not be null",
                        E::KIND,
                        field
                    )))
                }
                Some(value) if value.is_empty() => {
                    return Err(RepoError::Validation(format!(
                        "{}.{} must not be empty",
                        E::KIND,
                        field
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn check_immutable(previous: &E, entity: &E) -> Result<()> {
        for field in E::immutable_fields() {
            let before = previous.field(field);
            if before.is_some() && before != entity.field(field) {
                return Err(RepoError::Validation(format!(
                    "{}.{} is immutable",
                    E::KIND,
                    field
                )));
            }
        }
        Ok(())
    }

    fn check_unique(state: &TableState<E>, entity: &E) -> Result<()> {
        for field in E::unique_fields() {
            let Some(value) = entity.field(field) else {
                continue;
            };
            let taken = state.rows.values().any(|other| {
                other.id() != entity.id() && other.field(field).as_deref() == Some(value.as_str())
            });
            if taken {
                return Err(RepoError::Validation(format!(
                    "{}.{} '{}' is duplicated",
                    E::KIND,
                    field,
                    value
                )));
            }
        }
        Ok(())
    }

    // --- File format ---

    fn save_state(&self, state: &TableState<E>) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;

        file.write_all(TABLE_MAGIC)?;
        file.write_all(&[TABLE_VERSION])?;

        let encoded = rmp_serde::to_vec(state)?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        file.write_all(&checksum.to_le_bytes())?;

        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| RepoError::Io(e.error))?;
        Ok(())
    }

    fn load_state(path: &Path) -> Result<TableState<E>> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TABLE_MAGIC {
            return Err(RepoError::InvalidFormat(format!(
                "Invalid table magic in {}",
                path.display()
            )));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != TABLE_VERSION {
            return Err(RepoError::InvalidFormat(format!(
                "Unsupported table version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(RepoError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: Option<EntityId>,
        name: String,
        color: Option<String>,
    }

    impl Widget {
        fn new(name: &str, color: Option<&str>) -> Self {
            Self {
                id: None,
                name: name.to_string(),
                color: color.map(str::to_string),
            }
        }
    }

    impl Entity for Widget {
        const KIND: &'static str = "widget";

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn set_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }

        fn field(&self, name: &str) -> Option<String> {
            match name {
                "name" => Some(self.name.clone()),
                "color" => self.color.clone(),
                _ => None,
            }
        }

        fn required_fields() -> &'static [&'static str] {
            &["name"]
        }

        fn unique_fields() -> &'static [&'static str] {
            &["name"]
        }

        fn immutable_fields() -> &'static [&'static str] {
            &["name"]
        }
    }

    #[test]
    fn test_save_assigns_ids() {
        let dir = TempDir::new().unwrap();
        let table = Table::<Widget>::new(dir.path()).unwrap();

        let a = table.save(Widget::new("a", None)).unwrap();
        let b = table.save(Widget::new("b", None)).unwrap();

        assert_eq!(a.id, Some(EntityId(1)));
        assert_eq!(b.id, Some(EntityId(2)));
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn test_required_and_unique() {
        let dir = TempDir::new().unwrap();
        let table = Table::<Widget>::new(dir.path()).unwrap();

        let result = table.save(Widget::new("", None));
        assert!(matches!(result, Err(RepoError::Validation(_))));

        table.save(Widget::new("a", None)).unwrap();
        let result = table.save(Widget::new("a", Some("red")));
        assert!(matches!(result, Err(RepoError::Validation(_))));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_immutable_field() {
        let dir = TempDir::new().unwrap();
        let table = Table::<Widget>::new(dir.path()).unwrap();

        let mut widget = table.save(Widget::new("a", None)).unwrap();
        widget.color = Some("blue".into());
        let mut widget = table.save(widget).unwrap();

        widget.name = "renamed".into();
        let result = table.save(widget);
        assert!(matches!(result, Err(RepoError::Validation(_))));
    }

    #[test]
    fn test_find_with_sort_is_string_ordered() {
        let dir = TempDir::new().unwrap();
        let table = Table::<Widget>::new(dir.path()).unwrap();

        for name in ["1.0.0", "2.0.0", "10.0.0"] {
            table.save(Widget::new(name, Some("x"))).unwrap();
        }

        let filter = Filter::new().eq("color", "x");
        let found = table.find(&filter, Some(&Sort::desc("name")));
        let names: Vec<_> = found.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["2.0.0", "10.0.0", "1.0.0"]);

        let first = table.first(&filter, Some(&Sort::desc("name"))).unwrap();
        assert_eq!(first.name, "2.0.0");

        let missing = table.get(&Filter::new().eq("color", "y"), None);
        assert!(matches!(missing, Err(RepoError::NotFound(_))));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let table = Table::<Widget>::new(dir.path()).unwrap();

        let widget = table.save(Widget::new("a", None)).unwrap();
        assert!(table.delete(widget.id.unwrap()).unwrap());
        assert!(!table.delete(widget.id.unwrap()).unwrap());
        assert_eq!(table.count(), 0);

        // Saving a deleted row again is an error, not a resurrection.
        assert!(matches!(table.save(widget), Err(RepoError::NotFound(_))));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let table = Table::<Widget>::new(dir.path()).unwrap();
            table.save(Widget::new("a", Some("red"))).unwrap();
            table.save(Widget::new("b", None)).unwrap();
        }

        let table = Table::<Widget>::load(dir.path()).unwrap();
        assert_eq!(table.count(), 2);
        let a = table.get(&Filter::new().eq("name", "a"), None).unwrap();
        assert_eq!(a.color.as_deref(), Some("red"));

        // Ids continue after reload.
        let c = table.save(Widget::new("c", None)).unwrap();
        assert_eq!(c.id, Some(EntityId(3)));
    }

    #[test]
    fn test_corrupted_file_detected() {
        let dir = TempDir::new().unwrap();
        {
            let table = Table::<Widget>::new(dir.path()).unwrap();
            table.save(Widget::new("a", None)).unwrap();
        }

        let path = dir.path().join("widget.tbl");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let result = Table::<Widget>::load(dir.path());
        assert!(matches!(result, Err(RepoError::ChecksumMismatch { .. })));
    }
}
