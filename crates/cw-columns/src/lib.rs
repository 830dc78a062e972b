#![forbid(unsafe_code)]

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use cw_formula::FormulaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColumnStoreError {
    #[error("calculated column {id} not found")]
    NotFound { id: i64 },
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error("column store backend failure: {0}")]
    Backend(String),
}

/// A stored calculated-column definition. The formula text is kept
/// verbatim; it is re-parsed and re-validated against the dataset's
/// current columns at read time, never materialized. A definition may be
/// saved before the columns it references exist, and may outlive them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedColumn {
    pub id: i64,
    pub owner_id: String,
    pub dataset_id: String,
    pub name: String,
    pub expression: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCalculatedColumn {
    pub owner_id: String,
    pub dataset_id: String,
    pub name: String,
    pub expression: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence seam for calculated columns. `delete` returns the number
/// of rows actually removed so the manager can distinguish "gone" from
/// "was never yours".
pub trait ColumnRepository {
    fn insert(&self, column: NewCalculatedColumn) -> Result<CalculatedColumn, ColumnStoreError>;

    fn list(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<CalculatedColumn>, ColumnStoreError>;

    fn delete(&self, owner_id: &str, id: i64) -> Result<usize, ColumnStoreError>;
}

/// Thin CRUD over a [`ColumnRepository`]. Saving gates on formula syntax
/// only; column existence is checked at use time.
#[derive(Debug)]
pub struct CalculatedColumnManager<R: ColumnRepository> {
    repository: R,
}

impl<R: ColumnRepository> CalculatedColumnManager<R> {
    #[must_use]
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn save(
        &self,
        owner_id: &str,
        dataset_id: &str,
        name: &str,
        expression: &str,
    ) -> Result<CalculatedColumn, ColumnStoreError> {
        cw_formula::parse(expression)?;

        self.repository.insert(NewCalculatedColumn {
            owner_id: owner_id.to_owned(),
            dataset_id: dataset_id.to_owned(),
            name: name.to_owned(),
            expression: expression.to_owned(),
            created_at: Utc::now(),
        })
    }

    pub fn list(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<CalculatedColumn>, ColumnStoreError> {
        self.repository.list(owner_id, dataset_id)
    }

    pub fn delete(&self, owner_id: &str, id: i64) -> Result<(), ColumnStoreError> {
        let affected = self.repository.delete(owner_id, id)?;
        if affected == 0 {
            return Err(ColumnStoreError::NotFound { id });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: Vec<CalculatedColumn>,
}

/// In-memory reference repository, used by tests and the in-memory
/// engine wiring.
#[derive(Debug, Default)]
pub struct MemoryColumnRepository {
    inner: RwLock<MemoryState>,
}

impl MemoryColumnRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ColumnRepository for MemoryColumnRepository {
    fn insert(&self, column: NewCalculatedColumn) -> Result<CalculatedColumn, ColumnStoreError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| ColumnStoreError::Backend("column store lock poisoned".to_owned()))?;

        state.next_id += 1;
        let stored = CalculatedColumn {
            id: state.next_id,
            owner_id: column.owner_id,
            dataset_id: column.dataset_id,
            name: column.name,
            expression: column.expression,
            created_at: column.created_at,
        };
        state.rows.push(stored.clone());
        Ok(stored)
    }

    fn list(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<CalculatedColumn>, ColumnStoreError> {
        let state = self
            .inner
            .read()
            .map_err(|_| ColumnStoreError::Backend("column store lock poisoned".to_owned()))?;

        Ok(state
            .rows
            .iter()
            .filter(|row| row.owner_id == owner_id)
            .filter(|row| dataset_id.is_none_or(|dataset| row.dataset_id == dataset))
            .cloned()
            .collect())
    }

    fn delete(&self, owner_id: &str, id: i64) -> Result<usize, ColumnStoreError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| ColumnStoreError::Backend("column store lock poisoned".to_owned()))?;

        let before = state.rows.len();
        state
            .rows
            .retain(|row| !(row.id == id && row.owner_id == owner_id));
        Ok(before - state.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{CalculatedColumnManager, ColumnStoreError, MemoryColumnRepository};

    fn manager() -> CalculatedColumnManager<MemoryColumnRepository> {
        CalculatedColumnManager::new(MemoryColumnRepository::new())
    }

    #[test]
    fn save_rejects_bad_syntax_only() {
        let manager = manager();

        let err = manager
            .save("owner-1", "ds-1", "margin", "price - (")
            .expect_err("bad syntax must fail");
        assert!(matches!(err, ColumnStoreError::Formula(_)));

        // Unknown columns are fine at save time; validity is a use-time
        // concern.
        let column = manager
            .save("owner-1", "ds-1", "margin", "future_column * 2")
            .expect("save");
        assert_eq!(column.name, "margin");
        assert_eq!(column.expression, "future_column * 2");
    }

    #[test]
    fn list_scopes_by_owner_and_dataset() {
        let manager = manager();
        manager.save("owner-1", "ds-1", "a", "x + 1").expect("save");
        manager.save("owner-1", "ds-2", "b", "x + 2").expect("save");
        manager.save("owner-2", "ds-1", "c", "x + 3").expect("save");

        assert_eq!(manager.list("owner-1", None).expect("list").len(), 2);
        assert_eq!(manager.list("owner-1", Some("ds-2")).expect("list").len(), 1);
        assert_eq!(manager.list("owner-3", None).expect("list").len(), 0);
    }

    #[test]
    fn delete_reports_not_found_for_foreign_or_missing_rows() {
        let manager = manager();
        let column = manager.save("owner-1", "ds-1", "a", "x + 1").expect("save");

        let err = manager
            .delete("owner-2", column.id)
            .expect_err("foreign owner must not delete");
        assert!(matches!(err, ColumnStoreError::NotFound { .. }));

        manager.delete("owner-1", column.id).expect("delete");
        let err = manager
            .delete("owner-1", column.id)
            .expect_err("second delete finds nothing");
        assert!(matches!(err, ColumnStoreError::NotFound { .. }));
    }
}
