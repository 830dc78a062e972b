use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use cw_columns::{CalculatedColumn, ColumnRepository, ColumnStoreError, NewCalculatedColumn};
use cw_record::Record;
use cw_types::Scalar;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};

use crate::{
    FilterOp, PageRequest, Predicate, RecordPage, RowStore, SortOrder, SortSpec, StorageError,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    dataset_id TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    fields TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_scope ON records (owner_id, dataset_id, row_index);
CREATE TABLE IF NOT EXISTS calculated_columns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    dataset_id TEXT NOT NULL,
    name TEXT NOT NULL,
    formula TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_calculated_columns_scope ON calculated_columns (owner_id, dataset_id);
";

/// SQLite reference backend. Records are stored as JSON field maps and
/// every predicate compiles to a `json_extract` lookup whose path and
/// value are both bound parameters; user-supplied strings never reach
/// the SQL text.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn guard(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("sqlite connection lock poisoned".to_owned()))
    }
}

/// JSON-path quoting for a field-map key. This is JSON-path escaping, not
/// SQL escaping: the resulting path is always bound as a parameter.
fn json_path(column: &str) -> String {
    let escaped = column.replace('\\', "\\\\").replace('"', "\\\"");
    format!("$.\"{escaped}\"")
}

fn predicate_fragment(predicate: &Predicate, params: &mut Vec<SqlValue>) -> String {
    let path = json_path(&predicate.column);
    match predicate.op {
        FilterOp::Eq => match &predicate.value {
            Scalar::Null => {
                params.push(SqlValue::Text(path));
                "json_extract(fields, ?) IS NULL".to_owned()
            }
            Scalar::Bool(value) => {
                params.push(SqlValue::Text(path));
                params.push(SqlValue::Integer(i64::from(*value)));
                "json_extract(fields, ?) = ?".to_owned()
            }
            Scalar::Number(value) => {
                params.push(SqlValue::Text(path));
                params.push(SqlValue::Real(*value));
                "json_extract(fields, ?) = ?".to_owned()
            }
            Scalar::Text(value) => {
                params.push(SqlValue::Text(path));
                params.push(SqlValue::Text(value.clone()));
                "json_extract(fields, ?) = ?".to_owned()
            }
        },
        FilterOp::Gt | FilterOp::Lt => match predicate.value.strict_number() {
            // A non-numeric bound matches nothing, same as the memory
            // backend.
            Err(_) => "0 = 1".to_owned(),
            Ok(bound) => {
                params.push(SqlValue::Text(path.clone()));
                params.push(SqlValue::Text(path));
                params.push(SqlValue::Real(bound));
                let operator = if matches!(predicate.op, FilterOp::Gt) {
                    ">"
                } else {
                    "<"
                };
                format!(
                    "(typeof(json_extract(fields, ?)) IN ('integer', 'real') AND json_extract(fields, ?) {operator} ?)"
                )
            }
        },
        FilterOp::Contains => {
            let needle = match &predicate.value {
                Scalar::Text(text) => text.clone(),
                other => other.label(),
            };
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            params.push(SqlValue::Text(needle));
            "(typeof(json_extract(fields, ?)) = 'text' AND instr(json_extract(fields, ?), ?) > 0)"
                .to_owned()
        }
    }
}

fn build_where(
    owner_id: &str,
    dataset_id: Option<&str>,
    predicates: &[Predicate],
) -> (String, Vec<SqlValue>) {
    let mut clause = String::from("owner_id = ?");
    let mut params = vec![SqlValue::Text(owner_id.to_owned())];

    if let Some(dataset) = dataset_id {
        clause.push_str(" AND dataset_id = ?");
        params.push(SqlValue::Text(dataset.to_owned()));
    }

    for predicate in predicates {
        clause.push_str(" AND ");
        clause.push_str(&predicate_fragment(predicate, &mut params));
    }

    (clause, params)
}

fn limit_param(page: &PageRequest) -> Result<i64, StorageError> {
    if page.limit() == usize::MAX {
        // SQLite treats a negative LIMIT as "no limit".
        return Ok(-1);
    }
    i64::try_from(page.limit())
        .map_err(|_| StorageError::Backend("page limit exceeds sqlite range".to_owned()))
}

impl RowStore for SqliteStore {
    fn insert_records(
        &self,
        owner_id: &str,
        dataset_id: &str,
        rows: Vec<BTreeMap<String, Scalar>>,
    ) -> Result<usize, StorageError> {
        let mut conn = self.guard()?;
        let savepoint = conn.savepoint()?;

        let mut next_index: i64 = savepoint.query_row(
            "SELECT COALESCE(MAX(row_index) + 1, 0) FROM records WHERE owner_id = ? AND dataset_id = ?",
            params![owner_id, dataset_id],
            |row| row.get(0),
        )?;

        let inserted = rows.len();
        {
            let mut statement = savepoint.prepare(
                "INSERT INTO records (owner_id, dataset_id, row_index, fields) VALUES (?, ?, ?, ?)",
            )?;
            for fields in rows {
                let payload = serde_json::to_string(&fields)?;
                statement.execute(params![owner_id, dataset_id, next_index, payload])?;
                next_index += 1;
            }
        }

        savepoint.commit()?;
        Ok(inserted)
    }

    fn fetch(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
        predicates: &[Predicate],
        sort: Option<&SortSpec>,
        page: &PageRequest,
    ) -> Result<RecordPage, StorageError> {
        let (clause, params) = build_where(owner_id, dataset_id, predicates);
        let conn = self.guard()?;

        // Independent count sharing the same predicates; never derived
        // from the page below.
        let total_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM records WHERE {clause}"),
            params_from_iter(params.iter()),
            |row| row.get(0),
        )?;

        let mut select_params = params;
        let mut sql =
            format!("SELECT id, owner_id, dataset_id, row_index, fields FROM records WHERE {clause}");
        match sort {
            Some(sort) => {
                let path = json_path(&sort.column);
                select_params.push(SqlValue::Text(path.clone()));
                select_params.push(SqlValue::Text(path));
                let direction = match sort.order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                sql.push_str(&format!(
                    " ORDER BY json_extract(fields, ?) IS NULL, json_extract(fields, ?) {direction}, id ASC"
                ));
            }
            None => sql.push_str(" ORDER BY id ASC"),
        }

        sql.push_str(" LIMIT ? OFFSET ?");
        select_params.push(SqlValue::Integer(limit_param(page)?));
        select_params.push(SqlValue::Integer(
            i64::try_from(page.offset())
                .map_err(|_| StorageError::Backend("page offset exceeds sqlite range".to_owned()))?,
        ));

        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(select_params.iter()), |row| {
            let id: i64 = row.get(0)?;
            let owner: String = row.get(1)?;
            let dataset: String = row.get(2)?;
            let index: i64 = row.get(3)?;
            let payload: String = row.get(4)?;
            Ok((id, owner, dataset, index, payload))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, owner, dataset, index, payload) = row?;
            let fields: BTreeMap<String, Scalar> = serde_json::from_str(&payload)?;
            records.push(Record::new(
                id.to_string(),
                owner,
                dataset,
                index.max(0) as u64,
                fields,
            ));
        }

        Ok(RecordPage {
            records,
            total_count: total_count.max(0) as u64,
        })
    }

    fn count(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
        predicates: &[Predicate],
    ) -> Result<u64, StorageError> {
        let (clause, params) = build_where(owner_id, dataset_id, predicates);
        let conn = self.guard()?;

        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM records WHERE {clause}"),
            params_from_iter(params.iter()),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn run_in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.guard()?.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.guard()?.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Ok(conn) = self.guard() {
                    let _ = conn.execute_batch("ROLLBACK");
                }
                Err(err)
            }
        }
    }
}

fn backend_err(err: impl std::fmt::Display) -> ColumnStoreError {
    ColumnStoreError::Backend(err.to_string())
}

impl ColumnRepository for SqliteStore {
    fn insert(&self, column: NewCalculatedColumn) -> Result<CalculatedColumn, ColumnStoreError> {
        let conn = self.guard().map_err(backend_err)?;

        conn.execute(
            "INSERT INTO calculated_columns (owner_id, dataset_id, name, formula, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                column.owner_id,
                column.dataset_id,
                column.name,
                column.expression,
                column.created_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;

        Ok(CalculatedColumn {
            id: conn.last_insert_rowid(),
            owner_id: column.owner_id,
            dataset_id: column.dataset_id,
            name: column.name,
            expression: column.expression,
            created_at: column.created_at,
        })
    }

    fn list(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<CalculatedColumn>, ColumnStoreError> {
        let conn = self.guard().map_err(backend_err)?;

        let mut sql = String::from(
            "SELECT id, owner_id, dataset_id, name, formula, created_at FROM calculated_columns WHERE owner_id = ?",
        );
        let mut params = vec![SqlValue::Text(owner_id.to_owned())];
        if let Some(dataset) = dataset_id {
            sql.push_str(" AND dataset_id = ?");
            params.push(SqlValue::Text(dataset.to_owned()));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut statement = conn.prepare(&sql).map_err(backend_err)?;
        let rows = statement
            .query_map(params_from_iter(params.iter()), |row| {
                let created_at: String = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    created_at,
                ))
            })
            .map_err(backend_err)?;

        let mut columns = Vec::new();
        for row in rows {
            let (id, owner, dataset, name, expression, created_at) = row.map_err(backend_err)?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(backend_err)?
                .with_timezone(&Utc);
            columns.push(CalculatedColumn {
                id,
                owner_id: owner,
                dataset_id: dataset,
                name,
                expression,
                created_at,
            });
        }
        Ok(columns)
    }

    fn delete(&self, owner_id: &str, id: i64) -> Result<usize, ColumnStoreError> {
        let conn = self.guard().map_err(backend_err)?;
        conn.execute(
            "DELETE FROM calculated_columns WHERE owner_id = ? AND id = ?",
            params![owner_id, id],
        )
        .map_err(backend_err)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cw_columns::{CalculatedColumnManager, ColumnStoreError};
    use cw_types::Scalar;

    use super::SqliteStore;
    use crate::{FilterOp, MemoryRowStore, PageRequest, Predicate, RowStore, SortSpec};

    fn row(pairs: Vec<(&str, Scalar)>) -> BTreeMap<String, Scalar> {
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect()
    }

    fn seed(store: &impl RowStore) {
        store
            .insert_records(
                "owner-1",
                "ds-1",
                vec![
                    row(vec![
                        ("name", "beta".into()),
                        ("price", 20.0.into()),
                        ("city", "Amsterdam".into()),
                    ]),
                    row(vec![
                        ("name", "alpha".into()),
                        ("price", "10".into()),
                        ("city", "Rotterdam".into()),
                    ]),
                    row(vec![("name", "gamma".into()), ("price", Scalar::Null)]),
                ],
            )
            .expect("seed");
    }

    #[test]
    fn sqlite_predicates_match_memory_backend_semantics() {
        let sqlite = SqliteStore::open_in_memory().expect("open");
        let memory = MemoryRowStore::new();
        seed(&sqlite);
        seed(&memory);

        let cases = vec![
            Predicate::new("price", FilterOp::Gt, 15.0),
            Predicate::new("price", FilterOp::Lt, "15"),
            Predicate::new("price", FilterOp::Eq, Scalar::Null),
            Predicate::new("name", FilterOp::Eq, "alpha"),
            Predicate::new("city", FilterOp::Contains, "sterdam"),
            Predicate::new("city", FilterOp::Contains, "STERDAM"),
            Predicate::new("price", FilterOp::Gt, "not a number"),
        ];

        for predicate in cases {
            let lhs = sqlite
                .count("owner-1", Some("ds-1"), std::slice::from_ref(&predicate))
                .expect("sqlite count");
            let rhs = memory
                .count("owner-1", Some("ds-1"), std::slice::from_ref(&predicate))
                .expect("memory count");
            assert_eq!(lhs, rhs, "predicate diverged: {predicate:?}");
        }
    }

    #[test]
    fn sqlite_sorted_page_matches_memory_backend() {
        let sqlite = SqliteStore::open_in_memory().expect("open");
        let memory = MemoryRowStore::new();
        seed(&sqlite);
        seed(&memory);

        let page = PageRequest::new(1, 2).expect("page");
        let sort = SortSpec::asc("name");

        let lhs = sqlite
            .fetch("owner-1", Some("ds-1"), &[], Some(&sort), &page)
            .expect("sqlite fetch");
        let rhs = memory
            .fetch("owner-1", Some("ds-1"), &[], Some(&sort), &page)
            .expect("memory fetch");

        assert_eq!(lhs.total_count, rhs.total_count);
        let lhs_names: Vec<Scalar> = lhs
            .records
            .iter()
            .map(|record| record.field_or_null("name"))
            .collect();
        let rhs_names: Vec<Scalar> = rhs
            .records
            .iter()
            .map(|record| record.field_or_null("name"))
            .collect();
        assert_eq!(lhs_names, rhs_names);
    }

    #[test]
    fn calculated_columns_round_trip_through_sqlite() {
        let store = SqliteStore::open_in_memory().expect("open");
        let manager = CalculatedColumnManager::new(store);

        let saved = manager
            .save("owner-1", "ds-1", "total", "price * quantity")
            .expect("save");
        let listed = manager.list("owner-1", Some("ds-1")).expect("list");
        assert_eq!(listed, vec![saved.clone()]);

        manager.delete("owner-1", saved.id).expect("delete");
        assert!(matches!(
            manager.delete("owner-1", saved.id),
            Err(ColumnStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chartwell.db");

        {
            let store = SqliteStore::open(&path).expect("open");
            seed(&store);
        }

        let reopened = SqliteStore::open(&path).expect("reopen");
        let count = reopened.count("owner-1", Some("ds-1"), &[]).expect("count");
        assert_eq!(count, 3);
    }
}
