#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;

use cw_record::Record;
use cw_types::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod csv_load;
mod memory;
#[cfg(feature = "sql-sqlite")]
mod sqlite;

pub use csv_load::read_csv_rows;
pub use memory::MemoryRowStore;
#[cfg(feature = "sql-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid pagination: page must be >= 1 and limit must be > 0 (page={page}, limit={limit})")]
    InvalidPagination { page: usize, limit: usize },
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "sql-sqlite")]
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("backing store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Gt,
    Lt,
    Contains,
}

/// One bound filter clause. The column name and value are opaque data:
/// every backend translates them through parameter binding (or structural
/// matching), never through string concatenation into a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: FilterOp,
    pub value: Scalar,
}

impl Predicate {
    #[must_use]
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Scalar>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Structural predicate semantics, shared by the in-memory backend
    /// and mirrored by the SQLite translation:
    /// - `Eq`: exact scalar match; a null value matches null or absent.
    /// - `Gt`/`Lt`: numeric comparison; the predicate value is cast to
    ///   numeric first, and only actually-numeric fields participate.
    /// - `Contains`: case-sensitive substring over text fields.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self.op {
            FilterOp::Eq => record.field_or_null(&self.column) == self.value,
            FilterOp::Gt | FilterOp::Lt => {
                let Ok(bound) = self.value.strict_number() else {
                    return false;
                };
                match record.field(&self.column) {
                    Some(Scalar::Number(actual)) if actual.is_finite() => {
                        if matches!(self.op, FilterOp::Gt) {
                            *actual > bound
                        } else {
                            *actual < bound
                        }
                    }
                    _ => false,
                }
            }
            FilterOp::Contains => {
                let needle = match &self.value {
                    Scalar::Text(text) => text.clone(),
                    other => other.label(),
                };
                matches!(record.field(&self.column), Some(Scalar::Text(haystack)) if haystack.contains(&needle))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub column: String,
    pub order: SortOrder,
}

impl SortSpec {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Asc,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Validated pagination window. `page` is 1-based;
/// `offset = (page - 1) * limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: usize,
    limit: usize,
}

impl PageRequest {
    pub fn new(page: usize, limit: usize) -> Result<Self, StorageError> {
        if page < 1 || limit == 0 {
            return Err(StorageError::InvalidPagination { page, limit });
        }
        Ok(Self { page, limit })
    }

    /// A single unbounded page, for scans that apply their own caps
    /// (chart extraction under the optimization policy).
    #[must_use]
    pub fn all() -> Self {
        Self {
            page: 1,
            limit: usize::MAX,
        }
    }

    #[must_use]
    pub fn page(&self) -> usize {
        self.page
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub total_count: u64,
}

/// The row-store collaborator boundary. `fetch` returns one page plus a
/// total count obtained independently of the page (never from the page's
/// own length). `run_in_transaction` is the all-or-nothing wrapper for
/// multi-statement writes. This layer performs no retries; a failing
/// backend surfaces verbatim as [`StorageError`].
pub trait RowStore {
    fn insert_records(
        &self,
        owner_id: &str,
        dataset_id: &str,
        rows: Vec<BTreeMap<String, Scalar>>,
    ) -> Result<usize, StorageError>;

    fn fetch(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
        predicates: &[Predicate],
        sort: Option<&SortSpec>,
        page: &PageRequest,
    ) -> Result<RecordPage, StorageError>;

    fn count(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
        predicates: &[Predicate],
    ) -> Result<u64, StorageError>;

    fn run_in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StorageError>,
    ) -> Result<T, StorageError>
    where
        Self: Sized;
}

/// Sort comparator over optional field values: missing values sort last
/// in both directions, numbers compare numerically, text
/// lexicographically, and mixed dtypes by a fixed dtype rank.
#[must_use]
pub fn compare_fields(
    left: Option<&Scalar>,
    right: Option<&Scalar>,
    order: SortOrder,
) -> Ordering {
    let left_missing = left.is_none_or(Scalar::is_missing);
    let right_missing = right.is_none_or(Scalar::is_missing);

    match (left_missing, right_missing) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    let (Some(left), Some(right)) = (left, right) else {
        return Ordering::Equal;
    };

    let ordering = match (left, right) {
        (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
        (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
        (a, b) => dtype_rank(a).cmp(&dtype_rank(b)),
    };

    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

fn dtype_rank(value: &Scalar) -> u8 {
    match value {
        Scalar::Null => 3,
        Scalar::Bool(_) => 0,
        Scalar::Number(_) => 1,
        Scalar::Text(_) => 2,
    }
}
