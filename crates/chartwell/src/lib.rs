#![forbid(unsafe_code)]

//! Chartwell is a tabular analytics engine for uploaded datasets whose
//! columns are not known in advance. It parses and evaluates arithmetic
//! formulas over named, possibly-missing fields, serves filtered, sorted,
//! paginated table views, and projects matching rows into chart-ready
//! series with a size-based optimization policy.
//!
//! The [`AnalyticsEngine`] facade wires a row store, a sampling column
//! catalog, and a calculated-column repository into the operations a
//! service layer consumes. Everything underneath is dependency-injected
//! and stateless per call.

pub use cw_catalog::{CatalogError, ColumnCatalog, DEFAULT_SAMPLE_SIZE, SampledCatalog};
pub use cw_chart::{
    Aggregation, ChartDataset, ChartError, ChartPoint, ChartProjector, ChartRequest, ChartSeries,
    ChartType, ChartValidation, SERIES_PALETTE,
};
pub use cw_columns::{
    CalculatedColumn, CalculatedColumnManager, ColumnRepository, ColumnStoreError,
    MemoryColumnRepository,
};
pub use cw_formula::{
    DEFAULT_PREVIEW_ROWS, EvalError, ExecutionResult, Formula, FormulaError, FormulaPreview,
    ValidationReport,
};
pub use cw_policy::{Decision, DecisionLog, ScanAction, ScanPolicy};
pub use cw_query::{DEFAULT_PAGE_LIMIT, QueryError, QueryOptions, QueryPlanner, UserDataPage};
pub use cw_record::{ColumnDescriptor, Record, RecordError};
pub use cw_store::{
    FilterOp, MemoryRowStore, PageRequest, Predicate, RecordPage, RowStore, SortOrder, SortSpec,
    StorageError, read_csv_rows,
};
#[cfg(feature = "sql-sqlite")]
pub use cw_store::SqliteStore;
pub use cw_types::{DType, Scalar, TypeError};

use std::collections::BTreeMap;

/// The operations boundary consumed by the surrounding service layer
/// (HTTP routing, sessions, and ingestion live outside this crate).
#[derive(Debug)]
pub struct AnalyticsEngine<S: RowStore, R: ColumnRepository> {
    store: S,
    columns: CalculatedColumnManager<R>,
    policy: ScanPolicy,
}

impl AnalyticsEngine<MemoryRowStore, MemoryColumnRepository> {
    /// Engine over the in-memory reference backends.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryRowStore::new(), MemoryColumnRepository::new())
    }
}

#[cfg(feature = "sql-sqlite")]
impl AnalyticsEngine<SqliteStore, SqliteStore> {
    /// Engine over a SQLite file; records and calculated columns share
    /// one connection.
    pub fn open_sqlite(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let store = SqliteStore::open(path)?;
        Ok(Self::new(store.clone(), store))
    }

    pub fn sqlite_in_memory() -> Result<Self, StorageError> {
        let store = SqliteStore::open_in_memory()?;
        Ok(Self::new(store.clone(), store))
    }
}

impl<S: RowStore, R: ColumnRepository> AnalyticsEngine<S, R> {
    #[must_use]
    pub fn new(store: S, repository: R) -> Self {
        Self {
            store,
            columns: CalculatedColumnManager::new(repository),
            policy: ScanPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(store: S, repository: R, policy: ScanPolicy) -> Self {
        Self {
            store,
            columns: CalculatedColumnManager::new(repository),
            policy,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    // ── Ingestion glue ──────────────────────────────────────────────

    /// Insert pre-parsed rows atomically.
    pub fn insert_records(
        &self,
        owner_id: &str,
        dataset_id: &str,
        rows: Vec<BTreeMap<String, Scalar>>,
    ) -> Result<usize, StorageError> {
        self.store
            .run_in_transaction(|store| store.insert_records(owner_id, dataset_id, rows))
    }

    /// Parse a CSV upload and insert its rows atomically.
    pub fn ingest_csv(
        &self,
        owner_id: &str,
        dataset_id: &str,
        input: &str,
    ) -> Result<usize, StorageError> {
        let rows = read_csv_rows(input)?;
        self.insert_records(owner_id, dataset_id, rows)
    }

    // ── Formulas ────────────────────────────────────────────────────

    pub fn parse_formula(&self, expression: &str) -> Result<Formula, FormulaError> {
        cw_formula::parse(expression)
    }

    /// Validate a formula string against a known column set. Syntax
    /// errors surface as a failed report rather than a hard error, since
    /// the caller is asking "is this usable", not "run this".
    #[must_use]
    pub fn validate_formula(&self, expression: &str, known_columns: &[String]) -> ValidationReport {
        match cw_formula::parse(expression) {
            Ok(formula) => cw_formula::validate(&formula, known_columns),
            Err(err) => ValidationReport {
                is_valid: false,
                errors: vec![err.to_string()],
                warnings: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn execute_formula(&self, formula: &Formula, records: &[Record]) -> ExecutionResult {
        cw_formula::execute(formula, records)
    }

    pub fn formula_preview(
        &self,
        expression: &str,
        records: &[Record],
        known_columns: &[String],
        limit: Option<usize>,
    ) -> Result<FormulaPreview, FormulaError> {
        cw_formula::preview(expression, records, known_columns, limit)
    }

    // ── Calculated columns ──────────────────────────────────────────

    pub fn save_calculated_column(
        &self,
        owner_id: &str,
        dataset_id: &str,
        name: &str,
        expression: &str,
    ) -> Result<CalculatedColumn, ColumnStoreError> {
        self.columns.save(owner_id, dataset_id, name, expression)
    }

    pub fn list_calculated_columns(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<CalculatedColumn>, ColumnStoreError> {
        self.columns.list(owner_id, dataset_id)
    }

    pub fn delete_calculated_column(&self, owner_id: &str, id: i64) -> Result<(), ColumnStoreError> {
        self.columns.delete(owner_id, id)
    }

    // ── Table views ─────────────────────────────────────────────────

    pub fn user_data(
        &self,
        owner_id: &str,
        options: &QueryOptions,
    ) -> Result<UserDataPage, QueryError> {
        QueryPlanner::new(&self.store).user_data(owner_id, options)
    }

    pub fn dataset_data(
        &self,
        owner_id: &str,
        dataset_id: &str,
        options: &QueryOptions,
    ) -> Result<UserDataPage, QueryError> {
        QueryPlanner::new(&self.store).dataset_data(owner_id, dataset_id, options)
    }

    // ── Catalog ─────────────────────────────────────────────────────

    pub fn list_columns(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<ColumnDescriptor>, CatalogError> {
        SampledCatalog::new(&self.store).list_columns(owner_id, dataset_id)
    }

    /// Column names only, in catalog order: the `known_columns` input
    /// for formula validation.
    pub fn column_names(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<String>, CatalogError> {
        Ok(self
            .list_columns(owner_id, dataset_id)?
            .into_iter()
            .map(|column| column.name)
            .collect())
    }

    // ── Charts ──────────────────────────────────────────────────────

    pub fn validate_chart_options(
        &self,
        owner_id: &str,
        request: &ChartRequest,
    ) -> Result<ChartValidation, ChartError> {
        let catalog = SampledCatalog::new(&self.store);
        ChartProjector::with_policy(&self.store, &catalog, self.policy)
            .validate_options(owner_id, request)
    }

    pub fn chart_data(
        &self,
        owner_id: &str,
        request: &ChartRequest,
    ) -> Result<ChartSeries, ChartError> {
        let catalog = SampledCatalog::new(&self.store);
        ChartProjector::with_policy(&self.store, &catalog, self.policy)
            .chart_data(owner_id, request)
    }

    pub fn optimized_chart_data(
        &self,
        owner_id: &str,
        request: &ChartRequest,
        log: &mut DecisionLog,
    ) -> Result<ChartSeries, ChartError> {
        let catalog = SampledCatalog::new(&self.store);
        ChartProjector::with_policy(&self.store, &catalog, self.policy)
            .optimized_chart_data(owner_id, request, log)
    }

    pub fn chart_preview(
        &self,
        owner_id: &str,
        request: &ChartRequest,
    ) -> Result<ChartSeries, ChartError> {
        let catalog = SampledCatalog::new(&self.store);
        ChartProjector::with_policy(&self.store, &catalog, self.policy)
            .chart_preview(owner_id, request)
    }
}
