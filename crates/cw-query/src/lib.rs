#![forbid(unsafe_code)]

use cw_record::Record;
use cw_store::{PageRequest, Predicate, RowStore, SortSpec, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// A table-view query as it arrives from the outer service layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub dataset_id: Option<String>,
    pub predicates: Vec<Predicate>,
    pub sort: Option<SortSpec>,
    pub page: usize,
    pub limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            dataset_id: None,
            predicates: Vec::new(),
            sort: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// One page of a table view, echoing the window it was cut with.
/// `total_count` always comes from the store's independent count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDataPage {
    pub records: Vec<Record>,
    pub total_count: u64,
    pub page: usize,
    pub limit: usize,
}

/// Turns filter/sort/pagination requests into bound store queries. Holds
/// no state beyond the injected store reference; every call runs to
/// completion for one caller.
#[derive(Debug)]
pub struct QueryPlanner<'a, S: RowStore> {
    store: &'a S,
}

impl<'a, S: RowStore> QueryPlanner<'a, S> {
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Fetch one page of an owner's records across all their datasets, or
    /// scoped to `options.dataset_id` when set.
    pub fn user_data(
        &self,
        owner_id: &str,
        options: &QueryOptions,
    ) -> Result<UserDataPage, QueryError> {
        let page = PageRequest::new(options.page, options.limit)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            owner_id,
            dataset_id = options.dataset_id.as_deref(),
            page = options.page,
            limit = options.limit,
            predicates = options.predicates.len(),
            "fetching user data page"
        );

        let fetched = self.store.fetch(
            owner_id,
            options.dataset_id.as_deref(),
            &options.predicates,
            options.sort.as_ref(),
            &page,
        )?;

        Ok(UserDataPage {
            records: fetched.records,
            total_count: fetched.total_count,
            page: page.page(),
            limit: page.limit(),
        })
    }

    /// Single-dataset variant of [`QueryPlanner::user_data`].
    pub fn dataset_data(
        &self,
        owner_id: &str,
        dataset_id: &str,
        options: &QueryOptions,
    ) -> Result<UserDataPage, QueryError> {
        let scoped = QueryOptions {
            dataset_id: Some(dataset_id.to_owned()),
            ..options.clone()
        };
        self.user_data(owner_id, &scoped)
    }

    /// Predicate-only count, shared with the chart optimizer's admission
    /// check.
    pub fn matching_rows(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
        predicates: &[Predicate],
    ) -> Result<u64, QueryError> {
        Ok(self.store.count(owner_id, dataset_id, predicates)?)
    }

    /// Fetch the rows feeding a chart series: first page only, insertion
    /// order, optionally capped. `None` means no explicit cap (the
    /// optimization policy decides when that is acceptable).
    pub fn series_rows(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
        predicates: &[Predicate],
        limit: Option<usize>,
    ) -> Result<Vec<Record>, QueryError> {
        let page = match limit {
            Some(limit) => PageRequest::new(1, limit)?,
            None => PageRequest::all(),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            owner_id,
            dataset_id,
            limit = ?limit,
            "fetching series rows"
        );

        let fetched = self
            .store
            .fetch(owner_id, dataset_id, predicates, None, &page)?;
        Ok(fetched.records)
    }
}
