use std::collections::BTreeMap;
use std::sync::RwLock;

use cw_record::Record;
use cw_types::Scalar;

use crate::{PageRequest, Predicate, RecordPage, RowStore, SortSpec, StorageError, compare_fields};

/// In-memory reference backend. Filtering happens structurally against
/// the field maps; the total count comes from the full match set, never
/// from the returned page.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    inner: RwLock<Vec<Record>>,
}

impl MemoryRowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<Record>>, StorageError> {
        self.inner
            .read()
            .map_err(|_| StorageError::Backend("record store lock poisoned".to_owned()))
    }

    fn write_guard(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Record>>, StorageError> {
        self.inner
            .write()
            .map_err(|_| StorageError::Backend("record store lock poisoned".to_owned()))
    }
}

impl RowStore for MemoryRowStore {
    fn insert_records(
        &self,
        owner_id: &str,
        dataset_id: &str,
        rows: Vec<BTreeMap<String, Scalar>>,
    ) -> Result<usize, StorageError> {
        let mut records = self.write_guard()?;

        let mut next_index = records
            .iter()
            .filter(|record| record.owner_id() == owner_id && record.dataset_id() == dataset_id)
            .map(|record| record.index() + 1)
            .max()
            .unwrap_or(0);

        let inserted = rows.len();
        for fields in rows {
            let id = format!("{dataset_id}:{next_index}");
            records.push(Record::new(id, owner_id, dataset_id, next_index, fields));
            next_index += 1;
        }

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
        let records = self.read_guard()?;

        let mut matching: Vec<&Record> = records
            .iter()
            .filter(|record| record.owner_id() == owner_id)
            .filter(|record| dataset_id.is_none_or(|dataset| record.dataset_id() == dataset))
            .filter(|record| predicates.iter().all(|predicate| predicate.matches(record)))
            .collect();

        let total_count = matching.len() as u64;

        if let Some(sort) = sort {
            matching.sort_by(|left, right| {
                compare_fields(
                    left.field(&sort.column),
                    right.field(&sort.column),
                    sort.order,
                )
                .then_with(|| left.index().cmp(&right.index()))
            });
        }

        let page_records: Vec<Record> = matching
            .into_iter()
            .skip(page.offset())
            .take(page.limit())
            .cloned()
            .collect();

        Ok(RecordPage {
            records: page_records,
            total_count,
        })
    }

    fn count(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
        predicates: &[Predicate],
    ) -> Result<u64, StorageError> {
        let records = self.read_guard()?;

        Ok(records
            .iter()
            .filter(|record| record.owner_id() == owner_id)
            .filter(|record| dataset_id.is_none_or(|dataset| record.dataset_id() == dataset))
            .filter(|record| predicates.iter().all(|predicate| predicate.matches(record)))
            .count() as u64)
    }

    fn run_in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let snapshot = self.read_guard()?.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                *self.write_guard()? = snapshot;
                Err(err)
            }
        }
    }
}
