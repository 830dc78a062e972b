#![no_main]

use std::collections::BTreeMap;

use cw_record::Record;
use cw_store::{FilterOp, Predicate};
use cw_types::Scalar;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let mut parts = input.splitn(3, '\n');
    let column = parts.next().unwrap_or_default();
    let field = parts.next().unwrap_or_default();
    let value = parts.next().unwrap_or_default();

    let mut fields = BTreeMap::new();
    fields.insert(column.to_owned(), Scalar::from(field));
    let record = Record::new("r-0", "owner", "ds", 0, fields);

    // Structural matching must never panic, whatever the strings are.
    for op in [FilterOp::Eq, FilterOp::Gt, FilterOp::Lt, FilterOp::Contains] {
        let _ = Predicate::new(column, op, value).matches(&record);
    }
});
