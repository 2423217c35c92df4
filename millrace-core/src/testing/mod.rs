//! Fixtures shared by the unit tests
use crate::types::{Record, RowId, Schema, Table};

/// Schema with a single integer column
pub fn int_schema() -> Schema {
    #[allow(clippy::unwrap_used)]
    Schema::new(["value"]).unwrap()
}

/// Single-cell record with the conventional row id for `index`
pub fn int_record(index: u64, value: i64) -> Record<i64> {
    Record::new(RowId::indexed(index), vec![value])
}

/// One single-cell record per value, ids `Row0`, `Row1`, ...
pub fn int_records(values: &[i64]) -> Vec<Record<i64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| int_record(i as u64, *v))
        .collect()
}

/// Single column table holding the given values
pub fn int_table(values: &[i64]) -> Table<i64> {
    Table::new(int_schema(), int_records(values))
}

/// Cell values of a single column table
pub fn table_values(table: &Table<i64>) -> Vec<i64> {
    table.rows().iter().map(|r| r.values()[0]).collect()
}

/// Print the library's logs in test output. Repeated calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
