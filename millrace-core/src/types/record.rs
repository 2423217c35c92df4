//! Records and the schemas describing them.
//!
//! Millrace does not interpret the cells of a record. The only structural property the
//! core relies on is the arity, which must match the [Schema] of the port a record moves
//! through.
use std::{fmt::Display, sync::Arc};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a single row, e.g. `Row42`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(Arc<str>);

impl RowId {
    /// Create the conventional identifier for the row at the given index
    pub fn indexed(index: u64) -> Self {
        Self(format!("Row{index}").into())
    }

    /// View the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for RowId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

/// A single unit of data moving through a port: a row identifier and a fixed number of cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<V> {
    id: RowId,
    values: Vec<V>,
}

impl<V> Record<V> {
    /// Create a new record from its identifier and cells
    pub fn new(id: impl Into<RowId>, values: Vec<V>) -> Self {
        Self {
            id: id.into(),
            values,
        }
    }

    /// Identifier of this record
    pub fn id(&self) -> &RowId {
        &self.id
    }

    /// Number of cells in this record
    pub fn arity(&self) -> usize {
        self.values.len()
    }

    /// The cells of this record
    pub fn values(&self) -> &[V] {
        &self.values
    }

    /// Mutable access to the cells. Mostly useful for reusable write buffers,
    /// see [OutputCursor](crate::channels::OutputCursor).
    pub fn values_mut(&mut self) -> &mut [V] {
        &mut self.values
    }

    /// Replace the identifier of this record
    pub fn set_id(&mut self, id: impl Into<RowId>) {
        self.id = id.into();
    }

    /// Split the record into identifier and cells
    pub fn into_parts(self) -> (RowId, Vec<V>) {
        (self.id, self.values)
    }

    /// Apply a function to every cell, keeping the identifier
    pub fn map<W>(self, mapper: impl FnMut(V) -> W) -> Record<W> {
        Record {
            id: self.id,
            values: self.values.into_iter().map(mapper).collect(),
        }
    }
}

/// Errors when constructing a [Schema]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Column names must be unique within a schema
    #[error("Column name '{0}' occurs more than once")]
    DuplicateColumn(String),
}

/// Ordered set of column names. The number of columns is the arity of every record
/// on a port with this schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: IndexSet<String>,
}

impl Schema {
    /// Create a schema from column names, failing on duplicate names
    pub fn new<I, S>(columns: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = IndexSet::new();
        for name in columns {
            let name = name.into();
            if set.contains(&name) {
                return Err(SchemaError::DuplicateColumn(name));
            }
            set.insert(name);
        }
        Ok(Self { columns: set })
    }

    /// Number of columns
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Column names in order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    /// Position of the column with the given name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.get_index_of(name)
    }
}

// IndexSet equality ignores order, column order matters for us
impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.columns.iter().eq(other.columns.iter())
    }
}
impl Eq for Schema {}

/// A materialized sequence of records sharing one schema.
///
/// Tables are what non-streamed inputs hand to an operator and what the
/// [StreamingExecutor](crate::runtime::StreamingExecutor) consumes and produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table<V> {
    schema: Schema,
    rows: Vec<Record<V>>,
}

impl<V> Table<V> {
    /// Create a table. Rows are not checked against the schema here, ports do that
    /// when the rows are pushed.
    pub fn new(schema: Schema, rows: Vec<Record<V>>) -> Self {
        Self { schema, rows }
    }

    /// Schema of this table
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// All rows of this table
    pub fn rows(&self) -> &[Record<V>] {
        &self.rows
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Take the rows out of the table
    pub fn into_rows(self) -> Vec<Record<V>> {
        self.rows
    }

    /// Split the table into exactly `count` contiguous chunks, preserving row order.
    ///
    /// Every chunk but the last holds `len / count` rows, the last one takes the
    /// remainder. No chunk is empty as long as the table has at least `count` rows.
    /// With fewer rows the leading chunks are empty and the last holds everything.
    pub fn into_chunks(self, count: usize) -> Vec<Table<V>> {
        let count = count.max(1);
        let Table { schema, rows } = self;
        let chunk_size = rows.len() / count;
        let mut rows = rows.into_iter();
        let mut chunks: Vec<Table<V>> = (1..count)
            .map(|_| Table {
                schema: schema.clone(),
                rows: rows.by_ref().take(chunk_size).collect(),
            })
            .collect();
        chunks.push(Table {
            schema,
            rows: rows.collect(),
        });
        chunks
    }
}
