//! Types and traits used across Millrace
mod data;
mod partition;
mod record;

pub use data::{Data, NoInternals};
pub use partition::{InputPortRole, OutputPortRole, PartitionInfo};
pub use record::{Record, RowId, Schema, SchemaError, Table};
