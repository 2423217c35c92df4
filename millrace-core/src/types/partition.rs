//! Partitioning and port role descriptions used when an operator is executed in a
//! distributed (partitioned) or streamed fashion.
use serde::{Deserialize, Serialize};

/// Describes which chunk of a distributable input an operator instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionInfo {
    index: usize,
    count: usize,
}

impl PartitionInfo {
    /// Create partition info for partition `index` out of `count` partitions.
    ///
    /// # Panics
    /// If `index >= count`. Handing out an invalid partition is a programming error of the
    /// orchestrator.
    pub fn new(index: usize, count: usize) -> Self {
        assert!(index < count, "partition {index} out of range for {count} partitions");
        Self { index, count }
    }

    /// Info for a non-partitioned execution: the one and only partition
    pub fn single() -> Self {
        Self { index: 0, count: 1 }
    }

    /// Zero based index of this partition
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total number of partitions of this execution
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Default for PartitionInfo {
    fn default() -> Self {
        Self::single()
    }
}

/// Role of an input port.
///
/// A streamable input only needs to see every record once and is handed to the operator as
/// a row input. A non-streamable input is handed over as a whole, materialized table.
/// A distributed input may be split into partitions which are processed in parallel, any
/// non-distributed input is duplicated for every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputPortRole {
    distributed: bool,
    streamable: bool,
}

impl InputPortRole {
    /// Input can be split into partitions and is consumed record by record
    pub const DISTRIBUTED_STREAMABLE: Self = Self::new(true, true);
    /// Input can be split into partitions but each partition is needed as a whole
    pub const DISTRIBUTED_NONSTREAMABLE: Self = Self::new(true, false);
    /// Input is consumed record by record but must not be split
    pub const NONDISTRIBUTED_STREAMABLE: Self = Self::new(false, true);
    /// Input is needed as a whole and must not be split
    pub const NONDISTRIBUTED_NONSTREAMABLE: Self = Self::new(false, false);

    const fn new(distributed: bool, streamable: bool) -> Self {
        Self {
            distributed,
            streamable,
        }
    }

    /// Whether the input may be split into partitions
    pub fn is_distributable(&self) -> bool {
        self.distributed
    }

    /// Whether the input is consumed as a stream of records
    pub fn is_streamable(&self) -> bool {
        self.streamable
    }
}

/// Role of an output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputPortRole {
    /// Each partition's operator produces its share of the output directly
    Distributed,
    /// The output is produced once, after the internals of all partitions were merged
    NonDistributed,
}
