//! Runtime context handed to operators
use std::{
    fmt::Debug,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tracing::warn;

use crate::{
    cancellation::CancelToken,
    errorhandling::OperatorError,
    types::{PartitionInfo, RowId},
};

/// Receiver of per-record progress.
///
/// Reporting is best effort: implementations must return quickly and must not block.
/// A panicking implementation is logged and otherwise ignored.
pub trait ProgressSink: Send + Sync {
    /// `rows_processed` records of `partition` are done, the last one being `last_row`
    fn report(&self, partition: PartitionInfo, rows_processed: u64, last_row: &RowId);
}

/// Progress sink which discards all reports
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _partition: PartitionInfo, _rows_processed: u64, _last_row: &RowId) {}
}

impl<F> ProgressSink for F
where
    F: Fn(PartitionInfo, u64, &RowId) + Send + Sync,
{
    fn report(&self, partition: PartitionInfo, rows_processed: u64, last_row: &RowId) {
        self(partition, rows_processed, last_row)
    }
}

/// This is a type injected to operators at runtime
/// and contains context, which the operator generally can not change
/// but utilize
#[derive(Clone)]
pub struct ExecutionContext {
    /// Partition this operator instance works on
    pub partition: PartitionInfo,
    /// Name of the operator, used in log spans
    pub operator_name: String,
    cancel: CancelToken,
    progress: Arc<dyn ProgressSink>,
}

impl ExecutionContext {
    /// Create a new context
    pub fn new(
        partition: PartitionInfo,
        operator_name: impl Into<String>,
        cancel: CancelToken,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            partition,
            operator_name: operator_name.into(),
            cancel,
            progress,
        }
    }

    /// Context for running an operator on its own: a single partition, a fresh
    /// cancellation token and no progress reporting
    pub fn standalone(operator_name: impl Into<String>) -> Self {
        Self::new(
            PartitionInfo::single(),
            operator_name,
            CancelToken::new(),
            Arc::new(NoProgress),
        )
    }

    /// Token which signals cancellation of this execution
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fail with [OperatorError::Cancelled] if execution was cancelled.
    /// Operators call this between records.
    pub fn check_cancelled(&self) -> Result<(), OperatorError> {
        if self.cancel.is_cancelled() {
            Err(OperatorError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report progress to the sink, swallowing any panic it raises
    pub fn report_progress(&self, rows_processed: u64, last_row: &RowId) {
        let reported = catch_unwind(AssertUnwindSafe(|| {
            self.progress
                .report(self.partition, rows_processed, last_row)
        }));
        if reported.is_err() {
            warn!(
                operator = self.operator_name,
                partition = self.partition.index(),
                "Progress sink panicked, report dropped"
            );
        }
    }
}

impl Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("partition", &self.partition)
            .field("operator_name", &self.operator_name)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}
