use tracing::debug;

use crate::{
    channels::{InputCursor, PortError, PortInput, PortOutput},
    errorhandling::OperatorError,
    stream::{input_rows, output_rows, ExecutionContext, StreamableOperator},
    types::{Data, Record},
};

/// Retain only the records matching a predicate.
///
/// If the predicate returns `true`, the record is passed downstream unchanged, otherwise it
/// is discarded. Reads the first input and writes the first output.
///
/// # Example
///
/// Only retain numbers <= 42
/// ```rust
/// use millrace::operators::FilterOperator;
/// use millrace::runtime::{OperatorNode, StreamingExecutor};
/// use millrace::types::{Record, Schema, Table};
///
/// let schema = Schema::new(["value"]).unwrap();
/// let rows = (0..100).map(|i| Record::new(format!("Row{i}"), vec![i])).collect();
/// let node = OperatorNode::builder()
///     .name("small")
///     .build(|_| FilterOperator::new(|r: &Record<i64>| r.values()[0] <= 42));
///
/// let out = StreamingExecutor::builder()
///     .partitions(4)
///     .build()
///     .execute(&node, vec![Table::new(schema, rows)])
///     .unwrap();
/// let values: Vec<i64> = out[0].rows().iter().map(|r| r.values()[0]).collect();
/// assert_eq!(values, (0..=42).collect::<Vec<_>>());
/// ```
pub struct FilterOperator<P> {
    predicate: P,
}

impl<P> FilterOperator<P> {
    /// Create a filter keeping every record for which `predicate` is `true`
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }
}

impl<V, I, P> StreamableOperator<V, I> for FilterOperator<P>
where
    V: Data,
    P: FnMut(&Record<V>) -> bool + Send,
{
    fn run_final(
        &mut self,
        inputs: &mut [PortInput<V>],
        outputs: &mut [PortOutput<V>],
        ctx: &ExecutionContext,
    ) -> Result<(), OperatorError> {
        let mut cursor = InputCursor::new(input_rows(inputs, 0)?);
        let output = output_rows(outputs, 0)?;

        let mut kept = 0u64;
        while cursor.can_advance()? {
            ctx.check_cancelled()?;
            let record = cursor.advance()?;
            if !(self.predicate)(&record) {
                continue;
            }
            let row_id = record.id().clone();
            match output.push(record) {
                Ok(()) => kept += 1,
                Err(PortError::OutputClosed) => {
                    debug!(kept, "Downstream closed, stopping filter");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            ctx.report_progress(kept, &row_id);
        }
        cursor.close();
        output.close();
        Ok(())
    }
}
