use tracing::debug;

use crate::{
    channels::{PortError, PortInput, PortOutput},
    errorhandling::OperatorError,
    stream::{input_rows, output_rows, ExecutionContext, StreamableOperator},
    types::Data,
};

/// Forward the first `limit` records, then stop reading.
///
/// Once the limit is reached the input is closed right away, which tells upstream that no
/// more records are demanded. The output is closed afterwards. Limits are per operator
/// instance, use a non-distributed input role for a global limit.
#[derive(Debug, Clone)]
pub struct LimitOperator {
    limit: u64,
    forwarded: u64,
}

impl LimitOperator {
    /// Create an operator forwarding at most `limit` records
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            forwarded: 0,
        }
    }

    /// Number of records forwarded by the last run
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl<V, I> StreamableOperator<V, I> for LimitOperator
where
    V: Data,
{
    fn run_final(
        &mut self,
        inputs: &mut [PortInput<V>],
        outputs: &mut [PortOutput<V>],
        ctx: &ExecutionContext,
    ) -> Result<(), OperatorError> {
        let input = input_rows(inputs, 0)?;
        let output = output_rows(outputs, 0)?;

        self.forwarded = 0;
        while self.forwarded < self.limit {
            ctx.check_cancelled()?;
            let Some(record) = input.poll()? else {
                break;
            };
            let row_id = record.id().clone();
            match output.push(record) {
                Ok(()) => self.forwarded += 1,
                Err(PortError::OutputClosed) => break,
                Err(e) => return Err(e.into()),
            }
            ctx.report_progress(self.forwarded, &row_id);
        }
        debug!(forwarded = self.forwarded, "Limit reached or input exhausted");
        input.close();
        output.close();
        Ok(())
    }
}
