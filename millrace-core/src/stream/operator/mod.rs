//! The operator execution contract
mod context;
mod function;

pub use context::{ExecutionContext, NoProgress, ProgressSink};
pub use function::{run_function, run_interwoven, FunctionOperator, StreamableFunction};

use crate::{
    channels::{PortInput, PortOutput, RowInput, RowOutput},
    errorhandling::OperatorError,
    types::NoInternals,
};

/// Lifecycle of an operator or function instance.
///
/// `Finished` is reached both when the input is exhausted and when the run is aborted by
/// an error or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatorState {
    /// Instance exists but was not set up yet
    #[default]
    Created,
    /// Setup done, no record processed yet
    Initialized,
    /// Processing records
    Running,
    /// Done, cleanup has run
    Finished,
}

/// An operator processing N inputs into M outputs on one partition.
///
/// One instance is created per partition. An instance may carry internals (e.g. statistics
/// gathered over its partition), which the executor collects, merges across partitions and,
/// for iterative operators, hands back for the next pass.
pub trait StreamableOperator<V, I = NoInternals>: Send {
    /// Run one intermediate pass over the inputs. Only called for nodes which iterate,
    /// outputs are not available during intermediate passes.
    #[allow(unused)]
    fn run_intermediate(
        &mut self,
        inputs: &mut [PortInput<V>],
        ctx: &ExecutionContext,
    ) -> Result<(), OperatorError> {
        Ok(())
    }

    /// Run the final pass, producing records into the outputs.
    ///
    /// On success every assigned output must be closed when this returns.
    fn run_final(
        &mut self,
        inputs: &mut [PortInput<V>],
        outputs: &mut [PortOutput<V>],
        ctx: &ExecutionContext,
    ) -> Result<(), OperatorError>;

    /// Hand out the internals gathered during the last pass
    fn save_internals(&mut self) -> Option<I> {
        None
    }

    /// Take over (merged) internals before the next pass
    #[allow(unused)]
    fn load_internals(&mut self, internals: I) {}
}

/// Streamed input at `index`, failing with [OperatorError::PortMismatch] if there is none
pub fn input_rows<V>(
    inputs: &mut [PortInput<V>],
    index: usize,
) -> Result<&mut dyn RowInput<V>, OperatorError> {
    inputs
        .get_mut(index)
        .ok_or_else(|| OperatorError::PortMismatch(format!("no input at index {index}")))?
        .rows()
}

/// Assigned output at `index`, failing with [OperatorError::PortMismatch] if there is none
pub fn output_rows<V>(
    outputs: &mut [PortOutput<V>],
    index: usize,
) -> Result<&mut dyn RowOutput<V>, OperatorError> {
    outputs
        .get_mut(index)
        .ok_or_else(|| OperatorError::PortMismatch(format!("no output at index {index}")))?
        .rows()
}
