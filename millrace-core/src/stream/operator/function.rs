//! Single input, single output record functions and the loops driving them.
use std::marker::PhantomData;

use tracing::{debug, debug_span};

use super::{input_rows, output_rows, ExecutionContext, OperatorState, StreamableOperator};
use crate::{
    channels::{PortError, PortInput, PortOutput, RowInput, RowOutput},
    errorhandling::OperatorError,
    types::{Data, Record},
};

/// A per-record transformation from one input to one output.
pub trait StreamableFunction<V>: Send {
    /// Called once before the first record
    #[allow(unused)]
    fn init(&mut self, ctx: &ExecutionContext) -> Result<(), OperatorError> {
        Ok(())
    }

    /// Transform a single record. An error aborts the run, it is not retried.
    fn compute(&mut self, record: Record<V>) -> Result<Record<V>, OperatorError>;

    /// Called exactly once after the last record, also when the run was aborted by an
    /// error or cancellation
    fn finish(&mut self) {}
}

/// Runs `finish` and marks the state finished when dropped, no matter how the loop exits
struct FinishGuard<'a, V, F: StreamableFunction<V> + ?Sized> {
    function: &'a mut F,
    state: &'a mut OperatorState,
    _data: PhantomData<fn(V)>,
}

impl<'a, V, F: StreamableFunction<V> + ?Sized> FinishGuard<'a, V, F> {
    fn new(function: &'a mut F, state: &'a mut OperatorState) -> Self {
        Self {
            function,
            state,
            _data: PhantomData,
        }
    }

    fn init(&mut self, ctx: &ExecutionContext) -> Result<(), OperatorError> {
        self.function.init(ctx)?;
        *self.state = OperatorState::Initialized;
        Ok(())
    }
}

impl<V, F: StreamableFunction<V> + ?Sized> Drop for FinishGuard<'_, V, F> {
    fn drop(&mut self) {
        self.function.finish();
        *self.state = OperatorState::Finished;
    }
}

/// Drive a function over one input and one output until the input is exhausted.
///
/// On success the input and then the output are closed before `finish` runs. If downstream
/// closes the output, the loop stops early and finishes just as if the input was exhausted.
/// On error or cancellation `finish` still runs, but the ports are left as they are.
pub fn run_function<V, F>(
    function: &mut F,
    input: &mut dyn RowInput<V>,
    output: &mut dyn RowOutput<V>,
    ctx: &ExecutionContext,
) -> Result<(), OperatorError>
where
    V: Data,
    F: StreamableFunction<V> + ?Sized,
{
    let mut state = OperatorState::Created;
    run_tracked(function, input, output, ctx, &mut state)
}

fn run_tracked<V, F>(
    function: &mut F,
    input: &mut dyn RowInput<V>,
    output: &mut dyn RowOutput<V>,
    ctx: &ExecutionContext,
    state: &mut OperatorState,
) -> Result<(), OperatorError>
where
    V: Data,
    F: StreamableFunction<V> + ?Sized,
{
    let span = debug_span!(
        "function",
        operator = ctx.operator_name,
        partition = ctx.partition.index()
    );
    let _entered = span.enter();

    let mut guard = FinishGuard::new(function, state);
    guard.init(ctx)?;
    *guard.state = OperatorState::Running;
    debug!("Function running");

    let mut rows = 0u64;
    loop {
        ctx.check_cancelled()?;
        let Some(record) = input.poll()? else {
            break;
        };
        let row_id = record.id().clone();
        let computed = guard.function.compute(record)?;
        match output.push(computed) {
            Ok(()) => (),
            Err(PortError::OutputClosed) => {
                debug!(rows, "Downstream closed, stopping early");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        rows += 1;
        ctx.report_progress(rows, &row_id);
    }
    input.close();
    output.close();
    drop(guard);
    debug!(rows, "Function finished");
    Ok(())
}

/// Drive two functions over one shared input, each writing its own output.
///
/// For every input record both results are computed and pushed before the next record is
/// polled, so the outputs stay aligned record by record. If downstream closes one output
/// the other keeps being fed, the loop stops early only once both are closed.
pub fn run_interwoven<V, F1, F2>(
    first: &mut F1,
    second: &mut F2,
    input: &mut dyn RowInput<V>,
    first_output: &mut dyn RowOutput<V>,
    second_output: &mut dyn RowOutput<V>,
    ctx: &ExecutionContext,
) -> Result<(), OperatorError>
where
    V: Data,
    F1: StreamableFunction<V> + ?Sized,
    F2: StreamableFunction<V> + ?Sized,
{
    let span = debug_span!(
        "interwoven",
        operator = ctx.operator_name,
        partition = ctx.partition.index()
    );
    let _entered = span.enter();

    let (mut first_state, mut second_state) = (OperatorState::Created, OperatorState::Created);
    let mut first = FinishGuard::new(first, &mut first_state);
    let mut second = FinishGuard::new(second, &mut second_state);
    first.init(ctx)?;
    second.init(ctx)?;

    let mut first_open = true;
    let mut second_open = true;
    let mut rows = 0u64;
    while first_open || second_open {
        ctx.check_cancelled()?;
        let Some(record) = input.poll()? else {
            break;
        };
        let row_id = record.id().clone();
        if first_open {
            let computed = first.function.compute(record.clone())?;
            first_open = push_or_closed(first_output, computed)?;
        }
        if second_open {
            let computed = second.function.compute(record)?;
            second_open = push_or_closed(second_output, computed)?;
        }
        rows += 1;
        ctx.report_progress(rows, &row_id);
    }
    input.close();
    first_output.close();
    second_output.close();
    drop(first);
    drop(second);
    debug!(rows, "Interwoven functions finished");
    Ok(())
}

/// Push a record, returning `false` if downstream closed the output
fn push_or_closed<V>(output: &mut dyn RowOutput<V>, record: Record<V>) -> Result<bool, PortError> {
    match output.push(record) {
        Ok(()) => Ok(true),
        Err(PortError::OutputClosed) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Adapts a [StreamableFunction] into a [StreamableOperator] reading one input port and
/// writing one output port.
pub struct FunctionOperator<F> {
    function: F,
    input_index: usize,
    output_index: usize,
    state: OperatorState,
}

impl<F> FunctionOperator<F> {
    /// Run `function` from the first input to the first output
    pub fn new(function: F) -> Self {
        Self::with_ports(function, 0, 0)
    }

    /// Run `function` from the given input to the given output
    pub fn with_ports(function: F, input_index: usize, output_index: usize) -> Self {
        Self {
            function,
            input_index,
            output_index,
            state: OperatorState::Created,
        }
    }

    /// Lifecycle state of the wrapped function
    pub fn state(&self) -> OperatorState {
        self.state
    }

    /// Access the wrapped function
    pub fn function(&self) -> &F {
        &self.function
    }
}

impl<V, I, F> StreamableOperator<V, I> for FunctionOperator<F>
where
    V: Data,
    F: StreamableFunction<V>,
{
    fn run_final(
        &mut self,
        inputs: &mut [PortInput<V>],
        outputs: &mut [PortOutput<V>],
        ctx: &ExecutionContext,
    ) -> Result<(), OperatorError> {
        let input = input_rows(inputs, self.input_index)?;
        let output = output_rows(outputs, self.output_index)?;
        run_tracked(&mut self.function, input, output, ctx, &mut self.state)
    }
}
