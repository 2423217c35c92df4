//! Local execution of a [StreamableNode]: chunking, per partition threads and merging.
use std::{sync::Arc, thread};

use bon::Builder;
use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use super::failfast::FailFast;
use super::node::StreamableNode;
use crate::{
    cancellation::CancelToken,
    channels::{port_pair, ChannelInput, PortError, PortInput, PortOutput, RowInput, RowOutput},
    errorhandling::OperatorError,
    sinks::VecSink,
    stream::{ExecutionContext, NoProgress, ProgressSink, StreamableOperator},
    types::{Data, InputPortRole, OutputPortRole, PartitionInfo, Record, Schema, Table},
};

/// Ways a streaming execution can end other than in completion
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The execution was cancelled from outside
    #[error("Execution was cancelled")]
    Cancelled,
    /// An operator instance failed
    #[error("Operator on partition {partition} failed: {source}")]
    Operator {
        /// partition of the failing instance
        partition: usize,
        /// error returned by the operator
        source: OperatorError,
    },
    /// A port feeding or draining an operator failed
    #[error("Port of partition {partition} failed: {source}")]
    Port {
        /// partition the port belongs to
        partition: usize,
        /// error raised by the port
        source: PortError,
    },
    /// Producing the non-distributed outputs after the merge failed
    #[error("Finishing the streamable execution failed: {0}")]
    Finish(#[source] OperatorError),
    /// Merging the internals of several partitions failed
    #[error("Merging operator internals failed: {0}")]
    Merge(#[source] OperatorError),
    /// The number of inputs does not match the node's input roles
    #[error("Node expects {expected} inputs but got {actual}")]
    InputCount {
        /// number of input roles
        expected: usize,
        /// number of input tables
        actual: usize,
    },
    /// The node returned a different number of output schemas than it has output roles
    #[error("Node declares {expected} outputs but returned {actual} output schemas")]
    SchemaCount {
        /// number of output roles
        expected: usize,
        /// number of output schemas
        actual: usize,
    },
    /// Internals of several partitions or non-distributed outputs need a merge operator,
    /// but the node has none
    #[error("Node requires a merge operator but does not provide one")]
    MissingMergeOperator,
    /// An operator returned successfully but left an assigned output open.
    /// `partition` is `None` for outputs produced after the merge.
    #[error("Output port {port} was not closed (partition {partition:?})")]
    UnclosedOutput {
        /// partition of the operator, `None` for the finishing step
        partition: Option<usize>,
        /// index of the open output
        port: usize,
    },
    /// Internals could not be serialized
    #[error("Failed to encode operator internals: {0}")]
    InternalsEncode(#[from] rmp_serde::encode::Error),
    /// Internals could not be deserialized
    #[error("Failed to decode operator internals: {0}")]
    InternalsDecode(#[from] rmp_serde::decode::Error),
    /// An operator instance panicked
    #[error("Operator on partition {partition} panicked")]
    Panicked {
        /// partition of the panicking instance
        partition: usize,
    },
}

impl ExecutionError {
    /// True if the execution ended because it was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    fn operator(partition: usize, source: OperatorError) -> Self {
        if source.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Operator { partition, source }
        }
    }

    fn port(partition: usize, source: PortError) -> Self {
        match source {
            PortError::Cancelled => Self::Cancelled,
            source => Self::Port { partition, source },
        }
    }
}

/// Executes a [StreamableNode] on local threads.
///
/// Distributable inputs are split into up to `partitions` contiguous chunks and every
/// chunk is processed by its own operator instance on its own thread. Streamed inputs are
/// fed and outputs drained through bounded ports, so an operator never needs to hold more
/// than `channel_capacity` records of any port in memory.
///
/// The first partition to fail cancels all others. Cancelling the token given to the
/// builder cancels the execution from outside, a cancelled executor stays cancelled.
///
/// # Example
/// ```rust
/// use millrace::operators::MapFunction;
/// use millrace::runtime::{FunctionNode, StreamingExecutor};
/// use millrace::types::{Record, Schema, Table};
///
/// let schema = Schema::new(["value"]).unwrap();
/// let rows = (0..4).map(|i| Record::new(format!("Row{i}"), vec![i])).collect();
/// let node = FunctionNode::new("increment", |_| MapFunction::new(|r: Record<i64>| r.map(|x| x + 1)));
///
/// let executor = StreamingExecutor::builder()
///     .partitions(2)
///     .channel_capacity(1)
///     .build();
/// let out = executor.execute(&node, vec![Table::new(schema, rows)]).unwrap();
/// assert_eq!(out[0].len(), 4);
/// ```
#[derive(Builder, Clone)]
pub struct StreamingExecutor {
    /// Maximum number of partitions for distributable inputs
    #[builder(default = 1)]
    partitions: usize,
    /// Number of records a port buffers before pushing blocks
    #[builder(default = 64)]
    channel_capacity: usize,
    #[builder(default)]
    cancel: CancelToken,
    #[builder(default = Arc::new(NoProgress) as Arc<dyn ProgressSink>)]
    progress: Arc<dyn ProgressSink>,
}

impl Default for StreamingExecutor {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Kind of pass over the inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Intermediate,
    Final,
}

/// What one partition hands back after a pass
struct PartitionOutcome<V> {
    /// collected records per output, `None` for unassigned outputs
    outputs: Vec<Option<Vec<Record<V>>>>,
    /// encoded internals, if the operator saved any
    internals: Option<Vec<u8>>,
}

impl StreamingExecutor {
    /// Token cancelling every execution of this executor
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Execute `node` on the given input tables, one table per input role.
    ///
    /// Returns one table per output role. Distributed outputs hold the records of all
    /// partitions in partition order.
    pub fn execute<V, N>(
        &self,
        node: &N,
        inputs: Vec<Table<V>>,
    ) -> Result<Vec<Table<V>>, ExecutionError>
    where
        V: Data,
        N: StreamableNode<V>,
    {
        let span = info_span!("execute", node = node.name());
        let _entered = span.enter();

        let input_roles = node.input_roles();
        let output_roles = node.output_roles();
        if input_roles.len() != inputs.len() {
            return Err(ExecutionError::InputCount {
                expected: input_roles.len(),
                actual: inputs.len(),
            });
        }

        let distributable = input_roles.iter().any(InputPortRole::is_distributable);
        let chunks = chunk_count(distributable, self.partitions, &input_roles, &inputs);
        let input_schemas = inputs.iter().map(|t| t.schema().clone()).collect_vec();
        let partitioned = split_inputs(inputs, &input_roles, chunks);
        info!(partitions = chunks, distributable, "Starting streaming execution");

        let run = self.cancel.child();

        let mut internals = node.initial_internals();
        if let Some(mut current) = internals.take() {
            let mut round = 0usize;
            while node.iterate(&mut current) {
                debug!(round, "Intermediate pass");
                let encoded = rmp_serde::to_vec(&current)?;
                let outcomes = self.run_pass(
                    node,
                    Pass::Intermediate,
                    &partitioned,
                    &input_roles,
                    &[],
                    Some(encoded.as_slice()),
                    &run,
                )?;
                let mut parts = decode_internals::<N::Internals, V>(outcomes)?;
                current = match parts.len() {
                    0 => current,
                    1 => parts.pop().unwrap_or(current),
                    _ => node
                        .merge_operator()
                        .ok_or(ExecutionError::MissingMergeOperator)?
                        .merge_intermediate(parts)
                        .map_err(ExecutionError::Merge)?,
                };
                round += 1;
            }
            internals = Some(current);
        }

        let output_schemas = node.output_schemas(internals.as_ref(), &input_schemas);
        if output_schemas.len() != output_roles.len() {
            return Err(ExecutionError::SchemaCount {
                expected: output_roles.len(),
                actual: output_schemas.len(),
            });
        }
        // a distributable node only produces its distributed outputs per partition
        let assigned = output_roles
            .iter()
            .map(|role| !distributable || *role == OutputPortRole::Distributed)
            .collect_vec();
        let merge = node.merge_operator();
        if assigned.iter().any(|a| !a) && merge.is_none() {
            return Err(ExecutionError::MissingMergeOperator);
        }
        let port_schemas = output_schemas
            .iter()
            .zip(&assigned)
            .map(|(schema, assigned)| assigned.then(|| schema.clone()))
            .collect_vec();

        let encoded = internals.as_ref().map(|i| rmp_serde::to_vec(i)).transpose()?;
        let outcomes = self.run_pass(
            node,
            Pass::Final,
            &partitioned,
            &input_roles,
            &port_schemas,
            encoded.as_deref(),
            &run,
        )?;

        let mut collected: Vec<Vec<Record<V>>> = vec![Vec::new(); output_roles.len()];
        let mut saved = Vec::new();
        for outcome in outcomes {
            for (rows, target) in outcome.outputs.into_iter().zip(collected.iter_mut()) {
                target.extend(rows.into_iter().flatten());
            }
            if let Some(bytes) = outcome.internals {
                saved.push(rmp_serde::from_slice::<N::Internals>(&bytes)?);
            }
        }

        let mut finished = vec![None; output_roles.len()];
        match merge {
            Some(merge) => {
                let merged = if saved.is_empty() {
                    None
                } else {
                    Some(merge.merge_final(saved).map_err(ExecutionError::Merge)?)
                };
                finished = finish_outputs(node, merged, &assigned, &output_schemas, distributable)?;
            }
            None if saved.len() > 1 => return Err(ExecutionError::MissingMergeOperator),
            None => {}
        }

        let tables = output_schemas
            .into_iter()
            .zip(collected)
            .zip(finished)
            .map(|((schema, rows), finished)| {
                finished.unwrap_or_else(|| Table::new(schema, rows))
            })
            .collect_vec();
        info!(outputs = tables.len(), "Streaming execution completed");
        Ok(tables)
    }

    /// Run one pass with one operator instance per partition, each on its own thread
    #[allow(clippy::too_many_arguments)]
    fn run_pass<V, N>(
        &self,
        node: &N,
        pass: Pass,
        partitioned: &[Vec<Table<V>>],
        input_roles: &[InputPortRole],
        outputs: &[Option<Schema>],
        internals: Option<&[u8]>,
        run: &CancelToken,
    ) -> Result<Vec<PartitionOutcome<V>>, ExecutionError>
    where
        V: Data,
        N: StreamableNode<V>,
    {
        if run.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let count = partitioned.len();
        let mut work = Vec::with_capacity(count);
        for (index, tables) in partitioned.iter().enumerate() {
            let partition = PartitionInfo::new(index, count);
            let mut operator = node.create_operator(partition);
            if let Some(bytes) = internals {
                let loaded: N::Internals = rmp_serde::from_slice(bytes)?;
                operator.load_internals(loaded);
            }
            let ctx = ExecutionContext::new(
                partition,
                node.name(),
                run.clone(),
                Arc::clone(&self.progress),
            );
            work.push((operator, tables.clone(), ctx));
        }

        let capacity = self.channel_capacity;
        let results = thread::scope(|scope| {
            let handles = work
                .into_iter()
                .map(|(operator, tables, ctx)| {
                    scope.spawn(move || {
                        run_partition::<V, N::Internals, _>(
                            operator,
                            pass,
                            tables,
                            input_roles,
                            outputs,
                            ctx,
                            capacity,
                        )
                    })
                })
                .collect_vec();
            handles
                .into_iter()
                .enumerate()
                .map(|(partition, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(partition, "Operator panicked");
                        Err(ExecutionError::Panicked { partition })
                    })
                })
                .collect_vec()
        });
        settle(results)
    }
}

/// Let the node produce the outputs which no partition produced
fn finish_outputs<V, N>(
    node: &N,
    internals: Option<N::Internals>,
    assigned: &[bool],
    schemas: &[Schema],
    distributable: bool,
) -> Result<Vec<Option<Table<V>>>, ExecutionError>
where
    V: Data,
    N: StreamableNode<V>,
{
    let sinks = schemas
        .iter()
        .zip(assigned)
        .map(|(schema, assigned)| (distributable && !assigned).then(|| VecSink::new(schema.clone())))
        .collect_vec();
    let mut outputs = sinks
        .iter()
        .map(|sink| match sink {
            Some(sink) => PortOutput::Rows(Box::new(sink.clone())),
            None => PortOutput::Unassigned,
        })
        .collect_vec();
    node.finish_streamable_execution(internals, &mut outputs)
        .map_err(ExecutionError::Finish)?;
    if let Some(port) = outputs.iter().position(|o| !o.is_closed()) {
        return Err(ExecutionError::UnclosedOutput {
            partition: None,
            port,
        });
    }
    Ok(sinks
        .into_iter()
        .map(|sink| sink.map(|s| s.take_table()))
        .collect())
}

/// Number of chunks for the given inputs: the partition count if any input is
/// distributable, but never more chunks than a distributable input has rows
fn chunk_count<V>(
    distributable: bool,
    partitions: usize,
    roles: &[InputPortRole],
    inputs: &[Table<V>],
) -> usize {
    if !distributable {
        return 1;
    }
    roles
        .iter()
        .zip(inputs)
        .filter(|(role, _)| role.is_distributable())
        .fold(partitions.max(1), |chunks, (_, table)| {
            chunks.min(table.len().max(1))
        })
}

/// Split distributable inputs into chunks and duplicate all others, yielding one set of
/// input tables per partition
fn split_inputs<V: Data>(
    inputs: Vec<Table<V>>,
    roles: &[InputPortRole],
    chunks: usize,
) -> Vec<Vec<Table<V>>> {
    let mut partitioned: Vec<Vec<Table<V>>> = (0..chunks)
        .map(|_| Vec::with_capacity(inputs.len()))
        .collect();
    for (table, role) in inputs.into_iter().zip(roles) {
        let pieces = if role.is_distributable() && chunks > 1 {
            table.into_chunks(chunks)
        } else {
            vec![table; chunks]
        };
        for (tables, piece) in partitioned.iter_mut().zip(pieces) {
            tables.push(piece);
        }
    }
    partitioned
}

/// Collapse per partition results. The first failure in partition order wins, cancellation
/// is only reported if no partition failed for another reason.
fn settle<T>(results: Vec<Result<T, ExecutionError>>) -> Result<Vec<T>, ExecutionError> {
    let mut cancelled = false;
    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) if e.is_cancelled() => cancelled = true,
            Err(e) => return Err(e),
        }
    }
    if cancelled {
        Err(ExecutionError::Cancelled)
    } else {
        Ok(outcomes)
    }
}

fn decode_internals<I, V>(outcomes: Vec<PartitionOutcome<V>>) -> Result<Vec<I>, ExecutionError>
where
    I: serde::de::DeserializeOwned,
{
    outcomes
        .into_iter()
        .filter_map(|o| o.internals)
        .map(|bytes| rmp_serde::from_slice(&bytes).map_err(ExecutionError::from))
        .collect()
}

fn drain<V: Data>(input: &mut ChannelInput<V>) -> Result<Vec<Record<V>>, PortError> {
    let mut rows = Vec::new();
    while let Some(record) = input.poll()? {
        rows.push(record);
    }
    Ok(rows)
}

/// Run one operator instance with its ports wired to feeder and collector threads
fn run_partition<V, I, O>(
    mut operator: O,
    pass: Pass,
    tables: Vec<Table<V>>,
    input_roles: &[InputPortRole],
    outputs: &[Option<Schema>],
    ctx: ExecutionContext,
    capacity: usize,
) -> Result<PartitionOutcome<V>, ExecutionError>
where
    V: Data,
    I: serde::Serialize,
    O: StreamableOperator<V, I>,
{
    let partition = ctx.partition.index();
    let guard = FailFast::new(ctx.cancel_token().clone(), partition);
    let run = ctx.cancel_token().clone();

    let (result, unclosed, fed, drained) = thread::scope(|scope| {
        let mut feeders = Vec::new();
        let mut inputs = Vec::with_capacity(tables.len());
        for (table, role) in tables.into_iter().zip(input_roles) {
            if role.is_streamable() {
                let (mut feed, input) = port_pair(table.schema().clone(), capacity, &run);
                feeders.push(scope.spawn(move || feed.set_fully(table.into_rows())));
                inputs.push(PortInput::Rows(Box::new(input)));
            } else {
                inputs.push(PortInput::Table(table));
            }
        }

        let mut collectors = Vec::with_capacity(outputs.len());
        let mut ports = Vec::with_capacity(outputs.len());
        for schema in outputs {
            match schema {
                Some(schema) => {
                    let (output, mut input) = port_pair(schema.clone(), capacity, &run);
                    collectors.push(Some(scope.spawn(move || drain(&mut input))));
                    ports.push(PortOutput::Rows(Box::new(output)));
                }
                None => {
                    collectors.push(None);
                    ports.push(PortOutput::Unassigned);
                }
            }
        }

        let result = match pass {
            Pass::Intermediate => operator.run_intermediate(&mut inputs, &ctx),
            Pass::Final => operator.run_final(&mut inputs, &mut ports, &ctx),
        };
        let unclosed = ports.iter().position(|p| !p.is_closed());
        // tearing down the ports unblocks feeders and collectors
        drop(inputs);
        drop(ports);

        let fed = feeders
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(PortError::UpstreamLost)))
            .collect_vec();
        let drained = collectors
            .into_iter()
            .map(|h| h.map(|h| h.join().unwrap_or(Err(PortError::UpstreamLost))))
            .collect_vec();
        (result, unclosed, fed, drained)
    });

    let outcome = settle_partition(partition, pass, result, unclosed, fed, drained)
        .and_then(|outputs| {
            let internals = operator
                .save_internals()
                .map(|i| rmp_serde::to_vec(&i))
                .transpose()?;
            Ok(PartitionOutcome { outputs, internals })
        });
    match &outcome {
        Ok(_) => guard.disarm(),
        Err(e) => {
            debug!(partition, error = %e, "Partition did not complete");
            drop(guard);
        }
    }
    outcome
}

/// Decide the outcome of one partition. A failing feeder is the root cause of whatever the
/// operator saw afterwards, so it is reported first.
fn settle_partition<V>(
    partition: usize,
    pass: Pass,
    result: Result<(), OperatorError>,
    unclosed: Option<usize>,
    fed: Vec<Result<(), PortError>>,
    drained: Vec<Option<Result<Vec<Record<V>>, PortError>>>,
) -> Result<Vec<Option<Vec<Record<V>>>>, ExecutionError> {
    if let Some(err) = fed
        .into_iter()
        .filter_map(Result::err)
        .find(|e| *e != PortError::Cancelled)
    {
        return Err(ExecutionError::port(partition, err));
    }
    result.map_err(|e| ExecutionError::operator(partition, e))?;
    if let (Pass::Final, Some(port)) = (pass, unclosed) {
        return Err(ExecutionError::UnclosedOutput {
            partition: Some(partition),
            port,
        });
    }
    drained
        .into_iter()
        .map(|rows| rows.transpose().map_err(|e| ExecutionError::port(partition, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        operators::{LimitOperator, MapFunction},
        runtime::{FunctionNode, MergeOperator, OperatorNode},
        stream::StreamableFunction,
        testing::{init_tracing, int_schema, int_table, table_values},
        types::NoInternals,
    };

    fn executor(partitions: usize) -> StreamingExecutor {
        StreamingExecutor::builder()
            .partitions(partitions)
            .channel_capacity(2)
            .build()
    }

    /// Fails on one specific value
    struct FailOn(i64);

    impl StreamableFunction<i64> for FailOn {
        fn compute(&mut self, record: Record<i64>) -> Result<Record<i64>, OperatorError> {
            if record.values()[0] == self.0 {
                Err(OperatorError::msg(format!("refusing {}", self.0)))
            } else {
                Ok(record)
            }
        }
    }

    /// Blocks until cancelled, or fails right away on the given partition
    struct Stall {
        fail: Option<usize>,
    }

    impl StreamableOperator<i64> for Stall {
        fn run_final(
            &mut self,
            _inputs: &mut [PortInput<i64>],
            _outputs: &mut [PortOutput<i64>],
            ctx: &ExecutionContext,
        ) -> Result<(), OperatorError> {
            if self.fail == Some(ctx.partition.index()) {
                return Err(OperatorError::msg("stalled partition failed"));
            }
            loop {
                ctx.check_cancelled()?;
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Pushes its input but forgets to close the output
    struct Leaky;

    impl StreamableOperator<i64> for Leaky {
        fn run_final(
            &mut self,
            inputs: &mut [PortInput<i64>],
            outputs: &mut [PortOutput<i64>],
            _ctx: &ExecutionContext,
        ) -> Result<(), OperatorError> {
            let input = inputs[0].rows()?;
            let output = outputs[0].rows()?;
            while let Some(record) = input.poll()? {
                output.push(record)?;
            }
            Ok(())
        }
    }

    /// Emits the number of rows of its table input
    struct CountTable;

    impl StreamableOperator<i64> for CountTable {
        fn run_final(
            &mut self,
            inputs: &mut [PortInput<i64>],
            outputs: &mut [PortOutput<i64>],
            ctx: &ExecutionContext,
        ) -> Result<(), OperatorError> {
            let rows = inputs[0].table()?.len() as i64;
            let output = outputs[0].rows()?;
            output.push(Record::new(format!("Part{}", ctx.partition.index()), vec![rows]))?;
            output.close();
            Ok(())
        }
    }

    /// Passes records through and sums them up, the total is produced after the merge
    struct SumNode {
        merge: SumMerge,
    }

    struct SumMerge;

    impl MergeOperator<i64> for SumMerge {
        fn merge_final(&self, parts: Vec<i64>) -> Result<i64, OperatorError> {
            Ok(parts.into_iter().sum())
        }
    }

    struct SumOperator {
        sum: i64,
    }

    impl StreamableOperator<i64, i64> for SumOperator {
        fn run_final(
            &mut self,
            inputs: &mut [PortInput<i64>],
            outputs: &mut [PortOutput<i64>],
            _ctx: &ExecutionContext,
        ) -> Result<(), OperatorError> {
            let input = inputs[0].rows()?;
            let output = outputs[0].rows()?;
            while let Some(record) = input.poll()? {
                self.sum += record.values()[0];
                output.push(record)?;
            }
            output.close();
            Ok(())
        }

        fn save_internals(&mut self) -> Option<i64> {
            Some(self.sum)
        }
    }

    impl StreamableNode<i64> for SumNode {
        type Internals = i64;
        type Operator = SumOperator;

        fn name(&self) -> &str {
            "sum"
        }

        fn input_roles(&self) -> Vec<InputPortRole> {
            vec![InputPortRole::DISTRIBUTED_STREAMABLE]
        }

        fn output_roles(&self) -> Vec<OutputPortRole> {
            vec![OutputPortRole::Distributed, OutputPortRole::NonDistributed]
        }

        fn output_schemas(&self, _internals: Option<&i64>, input_schemas: &[Schema]) -> Vec<Schema> {
            vec![input_schemas[0].clone(), Schema::new(["total"]).unwrap()]
        }

        fn create_operator(&self, _partition: PartitionInfo) -> SumOperator {
            SumOperator { sum: 0 }
        }

        fn merge_operator(&self) -> Option<&dyn MergeOperator<i64>> {
            Some(&self.merge)
        }

        fn finish_streamable_execution(
            &self,
            internals: Option<i64>,
            outputs: &mut [PortOutput<i64>],
        ) -> Result<(), OperatorError> {
            let output = outputs[1].rows()?;
            output.push(Record::new("Total", vec![internals.unwrap_or_default()]))?;
            output.close();
            Ok(())
        }
    }

    /// Subtracts the mean of the input, which is computed in an intermediate pass
    struct CenterNode {
        merge: StatsMerge,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Stats {
        sum: i64,
        count: i64,
        mean: Option<i64>,
        rounds: u32,
    }

    struct StatsMerge;

    impl MergeOperator<Stats> for StatsMerge {
        fn merge_final(&self, parts: Vec<Stats>) -> Result<Stats, OperatorError> {
            let mut merged = parts.first().cloned().unwrap_or_default();
            merged.sum = parts.iter().map(|s| s.sum).sum();
            merged.count = parts.iter().map(|s| s.count).sum();
            Ok(merged)
        }
    }

    struct CenterOperator {
        stats: Stats,
    }

    impl StreamableOperator<i64, Stats> for CenterOperator {
        fn run_intermediate(
            &mut self,
            inputs: &mut [PortInput<i64>],
            _ctx: &ExecutionContext,
        ) -> Result<(), OperatorError> {
            let input = inputs[0].rows()?;
            while let Some(record) = input.poll()? {
                self.stats.sum += record.values()[0];
                self.stats.count += 1;
            }
            Ok(())
        }

        fn run_final(
            &mut self,
            inputs: &mut [PortInput<i64>],
            outputs: &mut [PortOutput<i64>],
            _ctx: &ExecutionContext,
        ) -> Result<(), OperatorError> {
            let mean = self.stats.mean.ok_or_else(|| OperatorError::msg("no mean"))?;
            let input = inputs[0].rows()?;
            let output = outputs[0].rows()?;
            while let Some(record) = input.poll()? {
                output.push(record.map(|x| x - mean))?;
            }
            output.close();
            Ok(())
        }

        fn save_internals(&mut self) -> Option<Stats> {
            Some(self.stats.clone())
        }

        fn load_internals(&mut self, internals: Stats) {
            // operators only count their own partition
            self.stats = Stats {
                sum: 0,
                count: 0,
                ..internals
            };
        }
    }

    impl StreamableNode<i64> for CenterNode {
        type Internals = Stats;
        type Operator = CenterOperator;

        fn name(&self) -> &str {
            "center"
        }

        fn input_roles(&self) -> Vec<InputPortRole> {
            vec![InputPortRole::DISTRIBUTED_STREAMABLE]
        }

        fn output_roles(&self) -> Vec<OutputPortRole> {
            vec![OutputPortRole::Distributed]
        }

        fn output_schemas(&self, internals: Option<&Stats>, input_schemas: &[Schema]) -> Vec<Schema> {
            assert!(internals.is_some_and(|s| s.mean.is_some()));
            input_schemas.to_vec()
        }

        fn create_operator(&self, _partition: PartitionInfo) -> CenterOperator {
            CenterOperator {
                stats: Stats::default(),
            }
        }

        fn initial_internals(&self) -> Option<Stats> {
            Some(Stats::default())
        }

        fn iterate(&self, internals: &mut Stats) -> bool {
            internals.rounds += 1;
            if internals.rounds == 1 {
                return true;
            }
            internals.mean = Some(internals.sum / internals.count.max(1));
            false
        }

        fn merge_operator(&self) -> Option<&dyn MergeOperator<Stats>> {
            Some(&self.merge)
        }
    }

    fn doubling_node() -> FunctionNode<
        impl Fn(PartitionInfo) -> MapFunction<fn(Record<i64>) -> Record<i64>>,
        MapFunction<fn(Record<i64>) -> Record<i64>>,
    > {
        FunctionNode::new("double", |_| {
            MapFunction::new((|r: Record<i64>| r.map(|x| x * 2)) as fn(Record<i64>) -> Record<i64>)
        })
    }

    /// Partitioned outputs come back in input order
    #[test]
    fn partitioned_map_keeps_order() {
        init_tracing();
        let values = (0..100).collect_vec();
        let out = executor(4)
            .execute(&doubling_node(), vec![int_table(&values)])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            table_values(&out[0]),
            values.iter().map(|x| x * 2).collect_vec()
        );
        assert_eq!(out[0].rows()[42].id().as_str(), "Row42");
    }

    #[test]
    fn empty_input_completes() {
        let out = executor(4)
            .execute(&doubling_node(), vec![int_table(&[])])
            .unwrap();
        assert!(out[0].is_empty());
        assert_eq!(out[0].schema(), &int_schema());
    }

    #[test]
    fn wrong_input_count() {
        let err = executor(1)
            .execute(&doubling_node(), vec![])
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::InputCount {
                expected: 1,
                actual: 0
            }
        ));
    }

    #[test]
    fn operator_failure_is_reported_with_partition() {
        let values = (0..40).collect_vec();
        let node = FunctionNode::new("fail", |_| FailOn(25));
        let err = executor(4)
            .execute(&node, vec![int_table(&values)])
            .unwrap_err();
        match err {
            ExecutionError::Operator { partition, source } => {
                assert_eq!(partition, 2);
                assert!(matches!(source, OperatorError::Failed(_)));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    /// One failing partition cancels the others, the failure wins over the cancellations
    #[test]
    fn failure_cancels_other_partitions() {
        init_tracing();
        let node = OperatorNode::builder()
            .name("stall")
            .build(|_| Stall { fail: Some(1) });
        let err = executor(3)
            .execute(&node, vec![int_table(&[1, 2, 3])])
            .unwrap_err();
        assert!(
            matches!(err, ExecutionError::Operator { partition: 1, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn external_cancellation() {
        let node = OperatorNode::builder()
            .name("stall")
            .build(|_| Stall { fail: None });
        let executor = executor(2);
        let token = executor.cancel_token().clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel();
        });
        let err = executor
            .execute(&node, vec![int_table(&[1, 2, 3, 4])])
            .unwrap_err();
        canceller.join().unwrap();
        assert!(err.is_cancelled());
    }

    /// A long lived executor does not accumulate state across runs
    #[test]
    fn repeated_runs_leave_no_wake_ups() {
        let executor = StreamingExecutor::default();
        let node = doubling_node();
        for _ in 0..1000 {
            executor.execute(&node, vec![int_table(&[1, 2, 3])]).unwrap();
        }
        assert_eq!(executor.cancel_token().registered_wake_ups(), 0);

        let stall = OperatorNode::builder()
            .name("stall")
            .build(|_| Stall { fail: Some(0) });
        assert!(executor.execute(&stall, vec![int_table(&[1, 2])]).is_err());
        assert_eq!(executor.cancel_token().registered_wake_ups(), 0);
    }

    #[test]
    fn panicking_operator() {
        let node = FunctionNode::new("panic", |partition: PartitionInfo| {
            MapFunction::new(move |r: Record<i64>| {
                if partition.index() == 1 {
                    panic!("boom");
                }
                r
            })
        });
        let err = executor(2)
            .execute(&node, vec![int_table(&[1, 2, 3, 4])])
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Panicked { partition: 1 }));
    }

    #[test]
    fn unclosed_output_is_detected() {
        let node = OperatorNode::builder().name("leaky").build(|_| Leaky);
        let err = executor(1)
            .execute(&node, vec![int_table(&[1, 2])])
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::UnclosedOutput {
                partition: Some(0),
                port: 0
            }
        ));
    }

    /// A non-distributed output of a distributable node needs a merge step
    #[test]
    fn missing_merge_operator() {
        let node = OperatorNode::builder()
            .name("needs-merge")
            .output_roles(vec![OutputPortRole::NonDistributed])
            .build(|_| CountTable);
        let err = executor(2)
            .execute(&node, vec![int_table(&[1, 2])])
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MissingMergeOperator));
    }

    /// Non-streamable inputs arrive as tables, chunked per partition
    #[test]
    fn table_inputs_are_chunked() {
        let node = OperatorNode::builder()
            .name("count")
            .input_roles(vec![InputPortRole::DISTRIBUTED_NONSTREAMABLE])
            .build(|_| CountTable);
        let out = executor(2)
            .execute(&node, vec![int_table(&[1, 2, 3, 4, 5, 6])])
            .unwrap();
        assert_eq!(table_values(&out[0]), vec![3, 3]);
    }

    /// Uneven splits put the remainder on the last partition, no partition runs empty
    #[test]
    fn uneven_chunks_leave_no_partition_empty() {
        let node = OperatorNode::builder()
            .name("count")
            .input_roles(vec![InputPortRole::DISTRIBUTED_NONSTREAMABLE])
            .build(|_| CountTable);
        let out = executor(4)
            .execute(&node, vec![int_table(&[1, 2, 3, 4, 5, 6])])
            .unwrap();
        let sizes = table_values(&out[0]);
        assert_eq!(sizes, vec![1, 1, 1, 3]);
        assert!(sizes.iter().all(|&rows| rows > 0));
    }

    /// Never more partitions than rows of a distributed input
    #[test]
    fn partitions_capped_by_rows() {
        let node = OperatorNode::builder()
            .name("count")
            .input_roles(vec![InputPortRole::DISTRIBUTED_NONSTREAMABLE])
            .build(|_| CountTable);
        let out = executor(8)
            .execute(&node, vec![int_table(&[1, 2])])
            .unwrap();
        assert_eq!(table_values(&out[0]), vec![1, 1]);
    }

    /// Non-distributed inputs are not split
    #[test]
    fn nondistributed_input_runs_once() {
        let node = OperatorNode::builder()
            .name("count")
            .input_roles(vec![InputPortRole::NONDISTRIBUTED_NONSTREAMABLE])
            .build(|_| CountTable);
        let out = executor(8)
            .execute(&node, vec![int_table(&[1, 2, 3])])
            .unwrap();
        assert_eq!(table_values(&out[0]), vec![3]);
    }

    #[test]
    fn merged_internals_produce_nondistributed_output() {
        let values = (1..=20).collect_vec();
        let node = SumNode { merge: SumMerge };
        for partitions in [1, 3] {
            let out = executor(partitions)
                .execute(&node, vec![int_table(&values)])
                .unwrap();
            assert_eq!(table_values(&out[0]), values);
            assert_eq!(table_values(&out[1]), vec![210]);
            assert_eq!(out[1].schema().columns().collect_vec(), vec!["total"]);
        }
    }

    #[test]
    fn iteration_computes_mean_first() {
        let values = (1..=9).collect_vec();
        let node = CenterNode { merge: StatsMerge };
        let out = executor(3)
            .execute(&node, vec![int_table(&values)])
            .unwrap();
        assert_eq!(table_values(&out[0]), (-4..=4).collect_vec());
    }

    /// The limit closes its input early, the feeder must not block on it
    #[test]
    fn early_stop_does_not_block_feeder() {
        let values = (0..10_000).collect_vec();
        let node = OperatorNode::builder()
            .name("head")
            .input_roles(vec![InputPortRole::NONDISTRIBUTED_STREAMABLE])
            .build(|_| LimitOperator::new(5));
        let out = executor(4)
            .execute(&node, vec![int_table(&values)])
            .unwrap();
        assert_eq!(table_values(&out[0]), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn progress_is_reported() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let executor = StreamingExecutor::builder()
            .partitions(2)
            .progress(Arc::new(move |_: PartitionInfo, _: u64, _: &crate::types::RowId| {
                counter.fetch_add(1, Ordering::Relaxed);
            }) as Arc<dyn ProgressSink>)
            .build();
        executor
            .execute(&doubling_node(), vec![int_table(&[1, 2, 3, 4, 5])])
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn internals_roundtrip_for_stateless_nodes() {
        assert!(rmp_serde::to_vec(&NoInternals).is_ok());
    }
}
