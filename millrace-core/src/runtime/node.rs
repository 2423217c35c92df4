//! Node level description of a streamable computation
use std::marker::PhantomData;

use bon::Builder;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    channels::PortOutput,
    errorhandling::OperatorError,
    stream::{FunctionOperator, StreamableFunction, StreamableOperator},
    types::{Data, InputPortRole, NoInternals, OutputPortRole, PartitionInfo, Schema},
};

/// Merges the internals of several operator instances into one
pub trait MergeOperator<I> {
    /// Merge internals after an intermediate pass. Defaults to [MergeOperator::merge_final].
    fn merge_intermediate(&self, parts: Vec<I>) -> Result<I, OperatorError> {
        self.merge_final(parts)
    }

    /// Merge internals after the final pass
    fn merge_final(&self, parts: Vec<I>) -> Result<I, OperatorError>;
}

/// A computation which can be executed as a set of streamable operators.
///
/// The node describes how its ports may be partitioned and streamed and creates one
/// operator instance per partition. Nodes carrying internals may iterate over their inputs
/// several times before the final pass and combine per partition results with a
/// [MergeOperator].
pub trait StreamableNode<V: Data> {
    /// State handed between node and operators. Travels serialized, as it would to an
    /// operator on another machine.
    type Internals: Serialize + DeserializeOwned + Send;
    /// Operator instance type
    type Operator: StreamableOperator<V, Self::Internals>;

    /// Name used in logs
    fn name(&self) -> &str;

    /// One role per input port
    fn input_roles(&self) -> Vec<InputPortRole>;

    /// One role per output port
    fn output_roles(&self) -> Vec<OutputPortRole>;

    /// Schemas of the output ports, computed after all intermediate passes
    fn output_schemas(
        &self,
        internals: Option<&Self::Internals>,
        input_schemas: &[Schema],
    ) -> Vec<Schema>;

    /// Create the operator instance for one partition
    fn create_operator(&self, partition: PartitionInfo) -> Self::Operator;

    /// Internals before the first pass. Nodes returning `Some` here iterate as long as
    /// [StreamableNode::iterate] says so.
    fn initial_internals(&self) -> Option<Self::Internals> {
        None
    }

    /// Decide whether another intermediate pass is needed. May update the internals.
    #[allow(unused)]
    fn iterate(&self, internals: &mut Self::Internals) -> bool {
        false
    }

    /// Operator to merge the internals of all partitions, if the node has one
    fn merge_operator(&self) -> Option<&dyn MergeOperator<Self::Internals>> {
        None
    }

    /// Produce the outputs which are not created by the operators. Only called if the node
    /// has a merge operator, with the merged internals of the final pass.
    ///
    /// In a partitioned execution `outputs` holds the non-distributed outputs, all others
    /// are [PortOutput::Unassigned]. Every output handed in must be closed.
    #[allow(unused)]
    fn finish_streamable_execution(
        &self,
        internals: Option<Self::Internals>,
        outputs: &mut [PortOutput<V>],
    ) -> Result<(), OperatorError> {
        Ok(())
    }
}

/// A node running a [StreamableFunction] on every partition of its single input.
///
/// # Example
/// ```rust
/// use millrace::operators::MapFunction;
/// use millrace::runtime::{FunctionNode, StreamingExecutor};
/// use millrace::types::{Record, Schema, Table};
///
/// let schema = Schema::new(["value"]).unwrap();
/// let rows = (0..10).map(|i| Record::new(format!("Row{i}"), vec![i])).collect();
/// let node = FunctionNode::new("double", |_partition| {
///     MapFunction::new(|r: Record<i64>| r.map(|x| x * 2))
/// });
///
/// let executor = StreamingExecutor::builder().partitions(3).build();
/// let out = executor.execute(&node, vec![Table::new(schema, rows)]).unwrap();
/// let values: Vec<i64> = out[0].rows().iter().map(|r| r.values()[0]).collect();
/// assert_eq!(values, (0..10).map(|x| x * 2).collect::<Vec<_>>());
/// ```
pub struct FunctionNode<C, F> {
    name: String,
    output_schema: Option<Schema>,
    factory: C,
    _function: PhantomData<fn() -> F>,
}

impl<C, F> FunctionNode<C, F>
where
    C: Fn(PartitionInfo) -> F,
{
    /// Create a node calling `factory` once per partition
    pub fn new(name: impl Into<String>, factory: C) -> Self {
        Self {
            name: name.into(),
            output_schema: None,
            factory,
            _function: PhantomData,
        }
    }

    /// Set the output schema. By default the input schema is passed through.
    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

impl<V, C, F> StreamableNode<V> for FunctionNode<C, F>
where
    V: Data,
    C: Fn(PartitionInfo) -> F,
    F: StreamableFunction<V>,
{
    type Internals = NoInternals;
    type Operator = FunctionOperator<F>;

    fn name(&self) -> &str {
        &self.name
    }

    fn input_roles(&self) -> Vec<InputPortRole> {
        vec![InputPortRole::DISTRIBUTED_STREAMABLE]
    }

    fn output_roles(&self) -> Vec<OutputPortRole> {
        vec![OutputPortRole::Distributed]
    }

    fn output_schemas(&self, _internals: Option<&NoInternals>, input_schemas: &[Schema]) -> Vec<Schema> {
        let schema = self
            .output_schema
            .clone()
            .or_else(|| input_schemas.first().cloned())
            .unwrap_or_default();
        vec![schema]
    }

    fn create_operator(&self, partition: PartitionInfo) -> Self::Operator {
        FunctionOperator::new((self.factory)(partition))
    }
}

/// A node running an arbitrary operator without internals.
///
/// Roles default to one distributed, streamable input and one distributed output.
/// Unless given explicitly, every output has the schema of the first input.
///
/// # Example
/// ```rust
/// use millrace::operators::LimitOperator;
/// use millrace::runtime::{OperatorNode, StreamingExecutor};
/// use millrace::types::{InputPortRole, Record, Schema, Table};
///
/// let schema = Schema::new(["value"]).unwrap();
/// let rows = (0..100).map(|i| Record::new(format!("Row{i}"), vec![i])).collect();
/// let node = OperatorNode::builder()
///     .name("head")
///     .input_roles(vec![InputPortRole::NONDISTRIBUTED_STREAMABLE])
///     .build(|_partition| LimitOperator::new(5));
///
/// let out = StreamingExecutor::default()
///     .execute(&node, vec![Table::new(schema, rows)])
///     .unwrap();
/// assert_eq!(out[0].len(), 5);
/// ```
#[derive(Builder)]
#[builder(on(String, into))]
pub struct OperatorNode<C, O>
where
    C: Fn(PartitionInfo) -> O,
{
    #[builder(finish_fn)]
    factory: C,
    name: String,
    #[builder(default = vec![InputPortRole::DISTRIBUTED_STREAMABLE])]
    input_roles: Vec<InputPortRole>,
    #[builder(default = vec![OutputPortRole::Distributed])]
    output_roles: Vec<OutputPortRole>,
    output_schemas: Option<Vec<Schema>>,
    #[builder(skip)]
    operator: PhantomData<fn() -> O>,
}

impl<V, C, O> StreamableNode<V> for OperatorNode<C, O>
where
    V: Data,
    C: Fn(PartitionInfo) -> O,
    O: StreamableOperator<V>,
{
    type Internals = NoInternals;
    type Operator = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn input_roles(&self) -> Vec<InputPortRole> {
        self.input_roles.clone()
    }

    fn output_roles(&self) -> Vec<OutputPortRole> {
        self.output_roles.clone()
    }

    fn output_schemas(&self, _internals: Option<&NoInternals>, input_schemas: &[Schema]) -> Vec<Schema> {
        match &self.output_schemas {
            Some(schemas) => schemas.clone(),
            None => {
                let schema = input_schemas.first().cloned().unwrap_or_default();
                vec![schema; self.output_roles.len()]
            }
        }
    }

    fn create_operator(&self, partition: PartitionInfo) -> Self::Operator {
        (self.factory)(partition)
    }
}
