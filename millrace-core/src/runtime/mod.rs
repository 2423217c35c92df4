//! Runtimes determine where streamable nodes are executed. The [StreamingExecutor]
//! partitions the inputs of a node, runs one operator instance per partition on local
//! threads and merges what the instances produce.
mod executor;
mod failfast;
mod node;

pub use executor::{ExecutionError, StreamingExecutor};
pub use node::{FunctionNode, MergeOperator, OperatorNode, StreamableNode};
