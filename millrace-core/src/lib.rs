//! Millrace is the streaming execution core of a dataflow engine.
//!
//! Operators exchange records through bounded [channels] ports which propagate
//! backpressure, run as [stream::StreamableFunction]s or general
//! [stream::StreamableOperator]s and may hand large objects to each other through a
//! [shared] container instead of copying them. The [runtime::StreamingExecutor] partitions
//! the inputs of a [runtime::StreamableNode] and runs one operator instance per partition.
pub mod cancellation;
pub mod channels;
pub mod errorhandling;
pub mod operators;
pub mod runtime;
pub mod shared;
pub mod sinks;
pub mod sources;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
