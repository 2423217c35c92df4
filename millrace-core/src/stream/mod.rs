//! Operators, functions and the context they run in
mod operator;

pub use operator::{
    input_rows, output_rows, run_function, run_interwoven, ExecutionContext, FunctionOperator,
    NoProgress, OperatorState, ProgressSink, StreamableFunction, StreamableOperator,
};
