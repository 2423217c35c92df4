//! Building-block operators and functions
mod filter;
mod limit;
mod map;

pub use filter::FilterOperator;
pub use limit::LimitOperator;
pub use map::MapFunction;
