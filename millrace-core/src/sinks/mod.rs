//! Outputs which collect records instead of forwarding them
mod vec_sink;
pub use vec_sink::VecSink;
