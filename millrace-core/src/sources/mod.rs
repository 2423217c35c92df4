//! Inputs which produce records without an upstream operator
mod iterator_input;

pub use iterator_input::IteratorInput;
