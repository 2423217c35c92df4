//! Types and traits for data processed in Millrace
use serde::{Deserialize, Serialize};

/// Cell data which may move through a port.
/// Ports are handed between threads, so data must be `Send`.
#[diagnostic::on_unimplemented(message = "Type must be `Clone + Send + 'static` to be used as data")]
pub trait Data: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> Data for T {}

/// Zero sized indicator for operators which carry no internals between
/// iterations or partitions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoInternals;
