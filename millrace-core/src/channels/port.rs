//! Port interfaces.
//!
//! A port is one end of a one-directional record channel. [RowInput] is the pulling end,
//! [RowOutput] the pushing end. The traits do not assume how records travel, the
//! in-memory channel pair in [operator_io](super::operator_io) is one implementation,
//! [VecSink](crate::sinks::VecSink) and [IteratorInput](crate::sources::IteratorInput)
//! are others.
use thiserror::Error;

use crate::errorhandling::OperatorError;
use crate::types::{Record, Schema, Table};

/// Errors and signals raised by port operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// The surrounding execution was cancelled while the call was blocked or before it
    /// started
    #[error("Port operation cancelled")]
    Cancelled,
    /// The consumer closed its input and demands no more records. This is a signal for
    /// the producer to stop, not necessarily a failure.
    #[error("Downstream closed the port, no more output is demanded")]
    OutputClosed,
    /// The producer pushed after it closed its own output
    #[error("Push after the output was closed")]
    PushAfterClose,
    /// `set_fully` was called on an output which already received records
    #[error("Output already produced records, can not set it fully")]
    AlreadyProduced,
    /// The producer went away without closing its output, e.g. because it failed
    #[error("Upstream vanished without closing the port")]
    UpstreamLost,
    /// A cursor was advanced without a prior successful `can_advance`
    #[error("Cursor advanced without a buffered record")]
    NotAdvanced,
    /// A record did not match the arity of the port's schema
    #[error("Record has {actual} cells but the port schema has {expected} columns")]
    ArityMismatch {
        /// arity of the port schema
        expected: usize,
        /// arity of the offending record
        actual: usize,
    },
}

/// Pull based end of a record port.
pub trait RowInput<V>: Send {
    /// Schema of all records on this port. Available before the first poll.
    fn schema(&self) -> &Schema;

    /// Get the next record, blocking until one is available.
    ///
    /// Returns `Ok(None)` once the upstream closed the port (end of stream) and keeps
    /// returning `Ok(None)` on every further call.
    fn poll(&mut self) -> Result<Option<Record<V>>, PortError>;

    /// Signal that no more records are needed. Idempotent.
    fn close(&mut self);
}

/// Push based end of a record port.
pub trait RowOutput<V>: Send {
    /// Schema of all records on this port
    fn schema(&self) -> &Schema;

    /// Hand a record downstream, blocking while downstream can not accept it.
    ///
    /// Fails with [PortError::OutputClosed] once downstream closed its end.
    fn push(&mut self, record: Record<V>) -> Result<(), PortError>;

    /// Signal end of stream to downstream. Idempotent.
    fn close(&mut self);

    /// True once [RowOutput::close] was called
    fn is_closed(&self) -> bool;

    /// Number of records successfully pushed so far
    fn rows_pushed(&self) -> u64;

    /// Push all given records and close the output.
    ///
    /// Fails with [PortError::AlreadyProduced] if anything was pushed before.
    /// If downstream closes midway, the remaining records are discarded and the output
    /// is closed normally.
    fn set_fully(&mut self, records: Vec<Record<V>>) -> Result<(), PortError> {
        if self.rows_pushed() > 0 {
            return Err(PortError::AlreadyProduced);
        }
        for record in records {
            match self.push(record) {
                Ok(()) => {}
                Err(PortError::OutputClosed) => break,
                Err(e) => return Err(e),
            }
        }
        self.close();
        Ok(())
    }
}

impl<V, T: RowInput<V> + ?Sized> RowInput<V> for &mut T {
    fn schema(&self) -> &Schema {
        (**self).schema()
    }

    fn poll(&mut self) -> Result<Option<Record<V>>, PortError> {
        (**self).poll()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<V, T: RowOutput<V> + ?Sized> RowOutput<V> for &mut T {
    fn schema(&self) -> &Schema {
        (**self).schema()
    }

    fn push(&mut self, record: Record<V>) -> Result<(), PortError> {
        (**self).push(record)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn rows_pushed(&self) -> u64 {
        (**self).rows_pushed()
    }
}

/// An input as handed to an operator: either a stream of records or, for non-streamable
/// input roles, the whole table at once.
pub enum PortInput<V> {
    /// Streamed records
    Rows(Box<dyn RowInput<V>>),
    /// Materialized table
    Table(Table<V>),
}

impl<V> PortInput<V> {
    /// Access the streamed records of this input
    pub fn rows(&mut self) -> Result<&mut dyn RowInput<V>, OperatorError> {
        match self {
            PortInput::Rows(input) => Ok(input.as_mut()),
            PortInput::Table(_) => Err(OperatorError::PortMismatch(
                "expected a streamed input but got a table".to_string(),
            )),
        }
    }

    /// Access the table of this input
    pub fn table(&self) -> Result<&Table<V>, OperatorError> {
        match self {
            PortInput::Table(table) => Ok(table),
            PortInput::Rows(_) => Err(OperatorError::PortMismatch(
                "expected a table input but got a stream".to_string(),
            )),
        }
    }

    /// Schema of this input
    pub fn schema(&self) -> &Schema {
        match self {
            PortInput::Rows(input) => input.schema(),
            PortInput::Table(table) => table.schema(),
        }
    }
}

/// An output slot as handed to an operator.
pub enum PortOutput<V> {
    /// The operator produces records into this output
    Rows(Box<dyn RowOutput<V>>),
    /// The operator must not produce this output, it is created after merging the internals
    /// of all partitions
    Unassigned,
}

impl<V> PortOutput<V> {
    /// Access the record output of this slot
    pub fn rows(&mut self) -> Result<&mut dyn RowOutput<V>, OperatorError> {
        match self {
            PortOutput::Rows(output) => Ok(output.as_mut()),
            PortOutput::Unassigned => Err(OperatorError::PortMismatch(
                "output is not assigned to this operator instance".to_string(),
            )),
        }
    }

    /// True if this slot is unassigned or its output was closed
    pub fn is_closed(&self) -> bool {
        match self {
            PortOutput::Rows(output) => output.is_closed(),
            PortOutput::Unassigned => true,
        }
    }
}

/// Check a record against a schema before it enters a port
pub(crate) fn check_arity<V>(schema: &Schema, record: &Record<V>) -> Result<(), PortError> {
    if schema.arity() == record.arity() {
        Ok(())
    } else {
        Err(PortError::ArityMismatch {
            expected: schema.arity(),
            actual: record.arity(),
        })
    }
}
