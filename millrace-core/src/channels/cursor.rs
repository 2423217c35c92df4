//! Cursor views over ports.
//!
//! [InputCursor] gives "is there more?" semantics on top of [RowInput::poll] by keeping a
//! one record lookahead. [OutputCursor] is the write side dual: it keeps one record in
//! progress which is committed when the next write begins or the cursor is closed.
use super::port::{PortError, RowInput, RowOutput};
use crate::types::{Data, Record};

/// Lookahead state of an [InputCursor]
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lookahead<V> {
    /// nothing buffered, next `can_advance` has to poll
    Empty,
    /// a polled record waits to be handed out
    Buffered(Record<V>),
    /// the input reached end of stream or the cursor was closed
    Closed,
}

/// Iterator-style read view over a [RowInput]
pub struct InputCursor<V, I> {
    input: I,
    lookahead: Lookahead<V>,
    input_closed: bool,
}

impl<V, I> InputCursor<V, I>
where
    V: Data,
    I: RowInput<V>,
{
    /// Wrap an input
    pub fn new(input: I) -> Self {
        Self {
            input,
            lookahead: Lookahead::Empty,
            input_closed: false,
        }
    }

    /// Check whether another record is available, blocking on the input if nothing
    /// is buffered yet.
    pub fn can_advance(&mut self) -> Result<bool, PortError> {
        match self.lookahead {
            Lookahead::Buffered(_) => Ok(true),
            Lookahead::Closed => Ok(false),
            Lookahead::Empty => match self.input.poll()? {
                Some(record) => {
                    self.lookahead = Lookahead::Buffered(record);
                    Ok(true)
                }
                None => {
                    self.lookahead = Lookahead::Closed;
                    Ok(false)
                }
            },
        }
    }

    /// Hand out the buffered record.
    ///
    /// Fails with [PortError::NotAdvanced] unless the last call to
    /// [InputCursor::can_advance] returned `true` and the record was not handed out yet.
    pub fn advance(&mut self) -> Result<Record<V>, PortError> {
        match std::mem::replace(&mut self.lookahead, Lookahead::Empty) {
            Lookahead::Buffered(record) => Ok(record),
            other => {
                self.lookahead = other;
                Err(PortError::NotAdvanced)
            }
        }
    }

    /// Close the cursor and the underlying input. The input is closed exactly once, no
    /// matter how often this is called.
    pub fn close(&mut self) {
        self.lookahead = Lookahead::Closed;
        if !self.input_closed {
            self.input_closed = true;
            self.input.close();
        }
    }

    /// Access the wrapped input
    pub fn get_ref(&self) -> &I {
        &self.input
    }
}

impl<V, I> Iterator for InputCursor<V, I>
where
    V: Data,
    I: RowInput<V>,
{
    type Item = Result<Record<V>, PortError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.can_advance() {
            Ok(true) => Some(self.advance()),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Write view over a [RowOutput] with a reusable, in-place mutable write buffer.
///
/// Every call to [OutputCursor::advance] commits the record written since the previous
/// call and hands out the buffer again. The last record is committed on
/// [OutputCursor::close].
pub struct OutputCursor<V, O> {
    output: O,
    buffer: Record<V>,
    in_progress: bool,
    closed: bool,
}

impl<V, O> OutputCursor<V, O>
where
    V: Data,
    O: RowOutput<V>,
{
    /// Wrap an output. `buffer` is the initial content of the write buffer, it should
    /// have the arity of the output's schema.
    pub fn new(output: O, buffer: Record<V>) -> Self {
        Self {
            output,
            buffer,
            in_progress: false,
            closed: false,
        }
    }

    /// Commit the record in progress (if any) and begin writing the next one
    pub fn advance(&mut self) -> Result<&mut Record<V>, PortError> {
        if self.closed {
            return Err(PortError::PushAfterClose);
        }
        self.commit()?;
        self.in_progress = true;
        Ok(&mut self.buffer)
    }

    fn commit(&mut self) -> Result<(), PortError> {
        if self.in_progress {
            self.in_progress = false;
            self.output.push(self.buffer.clone())?;
        }
        Ok(())
    }

    /// Commit the record in progress and close the output. Idempotent.
    ///
    /// The output is closed even if the final commit fails, the error is returned
    /// afterwards.
    pub fn close(&mut self) -> Result<(), PortError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let committed = self.commit();
        self.output.close();
        match committed {
            // nobody wants the last record, that is fine
            Err(PortError::OutputClosed) => Ok(()),
            x => x,
        }
    }

    /// Access the wrapped output
    pub fn get_ref(&self) -> &O {
        &self.output
    }
}
