//! In-memory record ports. These inputs and outputs are how operators
//! **in the same process** exchange records.
//! Essentially these are the edges of the dataflow graph.
//!
//! A port pair is a bounded channel: pushing blocks while the channel is full, which is
//! what propagates backpressure upstream. Both ends select on the [CancelToken] the pair
//! was created with, so a blocked call returns promptly once execution is cancelled.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use flume::{Receiver, Selector, Sender, TrySendError};
use tracing::debug;

use super::port::{check_arity, PortError, RowInput, RowOutput};
use crate::cancellation::CancelToken;
use crate::types::{Data, Record, Schema};

/// Create a linked output/input pair.
///
/// `capacity` is the number of records the channel buffers before `push` blocks, a
/// capacity of `0` makes every push a rendezvous with a poll.
pub fn port_pair<V: Data>(
    schema: Schema,
    capacity: usize,
    cancel: &CancelToken,
) -> (ChannelOutput<V>, ChannelInput<V>) {
    let (tx, rx) = flume::bounded(capacity);
    let closed_by_producer = Arc::new(AtomicBool::new(false));
    let output = ChannelOutput {
        sender: Some(tx),
        schema: schema.clone(),
        cancel: cancel.clone(),
        closed_by_producer: Arc::clone(&closed_by_producer),
        pushed: 0,
    };
    let input = ChannelInput {
        receiver: Some(rx),
        schema,
        cancel: cancel.clone(),
        closed_by_producer,
        state: InputState::Open,
    };
    (output, input)
}

/// Outcome of a blocking select on a data channel and the cancellation signal
enum Wake<T> {
    Ready(T),
    Disconnected,
    Cancelled,
}

/// Pushing end of an in-memory port
pub struct ChannelOutput<V> {
    // None after close
    sender: Option<Sender<Record<V>>>,
    schema: Schema,
    cancel: CancelToken,
    closed_by_producer: Arc<AtomicBool>,
    pushed: u64,
}

impl<V: Data> RowOutput<V> for ChannelOutput<V> {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn push(&mut self, record: Record<V>) -> Result<(), PortError> {
        let sender = self.sender.as_ref().ok_or(PortError::PushAfterClose)?;
        check_arity(&self.schema, &record)?;
        if self.cancel.is_cancelled() {
            return Err(PortError::Cancelled);
        }
        let record = match sender.try_send(record) {
            Ok(()) => {
                self.pushed += 1;
                return Ok(());
            }
            Err(TrySendError::Disconnected(_)) => return Err(PortError::OutputClosed),
            Err(TrySendError::Full(record)) => record,
        };
        let woke = Selector::new()
            .send(sender, record, |res| match res {
                Ok(()) => Wake::Ready(()),
                Err(_) => Wake::Disconnected,
            })
            .recv(self.cancel.signal(), |_| Wake::Cancelled)
            .wait();
        match woke {
            Wake::Ready(()) => {
                self.pushed += 1;
                Ok(())
            }
            Wake::Disconnected => Err(PortError::OutputClosed),
            Wake::Cancelled => Err(PortError::Cancelled),
        }
    }

    fn close(&mut self) {
        if let Some(sender) = self.sender.take() {
            // must be visible before the consumer observes the disconnect
            self.closed_by_producer.store(true, Ordering::Release);
            drop(sender);
            debug!(rows = self.pushed, "Output closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    fn rows_pushed(&self) -> u64 {
        self.pushed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    Open,
    EndOfStream,
    Lost,
}

/// Pulling end of an in-memory port
pub struct ChannelInput<V> {
    // None after close
    receiver: Option<Receiver<Record<V>>>,
    schema: Schema,
    cancel: CancelToken,
    closed_by_producer: Arc<AtomicBool>,
    state: InputState,
}

impl<V> ChannelInput<V> {
    fn on_disconnect(&mut self) -> Result<Option<Record<V>>, PortError> {
        if self.closed_by_producer.load(Ordering::Acquire) {
            self.state = InputState::EndOfStream;
            Ok(None)
        } else {
            self.state = InputState::Lost;
            Err(PortError::UpstreamLost)
        }
    }
}

impl<V: Data> RowInput<V> for ChannelInput<V> {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn poll(&mut self) -> Result<Option<Record<V>>, PortError> {
        match self.state {
            InputState::Open => (),
            InputState::EndOfStream => return Ok(None),
            InputState::Lost => return Err(PortError::UpstreamLost),
        }
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };
        if self.cancel.is_cancelled() {
            return Err(PortError::Cancelled);
        }
        let woke = Selector::new()
            .recv(receiver, |res| match res {
                Ok(record) => Wake::Ready(record),
                Err(_) => Wake::Disconnected,
            })
            .recv(self.cancel.signal(), |_| Wake::Cancelled)
            .wait();
        match woke {
            Wake::Ready(record) => Ok(Some(record)),
            Wake::Disconnected => self.on_disconnect(),
            Wake::Cancelled => Err(PortError::Cancelled),
        }
    }

    fn close(&mut self) {
        // dropping the receiver makes every pending and future push fail with OutputClosed
        if self.receiver.take().is_some() {
            debug!("Input closed");
        }
    }
}
