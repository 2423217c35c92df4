use std::{
    ops::RangeBounds,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    channels::{check_arity, PortError, RowOutput},
    types::{Data, Record, Schema, Table},
};

#[derive(Default)]
struct Collected<V> {
    rows: Vec<Record<V>>,
    closed: bool,
    pushed: u64,
}

/// A Helper to write records into a shared vector and take them out
/// again.
/// This is how the [StreamingExecutor](crate::runtime::StreamingExecutor) collects
/// output tables and is just as useful to capture the output of an operator in tests.
/// This struct uses an Arc<Mutex<..>> internally, so it can be freely
/// cloned and all clones see the same records.
///
/// Pushing never blocks, the sink applies no backpressure.
pub struct VecSink<V> {
    schema: Schema,
    inner: Arc<Mutex<Collected<V>>>,
}

impl<V> Clone for VecSink<V> {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> VecSink<V> {
    /// Create a new sink which collects all records into a `Vec`
    pub fn new(schema: Schema) -> Self {
        VecSink {
            schema,
            inner: Arc::new(Mutex::new(Collected {
                rows: Vec::new(),
                closed: false,
                pushed: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Collected<V>> {
        // a panic while holding the lock can not leave the vec half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the given range out of this sink
    pub fn drain_vec<R: RangeBounds<usize>>(&self, range: R) -> Vec<Record<V>> {
        self.lock().rows.drain(range).collect()
    }

    /// Returns the number of records currently held
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    /// True if the sink holds no records
    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }

    /// Take all records out of this sink as a table
    pub fn take_table(&self) -> Table<V> {
        Table::new(self.schema.clone(), self.drain_vec(..))
    }
}

impl<V> IntoIterator for VecSink<V> {
    type Item = Record<V>;

    type IntoIter = std::vec::IntoIter<Record<V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.drain_vec(..).into_iter()
    }
}

impl<V: Data> RowOutput<V> for VecSink<V> {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn push(&mut self, record: Record<V>) -> Result<(), PortError> {
        check_arity(&self.schema, &record)?;
        let mut inner = self.lock();
        if inner.closed {
            return Err(PortError::PushAfterClose);
        }
        inner.rows.push(record);
        inner.pushed += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn rows_pushed(&self) -> u64 {
        self.lock().pushed
    }
}
