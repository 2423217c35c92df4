use crate::{
    channels::{check_arity, PortError, RowInput},
    types::{Data, Record, Schema},
};

/// An input which yields records from an iterator.
///
/// Polling never blocks: the input reports end of stream as soon as the iterator is
/// exhausted. Useful to drive an operator directly from in-memory data without a
/// producer thread.
///
/// # Example
/// ```rust
/// use millrace::channels::RowInput;
/// use millrace::sources::IteratorInput;
/// use millrace::types::{Record, Schema};
///
/// let schema = Schema::new(["value"]).unwrap();
/// let mut input = IteratorInput::new(schema, vec![Record::new("Row0", vec![42])]);
/// assert_eq!(input.poll().unwrap().unwrap().values(), &[42]);
/// assert!(input.poll().unwrap().is_none());
/// ```
pub struct IteratorInput<V, I> {
    schema: Schema,
    // None once exhausted or closed
    iter: Option<I>,
    close_count: usize,
    _data: std::marker::PhantomData<fn() -> V>,
}

impl<V, I> IteratorInput<V, I>
where
    I: Iterator<Item = Record<V>>,
{
    /// Create a new input from an iterable of records
    pub fn new<T>(schema: Schema, records: T) -> Self
    where
        T: IntoIterator<Item = Record<V>, IntoIter = I>,
    {
        Self {
            schema,
            iter: Some(records.into_iter()),
            close_count: 0,
            _data: std::marker::PhantomData,
        }
    }

    /// How often [RowInput::close] was called on this input
    pub fn close_count(&self) -> usize {
        self.close_count
    }
}

impl<V, I> RowInput<V> for IteratorInput<V, I>
where
    V: Data,
    I: Iterator<Item = Record<V>> + Send,
{
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn poll(&mut self) -> Result<Option<Record<V>>, PortError> {
        let Some(iter) = self.iter.as_mut() else {
            return Ok(None);
        };
        match iter.next() {
            Some(record) => {
                check_arity(&self.schema, &record)?;
                Ok(Some(record))
            }
            None => {
                self.iter = None;
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.close_count += 1;
        self.iter = None;
    }
}
