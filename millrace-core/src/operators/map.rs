use crate::{
    errorhandling::OperatorError,
    stream::{ExecutionContext, StreamableFunction},
    types::Record,
};

/// Apply a closure to every record.
///
/// The closure receives the whole record, so it may change cells and the row id alike.
/// It must keep the arity of the output schema, the output port rejects anything else.
///
/// # Example
/// ```rust
/// use millrace::operators::MapFunction;
/// use millrace::sinks::VecSink;
/// use millrace::sources::IteratorInput;
/// use millrace::stream::{run_function, ExecutionContext};
/// use millrace::types::{Record, Schema};
///
/// let schema = Schema::new(["value"]).unwrap();
/// let rows = (0..100).map(|i| Record::new(format!("Row{i}"), vec![i]));
/// let mut input = IteratorInput::new(schema.clone(), rows);
/// let mut sink = VecSink::new(schema);
///
/// let mut double = MapFunction::new(|r: Record<i64>| r.map(|x| x * 2));
/// run_function(&mut double, &mut input, &mut sink, &ExecutionContext::standalone("map")).unwrap();
///
/// let expected: Vec<i64> = (0..100).map(|x| x * 2).collect();
/// let out: Vec<i64> = sink.into_iter().map(|r| r.values()[0]).collect();
/// assert_eq!(out, expected);
/// ```
pub struct MapFunction<M> {
    mapper: M,
    mapped: u64,
}

impl<M> MapFunction<M> {
    /// Create a function applying `mapper` to every record
    pub fn new(mapper: M) -> Self {
        Self { mapper, mapped: 0 }
    }

    /// Number of records mapped so far
    pub fn mapped(&self) -> u64 {
        self.mapped
    }
}

impl<V, M> StreamableFunction<V> for MapFunction<M>
where
    M: FnMut(Record<V>) -> Record<V> + Send,
{
    fn init(&mut self, _ctx: &ExecutionContext) -> Result<(), OperatorError> {
        self.mapped = 0;
        Ok(())
    }

    fn compute(&mut self, record: Record<V>) -> Result<Record<V>, OperatorError> {
        self.mapped += 1;
        Ok((self.mapper)(record))
    }
}
