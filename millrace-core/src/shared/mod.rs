//! Single-slot object handoff between two operators.
//!
//! Instead of copying a large object through a port every round, a producer and a consumer
//! share it through a container and synchronize with an "updated" / "processed" handshake.
//! See [shared_container].
mod container;

pub use container::{
    shared_container, HandoffCompletion, HandshakeMode, HandshakeStats, SharedConsumer,
    SharedError, SharedProducer, SharedReadGuard, SharedWriteGuard,
};
