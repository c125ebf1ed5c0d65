//! Generic queue processing: the bounded worker pool, the poll/dispatch loop
//! shared by the maintenance and ingestion queues, the processor registry and
//! the helpers every item processor builds on.

mod base;
mod dispatcher;
mod pool;
mod registry;

pub use base::{ItemProcessorBase, SopFileWalk, REMOVED_FILES_ALERT_CHUNK};
pub use dispatcher::{ItemProcessor, LockingQueue, QueueDispatcher, QueueEntry};
pub use pool::WorkerPool;
pub use registry::{ProcessorFactory, ProcessorRegistry};
