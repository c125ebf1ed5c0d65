//! Repository ports grouped by bounded context. Processors depend on the
//! aggregate [`PacsStore`]; adapters implement each port separately.

pub mod filesystems;
pub mod reconcile;
pub mod service_lock;
pub mod study_storage;
pub mod work_queue;

pub use filesystems::FilesystemRepository;
pub use reconcile::{ReconcileEntryDraft, ReconcileInsert, ReconcileRepository};
pub use service_lock::ServiceLockRepository;
pub use study_storage::{InstanceIndexRepository, StudyStorageRepository};
pub use work_queue::WorkQueueRepository;

/// Everything the processing core needs from the store.
pub trait PacsStore:
    ServiceLockRepository
    + WorkQueueRepository
    + StudyStorageRepository
    + InstanceIndexRepository
    + ReconcileRepository
    + FilesystemRepository
{
}

impl<T> PacsStore for T where
    T: ServiceLockRepository
        + WorkQueueRepository
        + StudyStorageRepository
        + InstanceIndexRepository
        + ReconcileRepository
        + FilesystemRepository
{
}
