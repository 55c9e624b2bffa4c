mod codec;
mod local_store;
mod mutation_queue;
mod persistence;
mod primary_lease;
mod remote_document_cache;
mod target_cache;

pub use local_store::{LocalStore, QueryResult};
pub use mutation_queue::MutationQueue;
pub use persistence::{
    FilePersistence, MemoryPersistence, Persistence, PersistenceKind, PersistenceOp,
};
pub use primary_lease::{LeaseState, PrimaryLeaseManager, DEFAULT_LEASE_DURATION};
pub use remote_document_cache::RemoteDocumentCache;
pub use target_cache::{TargetCache, TargetMetadata};
