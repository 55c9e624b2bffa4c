//! Public client surface: references, snapshots, settings, and the
//! started [`FirestoreClient`].

mod database;
mod operations;
mod reference;
mod snapshot;

pub use crate::core::SnapshotListenOptions;
pub use database::{
    start_durable_or_memory_persistence, start_durable_persistence, start_memory_persistence,
    start_multi_tab_durable_or_memory_persistence, start_multi_tab_durable_persistence, Firestore,
    FirestoreSettings, CACHE_SIZE_UNLIMITED,
};
pub use operations::{
    FirestoreClient, GetSource, ListenerHandle, SetOptions, WriteAcknowledgment,
};
pub use reference::{references_equal, CollectionReference, DocumentReference};
pub use snapshot::{
    snapshots_equal, DocumentChange, DocumentChangeType, DocumentSnapshot, QuerySnapshot,
    SnapshotMetadata,
};
