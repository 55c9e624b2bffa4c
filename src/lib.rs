//! Offline-first Firestore client synchronization engine.
//!
//! This crate implements the consistency and delivery layer that sits between
//! a Firestore-style transport and application listener callbacks: a local
//! document cache, a durable queue of unacknowledged writes, live watch
//! subscriptions, a query view engine that merges cached state with pending
//! writes, and an event manager that diffs successive results into ordered
//! snapshots. Wire-level transport is abstracted behind the
//! [`remote::Datastore`] trait.

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use api::{
    references_equal, snapshots_equal, start_durable_or_memory_persistence,
    start_durable_persistence, start_memory_persistence,
    start_multi_tab_durable_or_memory_persistence, start_multi_tab_durable_persistence,
    CollectionReference, DocumentChange, DocumentChangeType, DocumentReference, DocumentSnapshot,
    Firestore, FirestoreClient, FirestoreSettings, GetSource, ListenerHandle, QuerySnapshot,
    SetOptions, SnapshotListenOptions, SnapshotMetadata, WriteAcknowledgment, CACHE_SIZE_UNLIMITED,
};
pub use core::queries_equal;
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
