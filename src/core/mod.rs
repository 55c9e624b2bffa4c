pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod view;

pub use event_manager::{
    EventManager, ListenerRegistration, SnapshotCallback, SnapshotListenOptions, SyncCallback,
};
pub use query::{
    queries_equal, Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query,
};
pub use sync_engine::SyncEngine;
pub use target::TargetData;
pub use view::{View, ViewChange, ViewDocumentChange, ViewDocumentChangeType, ViewSnapshot};
