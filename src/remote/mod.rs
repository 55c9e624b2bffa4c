//! Network side of the engine: the transport trait, the watch change
//! aggregator that turns stream events into consistent remote events, and
//! the remote store coordinating subscriptions and commits.

mod backoff;
mod datastore;
mod remote_event;
mod remote_store;
mod watch_change;
mod watch_change_aggregator;

pub use backoff::{calculate_backoff_millis, BackoffConfig};
pub use datastore::{Datastore, FakeDatastore};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, TargetListenState};
pub use watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
