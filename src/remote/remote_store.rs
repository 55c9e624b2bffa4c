use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use log::{debug, warn};

use crate::core::TargetData;
use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{Mutation, MutationResult, Timestamp};
use crate::remote::backoff::{calculate_backoff_millis, BackoffConfig};
use crate::remote::datastore::Datastore;
use crate::remote::watch_change::WatchChange;

const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Lifecycle of one watched target on the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetListenState {
    /// Listen sent, no server response yet.
    Subscribing,
    /// The server has started delivering events for the target.
    Active,
    /// The target's accumulated state was invalidated and the listen was
    /// restarted without a resume token.
    ResumingAfterGap,
}

struct ListenEntry {
    target: TargetData,
    state: TargetListenState,
}

/// Owns the network side of the engine: which targets are subscribed, the
/// enabled/disabled network switch, and the commit retry loop. Stream events
/// are consumed by the sync engine from [`RemoteStore::watch_events`].
pub struct RemoteStore {
    datastore: Arc<dyn Datastore>,
    backoff: BackoffConfig,
    state: Mutex<StoreState>,
}

struct StoreState {
    network_enabled: bool,
    targets: BTreeMap<i32, ListenEntry>,
}

impl RemoteStore {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            backoff: BackoffConfig::default(),
            state: Mutex::new(StoreState {
                network_enabled: true,
                targets: BTreeMap::new(),
            }),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn watch_events(&self) -> async_channel::Receiver<WatchChange> {
        self.datastore.watch_events()
    }

    pub async fn is_network_enabled(&self) -> bool {
        self.state.lock().await.network_enabled
    }

    /// Resubscribes every registered target. Safe to call when already
    /// enabled.
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.network_enabled = true;
        for entry in state.targets.values_mut() {
            entry.state = TargetListenState::Subscribing;
            self.datastore.listen(&entry.target).await?;
        }
        debug!("network enabled, {} target(s) resubscribed", state.targets.len());
        Ok(())
    }

    /// Tears the stream subscriptions down but keeps the target registry so
    /// a later enable picks up where it left off.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.network_enabled {
            return Ok(());
        }
        state.network_enabled = false;
        for (target_id, entry) in state.targets.iter_mut() {
            entry.state = TargetListenState::Subscribing;
            self.datastore.unlisten(*target_id).await?;
        }
        debug!("network disabled");
        Ok(())
    }

    pub async fn listen(&self, target: TargetData) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let target_id = target.target_id();
        if state.network_enabled {
            self.datastore.listen(&target).await?;
        }
        state.targets.insert(
            target_id,
            ListenEntry {
                target,
                state: TargetListenState::Subscribing,
            },
        );
        Ok(())
    }

    pub async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.targets.remove(&target_id).is_some() && state.network_enabled {
            self.datastore.unlisten(target_id).await?;
        }
        Ok(())
    }

    pub async fn mark_target_active(&self, target_id: i32) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.targets.get_mut(&target_id) {
            entry.state = TargetListenState::Active;
        }
    }

    pub async fn target_state(&self, target_id: i32) -> Option<TargetListenState> {
        self.state
            .lock()
            .await
            .targets
            .get(&target_id)
            .map(|entry| entry.state)
    }

    /// Restarts the listen from scratch after the target's local state was
    /// invalidated. The resume token is dropped so the server replays the
    /// full membership.
    pub async fn restart_target(&self, target_id: i32) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.targets.get_mut(&target_id) else {
            return Ok(());
        };
        entry.target = entry
            .target
            .clone()
            .with_resume_token(None)
            .with_snapshot_version(None);
        entry.state = TargetListenState::ResumingAfterGap;
        if state.network_enabled {
            self.datastore.unlisten(target_id).await?;
            self.datastore.listen(&state.targets[&target_id].target).await?;
        }
        Ok(())
    }

    /// Commits a batch, retrying retryable failures with jittered backoff.
    /// Non-retryable failures and exhaustion both surface to the caller,
    /// which rejects the batch.
    pub async fn commit(
        &self,
        mutations: &[Mutation],
    ) -> FirestoreResult<(Timestamp, Vec<MutationResult>)> {
        let mut attempt = 0;
        loop {
            match self.datastore.commit(mutations).await {
                Ok(result) => return Ok(result),
                Err(err) if Self::should_retry(&err, attempt) => {
                    let delay = calculate_backoff_millis(attempt, self.backoff);
                    warn!(
                        "commit attempt {} failed ({}), retrying in {delay}ms",
                        attempt + 1,
                        err
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn should_retry(err: &FirestoreError, attempt: u32) -> bool {
        attempt + 1 < MAX_COMMIT_ATTEMPTS && err.code.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::error::unavailable;
    use crate::model::ResourcePath;
    use crate::remote::datastore::FakeDatastore;
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap as Map;

    fn target(id: i32) -> TargetData {
        let query =
            Query::collection(ResourcePath::from_string("cities").unwrap()).unwrap();
        TargetData::new(id, query)
    }

    fn mutation(path: &str) -> Mutation {
        let mut fields = Map::new();
        fields.insert("v".to_string(), FirestoreValue::from_integer(1));
        Mutation::set(
            crate::model::DocumentKey::from_string(path).unwrap(),
            MapValue::new(fields),
        )
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            interval_millis: 1,
            backoff_factor: 1.0,
            max_millis: 2,
        }
    }

    #[tokio::test]
    async fn disable_network_unlistens_but_keeps_the_registry() {
        let datastore = Arc::new(FakeDatastore::new());
        let store = RemoteStore::new(datastore.clone());
        store.listen(target(1)).await.unwrap();
        assert_eq!(datastore.listened_targets().await, vec![1]);

        store.disable_network().await.unwrap();
        assert!(datastore.listened_targets().await.is_empty());

        store.enable_network().await.unwrap();
        assert_eq!(datastore.listened_targets().await, vec![1]);
    }

    #[tokio::test]
    async fn listens_are_deferred_while_offline() {
        let datastore = Arc::new(FakeDatastore::new());
        let store = RemoteStore::new(datastore.clone());
        store.disable_network().await.unwrap();
        store.listen(target(1)).await.unwrap();
        assert!(datastore.listened_targets().await.is_empty());

        store.enable_network().await.unwrap();
        assert_eq!(datastore.listened_targets().await, vec![1]);
    }

    #[tokio::test]
    async fn restart_drops_the_resume_token() {
        let datastore = Arc::new(FakeDatastore::new());
        let store = RemoteStore::new(datastore.clone());
        store
            .listen(target(1).with_resume_token(Some(vec![1, 2])))
            .await
            .unwrap();
        assert_eq!(datastore.resume_token_for(1).await, Some(vec![1, 2]));

        store.restart_target(1).await.unwrap();
        assert_eq!(datastore.resume_token_for(1).await, None);
        assert_eq!(
            store.target_state(1).await,
            Some(TargetListenState::ResumingAfterGap)
        );
    }

    #[tokio::test]
    async fn commit_retries_unavailable_then_succeeds() {
        let datastore = Arc::new(FakeDatastore::new());
        datastore
            .enqueue_commit_response(Err(unavailable("try later")))
            .await;
        let store = RemoteStore::new(datastore.clone()).with_backoff(fast_backoff());
        let result = store.commit(&[mutation("cities/sf")]).await;
        assert!(result.is_ok());
        assert_eq!(datastore.commit_count().await, 1);
    }

    #[tokio::test]
    async fn commit_does_not_retry_permanent_failures() {
        let datastore = Arc::new(FakeDatastore::new());
        datastore
            .enqueue_commit_response(Err(crate::error::permission_denied("nope")))
            .await;
        let store = RemoteStore::new(datastore.clone()).with_backoff(fast_backoff());
        let err = store.commit(&[mutation("cities/sf")]).await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/permission-denied");
        assert_eq!(datastore.commit_count().await, 0);
    }
}
