use std::collections::{BTreeMap, VecDeque};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::core::{Query, TargetData};
use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{Document, DocumentKey, Mutation, MutationResult, Timestamp};
use crate::remote::watch_change::WatchChange;

/// Transport boundary between the sync engine and the backend. Production
/// deployments implement this over their wire protocol; tests drive the
/// engine through [`FakeDatastore`].
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Subscribes the target on the watch stream. Updates arrive on the
    /// receiver returned by [`Datastore::watch_events`].
    async fn listen(&self, target: &TargetData) -> FirestoreResult<()>;

    async fn unlisten(&self, target_id: i32) -> FirestoreResult<()>;

    /// Commits the mutations atomically, returning the commit version and
    /// one result per mutation.
    async fn commit(
        &self,
        mutations: &[Mutation],
    ) -> FirestoreResult<(Timestamp, Vec<MutationResult>)>;

    /// One-shot server read of a single document. Returns a missing
    /// document when the key does not exist on the backend.
    async fn lookup(&self, key: &DocumentKey) -> FirestoreResult<Document>;

    /// One-shot server execution of a query.
    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<Document>>;

    /// Stream of watch events. Cloned receivers share the same queue, so a
    /// single pump task should own the returned receiver.
    fn watch_events(&self) -> async_channel::Receiver<WatchChange>;
}

/// Deterministic in-process datastore. Tests script commit outcomes and push
/// watch events by hand, which makes stream-level scenarios reproducible.
pub struct FakeDatastore {
    sender: async_channel::Sender<WatchChange>,
    receiver: async_channel::Receiver<WatchChange>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    listened: BTreeMap<i32, TargetData>,
    commit_responses: VecDeque<FirestoreResult<(Timestamp, Vec<MutationResult>)>>,
    committed: Vec<Vec<Mutation>>,
    commit_clock: i64,
    server_documents: BTreeMap<DocumentKey, Document>,
    read_failure: Option<FirestoreError>,
}

impl FakeDatastore {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            sender,
            receiver,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Pushes a watch event as if the server had sent it.
    pub async fn push_watch_change(&self, change: WatchChange) {
        // Send only fails when the channel is closed, i.e. the client shut
        // down; events after shutdown are irrelevant.
        let _ = self.sender.send(change).await;
    }

    /// Scripts the outcome of the next commit. Without a scripted response
    /// commits succeed at an advancing fake clock.
    pub async fn enqueue_commit_response(
        &self,
        response: FirestoreResult<(Timestamp, Vec<MutationResult>)>,
    ) {
        self.state.lock().await.commit_responses.push_back(response);
    }

    pub async fn listened_targets(&self) -> Vec<i32> {
        self.state.lock().await.listened.keys().copied().collect()
    }

    pub async fn resume_token_for(&self, target_id: i32) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .listened
            .get(&target_id)
            .and_then(|target| target.resume_token().map(<[u8]>::to_vec))
    }

    /// Seeds the server-side state returned by lookups and query runs.
    pub async fn set_server_document(&self, document: Document) {
        self.state
            .lock()
            .await
            .server_documents
            .insert(document.key().clone(), document);
    }

    /// Makes every lookup and query run fail with `error` until cleared
    /// with `None`.
    pub async fn set_read_failure(&self, error: Option<FirestoreError>) {
        self.state.lock().await.read_failure = error;
    }

    pub async fn commit_count(&self) -> usize {
        self.state.lock().await.committed.len()
    }

    pub async fn committed_mutations(&self) -> Vec<Vec<Mutation>> {
        self.state.lock().await.committed.clone()
    }
}

impl Default for FakeDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for FakeDatastore {
    async fn listen(&self, target: &TargetData) -> FirestoreResult<()> {
        self.state
            .lock()
            .await
            .listened
            .insert(target.target_id(), target.clone());
        Ok(())
    }

    async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        self.state.lock().await.listened.remove(&target_id);
        Ok(())
    }

    async fn commit(
        &self,
        mutations: &[Mutation],
    ) -> FirestoreResult<(Timestamp, Vec<MutationResult>)> {
        let mut state = self.state.lock().await;
        if let Some(response) = state.commit_responses.pop_front() {
            if response.is_ok() {
                state.committed.push(mutations.to_vec());
            }
            return response;
        }
        state.committed.push(mutations.to_vec());
        state.commit_clock += 1;
        let version = Timestamp::new(state.commit_clock, 0);
        let results = mutations
            .iter()
            .map(|_| MutationResult {
                version: Some(version),
                transform_results: Vec::new(),
            })
            .collect();
        Ok((version, results))
    }

    async fn lookup(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let state = self.state.lock().await;
        if let Some(error) = &state.read_failure {
            return Err(error.clone());
        }
        Ok(state
            .server_documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::missing(key.clone(), Timestamp::new(state.commit_clock, 0))))
    }

    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<Document>> {
        let state = self.state.lock().await;
        if let Some(error) = &state.read_failure {
            return Err(error.clone());
        }
        Ok(state
            .server_documents
            .values()
            .filter(|document| query.matches(document))
            .cloned()
            .collect())
    }

    fn watch_events(&self) -> async_channel::Receiver<WatchChange> {
        self.receiver.clone()
    }
}
