use std::collections::BTreeMap;
use std::sync::Arc;

use async_lock::Mutex;
use futures::channel::oneshot;

use crate::error::FirestoreResult;
use crate::local::codec;
use crate::local::persistence::{namespaces, Persistence};
use crate::model::{DocumentKey, Mutation, MutationBatch, Timestamp};

/// Durable FIFO of mutation batches awaiting server acknowledgement.
///
/// Batch ids are assigned monotonically and survive restarts: on load the
/// counter resumes above the highest persisted id. Acknowledge and reject
/// both drop the batch; a rejected batch is never retried.
pub struct MutationQueue {
    persistence: Arc<dyn Persistence>,
    state: Mutex<QueueState>,
}

struct QueueState {
    next_batch_id: i32,
    batches: BTreeMap<i32, MutationBatch>,
    drain_waiters: Vec<(i32, oneshot::Sender<()>)>,
}

fn batch_key(batch_id: i32) -> String {
    format!("{batch_id:010}")
}

impl MutationQueue {
    pub async fn load(persistence: Arc<dyn Persistence>) -> FirestoreResult<Self> {
        let mut batches = BTreeMap::new();
        for key in persistence.keys(namespaces::MUTATIONS).await? {
            if let Some(raw) = persistence.get(namespaces::MUTATIONS, &key).await? {
                let batch = codec::decode_mutation_batch(&raw)?;
                batches.insert(batch.batch_id, batch);
            }
        }
        let next_batch_id = batches.keys().next_back().map_or(1, |id| id + 1);
        Ok(Self {
            persistence,
            state: Mutex::new(QueueState {
                next_batch_id,
                batches,
                drain_waiters: Vec::new(),
            }),
        })
    }

    pub async fn enqueue(
        &self,
        mutations: Vec<Mutation>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<MutationBatch> {
        let mut state = self.state.lock().await;
        let batch_id = state.next_batch_id;
        state.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        self.persistence
            .put(
                namespaces::MUTATIONS,
                &batch_key(batch_id),
                &codec::encode_mutation_batch(&batch)?,
            )
            .await?;
        state.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    /// Removes the batch after server acknowledgement. Returns the batch, or
    /// `None` when it was already gone so repeated acks stay harmless.
    pub async fn acknowledge(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>> {
        self.remove(batch_id).await
    }

    /// Removes a batch the server refused. The mutations are dropped for
    /// good; the caller surfaces the error to the original writer.
    pub async fn reject(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>> {
        self.remove(batch_id).await
    }

    async fn remove(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>> {
        let mut state = self.state.lock().await;
        let removed = state.batches.remove(&batch_id);
        if removed.is_some() {
            self.persistence
                .delete(namespaces::MUTATIONS, &batch_key(batch_id))
                .await?;
            Self::notify_drain_waiters(&mut state);
        }
        Ok(removed)
    }

    fn notify_drain_waiters(state: &mut QueueState) {
        let lowest_pending = state.batches.keys().next().copied();
        let waiters = std::mem::take(&mut state.drain_waiters);
        for (watermark, sender) in waiters {
            let drained = match lowest_pending {
                Some(lowest) => lowest > watermark,
                None => true,
            };
            if drained {
                let _ = sender.send(());
            } else {
                state.drain_waiters.push((watermark, sender));
            }
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.batches.is_empty()
    }

    pub async fn highest_batch_id(&self) -> Option<i32> {
        self.state.lock().await.batches.keys().next_back().copied()
    }

    pub async fn all_batches(&self) -> Vec<MutationBatch> {
        self.state.lock().await.batches.values().cloned().collect()
    }

    pub async fn batch(&self, batch_id: i32) -> Option<MutationBatch> {
        self.state.lock().await.batches.get(&batch_id).cloned()
    }

    /// The oldest batch with an id strictly greater than `batch_id`. The
    /// write pipeline walks the queue with this after each acknowledgement.
    pub async fn next_batch_after(&self, batch_id: i32) -> Option<MutationBatch> {
        let state = self.state.lock().await;
        state
            .batches
            .range(batch_id + 1..)
            .next()
            .map(|(_, batch)| batch.clone())
    }

    /// All pending mutations touching `key`, oldest first, paired with the
    /// local write time of their batch.
    pub async fn mutations_for_key(&self, key: &DocumentKey) -> Vec<(Mutation, Timestamp)> {
        let state = self.state.lock().await;
        let mut mutations = Vec::new();
        for batch in state.batches.values() {
            for mutation in &batch.mutations {
                if mutation.key() == key {
                    mutations.push((mutation.clone(), batch.local_write_time));
                }
            }
        }
        mutations
    }

    /// Keys touched by any pending batch.
    pub async fn all_affected_keys(&self) -> Vec<DocumentKey> {
        let state = self.state.lock().await;
        let mut keys = Vec::new();
        for batch in state.batches.values() {
            for key in batch.document_keys() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Resolves once every batch enqueued before this call has been
    /// acknowledged or rejected. Batches enqueued afterwards do not delay
    /// the returned future.
    pub async fn drain_signal(&self) -> Option<oneshot::Receiver<()>> {
        let mut state = self.state.lock().await;
        let watermark = state.batches.keys().next_back().copied()?;
        let (sender, receiver) = oneshot::channel();
        state.drain_waiters.push((watermark, sender));
        Some(receiver)
    }
}
