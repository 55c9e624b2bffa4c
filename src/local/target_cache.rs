use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_lock::Mutex;
use serde_json::{json, Value};

use crate::error::{internal_error, FirestoreResult};
use crate::local::codec;
use crate::local::persistence::{namespaces, Persistence};
use crate::model::{DocumentKey, Timestamp};

/// Persisted bookkeeping for one watch target: the resume token to restart
/// the stream from, the last snapshot version, whether the server has marked
/// the target current, and the keys the server says are in the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetMetadata {
    pub target_id: i32,
    pub canonical_id: String,
    pub resume_token: Vec<u8>,
    pub snapshot_version: Timestamp,
    pub current: bool,
    pub remote_keys: BTreeSet<DocumentKey>,
}

impl TargetMetadata {
    fn new(target_id: i32, canonical_id: String) -> Self {
        Self {
            target_id,
            canonical_id,
            resume_token: Vec::new(),
            snapshot_version: Timestamp::default(),
            current: false,
            remote_keys: BTreeSet::new(),
        }
    }
}

fn target_key(target_id: i32) -> String {
    format!("{target_id:010}")
}

const HIGHEST_TARGET_ID_KEY: &str = "highest_target_id";

fn encode_metadata(metadata: &TargetMetadata) -> String {
    let remote_keys: Vec<Value> = metadata
        .remote_keys
        .iter()
        .map(|key| Value::String(key.canonical_string()))
        .collect();
    json!({
        "targetId": metadata.target_id,
        "canonicalId": metadata.canonical_id,
        "resumeToken": codec::encode_resume_token(&metadata.resume_token),
        "snapshotVersion": codec::encode_timestamp_value(metadata.snapshot_version),
        "current": metadata.current,
        "remoteKeys": remote_keys,
    })
    .to_string()
}

fn decode_metadata(raw: &str) -> FirestoreResult<TargetMetadata> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| internal_error(format!("bad persisted target: {err}")))?;
    let target_id = value
        .get("targetId")
        .and_then(Value::as_i64)
        .ok_or_else(|| internal_error("persisted target missing targetId"))? as i32;
    let canonical_id = value
        .get("canonicalId")
        .and_then(Value::as_str)
        .ok_or_else(|| internal_error("persisted target missing canonicalId"))?
        .to_string();
    let resume_token = match value.get("resumeToken").and_then(Value::as_str) {
        Some(raw) => codec::decode_resume_token(raw)?,
        None => Vec::new(),
    };
    let snapshot_version = value
        .get("snapshotVersion")
        .map(codec::decode_timestamp_value)
        .transpose()?
        .unwrap_or_default();
    let current = value
        .get("current")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut remote_keys = BTreeSet::new();
    if let Some(keys) = value.get("remoteKeys").and_then(Value::as_array) {
        for key in keys {
            let raw = key
                .as_str()
                .ok_or_else(|| internal_error("remote key must be a string"))?;
            remote_keys.insert(DocumentKey::from_string(raw)?);
        }
    }
    Ok(TargetMetadata {
        target_id,
        canonical_id,
        resume_token,
        snapshot_version,
        current,
        remote_keys,
    })
}

/// Persistence-backed registry of active targets. Target ids are allocated
/// monotonically and never reused within a persistence instance.
pub struct TargetCache {
    persistence: Arc<dyn Persistence>,
    state: Mutex<CacheState>,
}

struct CacheState {
    next_target_id: i32,
    targets: BTreeMap<i32, TargetMetadata>,
}

impl TargetCache {
    pub async fn load(persistence: Arc<dyn Persistence>) -> FirestoreResult<Self> {
        let mut targets = BTreeMap::new();
        for key in persistence.keys(namespaces::TARGETS).await? {
            if let Some(raw) = persistence.get(namespaces::TARGETS, &key).await? {
                let metadata = decode_metadata(&raw)?;
                targets.insert(metadata.target_id, metadata);
            }
        }
        let persisted_highest = match persistence
            .get(namespaces::META, HIGHEST_TARGET_ID_KEY)
            .await?
        {
            Some(raw) => raw
                .parse::<i32>()
                .map_err(|err| internal_error(format!("bad highest target id: {err}")))?,
            None => 0,
        };
        let loaded_highest = targets.keys().next_back().copied().unwrap_or(0);
        Ok(Self {
            persistence,
            state: Mutex::new(CacheState {
                next_target_id: persisted_highest.max(loaded_highest) + 1,
                targets,
            }),
        })
    }

    /// Returns the target registered for `canonical_id`, allocating a fresh
    /// target id when none exists yet. Re-listening to an equivalent query
    /// resumes from the persisted resume token.
    pub async fn allocate(&self, canonical_id: &str) -> FirestoreResult<TargetMetadata> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .targets
            .values()
            .find(|metadata| metadata.canonical_id == canonical_id)
        {
            return Ok(existing.clone());
        }
        let target_id = state.next_target_id;
        state.next_target_id += 1;
        let metadata = TargetMetadata::new(target_id, canonical_id.to_string());
        self.persistence
            .put(
                namespaces::META,
                HIGHEST_TARGET_ID_KEY,
                &target_id.to_string(),
            )
            .await?;
        self.persistence
            .put(
                namespaces::TARGETS,
                &target_key(target_id),
                &encode_metadata(&metadata),
            )
            .await?;
        state.targets.insert(target_id, metadata.clone());
        Ok(metadata)
    }

    pub async fn get(&self, target_id: i32) -> Option<TargetMetadata> {
        self.state.lock().await.targets.get(&target_id).cloned()
    }

    pub async fn update(&self, metadata: TargetMetadata) -> FirestoreResult<()> {
        self.persistence
            .put(
                namespaces::TARGETS,
                &target_key(metadata.target_id),
                &encode_metadata(&metadata),
            )
            .await?;
        self.state
            .lock()
            .await
            .targets
            .insert(metadata.target_id, metadata);
        Ok(())
    }

    pub async fn remove(&self, target_id: i32) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.targets.remove(&target_id).is_some() {
            self.persistence
                .delete(namespaces::TARGETS, &target_key(target_id))
                .await?;
        }
        Ok(())
    }

    pub async fn all_targets(&self) -> Vec<TargetMetadata> {
        self.state.lock().await.targets.values().cloned().collect()
    }

    /// Folds server-reported membership changes into the target's key set.
    pub async fn update_remote_keys(
        &self,
        target_id: i32,
        added: &[DocumentKey],
        removed: &[DocumentKey],
    ) -> FirestoreResult<()> {
        let metadata = {
            let mut state = self.state.lock().await;
            let Some(metadata) = state.targets.get_mut(&target_id) else {
                return Ok(());
            };
            for key in added {
                metadata.remote_keys.insert(key.clone());
            }
            for key in removed {
                metadata.remote_keys.remove(key);
            }
            metadata.clone()
        };
        self.persistence
            .put(
                namespaces::TARGETS,
                &target_key(target_id),
                &encode_metadata(&metadata),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{FilePersistence, MemoryPersistence};

    #[tokio::test]
    async fn allocate_reuses_targets_for_equal_queries() {
        let cache = TargetCache::load(Arc::new(MemoryPersistence::new())).await.unwrap();
        let first = cache.allocate("cities|ob:__name__asc").await.unwrap();
        let again = cache.allocate("cities|ob:__name__asc").await.unwrap();
        let other = cache.allocate("users|ob:__name__asc").await.unwrap();
        assert_eq!(first.target_id, again.target_id);
        assert_ne!(first.target_id, other.target_id);
    }

    #[tokio::test]
    async fn target_ids_are_not_reused_after_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");

        let cache = TargetCache::load(Arc::new(FilePersistence::open(&path).unwrap()))
            .await
            .unwrap();
        let first = cache.allocate("cities|ob:__name__asc").await.unwrap();
        cache.remove(first.target_id).await.unwrap();

        let reloaded = TargetCache::load(Arc::new(FilePersistence::open(&path).unwrap()))
            .await
            .unwrap();
        let next = reloaded.allocate("cities|ob:__name__asc").await.unwrap();
        assert!(next.target_id > first.target_id);
    }

    #[tokio::test]
    async fn resume_tokens_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");

        let cache = TargetCache::load(Arc::new(FilePersistence::open(&path).unwrap()))
            .await
            .unwrap();
        let mut metadata = cache.allocate("cities|ob:__name__asc").await.unwrap();
        metadata.resume_token = vec![1, 2, 3];
        metadata.snapshot_version = Timestamp::new(7, 0);
        metadata.current = true;
        cache.update(metadata.clone()).await.unwrap();

        let reloaded = TargetCache::load(Arc::new(FilePersistence::open(&path).unwrap()))
            .await
            .unwrap();
        let restored = reloaded.get(metadata.target_id).await.unwrap();
        assert_eq!(restored.resume_token, vec![1, 2, 3]);
        assert_eq!(restored.snapshot_version, Timestamp::new(7, 0));
        assert!(restored.current);
    }

    #[tokio::test]
    async fn remote_keys_track_membership_changes() {
        let cache = TargetCache::load(Arc::new(MemoryPersistence::new())).await.unwrap();
        let metadata = cache.allocate("cities|ob:__name__asc").await.unwrap();
        let sf = DocumentKey::from_string("cities/sf").unwrap();
        let la = DocumentKey::from_string("cities/la").unwrap();

        cache
            .update_remote_keys(metadata.target_id, &[sf.clone(), la.clone()], &[])
            .await
            .unwrap();
        cache
            .update_remote_keys(metadata.target_id, &[], &[la])
            .await
            .unwrap();

        let stored = cache.get(metadata.target_id).await.unwrap();
        assert_eq!(stored.remote_keys.into_iter().collect::<Vec<_>>(), vec![sf]);
    }
}
