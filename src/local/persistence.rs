use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{failed_precondition, unavailable, FirestoreResult};

/// Namespaces (object stores) used by the engine.
pub mod namespaces {
    pub const DOCUMENTS: &str = "remote_documents";
    pub const MUTATIONS: &str = "mutation_queue";
    pub const TARGETS: &str = "targets";
    pub const OWNER: &str = "owner";
    pub const META: &str = "meta";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistenceKind {
    Memory,
    Durable,
}

/// A single write inside a transactional batch.
#[derive(Clone, Debug)]
pub enum PersistenceOp {
    Put {
        namespace: &'static str,
        key: String,
        value: String,
    },
    Delete {
        namespace: &'static str,
        key: String,
    },
}

/// Storage backend for the local store: a namespaced string key/value space
/// with atomic batch application.
///
/// Backends are interchangeable and selected once at startup; the engine
/// never assumes more than `get`/`put`/`delete`/`apply` plus key listing.
#[async_trait]
pub trait Persistence: Send + Sync {
    fn kind(&self) -> PersistenceKind;

    async fn get(&self, namespace: &str, key: &str) -> FirestoreResult<Option<String>>;

    async fn put(&self, namespace: &'static str, key: &str, value: &str) -> FirestoreResult<()> {
        self.apply(vec![PersistenceOp::Put {
            namespace,
            key: key.to_string(),
            value: value.to_string(),
        }])
        .await
    }

    async fn delete(&self, namespace: &'static str, key: &str) -> FirestoreResult<()> {
        self.apply(vec![PersistenceOp::Delete {
            namespace,
            key: key.to_string(),
        }])
        .await
    }

    /// Applies all operations atomically: either every op is durably applied
    /// or none is.
    async fn apply(&self, ops: Vec<PersistenceOp>) -> FirestoreResult<()>;

    async fn keys(&self, namespace: &str) -> FirestoreResult<Vec<String>>;

    /// Removes every record in every namespace.
    async fn clear(&self) -> FirestoreResult<()>;
}

/// Process-local backend; contents are lost on restart and no cross-tab
/// coordination is required.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn kind(&self) -> PersistenceKind {
        PersistenceKind::Memory
    }

    async fn get(&self, namespace: &str, key: &str) -> FirestoreResult<Option<String>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn apply(&self, ops: Vec<PersistenceOp>) -> FirestoreResult<()> {
        let mut records = self.records.lock().unwrap();
        for op in ops {
            match op {
                PersistenceOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    records.insert((namespace.to_string(), key), value);
                }
                PersistenceOp::Delete { namespace, key } => {
                    records.remove(&(namespace.to_string(), key));
                }
            }
        }
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> FirestoreResult<Vec<String>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn clear(&self) -> FirestoreResult<()> {
        self.records.lock().unwrap().clear();
        Ok(())
    }
}

/// Durable backend shared between processes: a single JSON file rewritten
/// atomically (write to a sibling temp file, then rename).
///
/// Cross-process exclusion is provided by the primary lease layered on top.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    records: Mutex<BTreeMap<(String, String), String>>,
}

impl FilePersistence {
    /// Opens (or creates) the backing file. Fails with `unavailable` when the
    /// file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> FirestoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|err| {
                unavailable(format!(
                    "Failed to read persistence file {}: {err}",
                    path.display()
                ))
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                Self::decode(&raw)?
            }
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    unavailable(format!(
                        "Failed to create persistence directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
            BTreeMap::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn decode(raw: &str) -> FirestoreResult<BTreeMap<(String, String), String>> {
        let parsed: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(raw)
            .map_err(|err| {
                failed_precondition(format!(
                    "Persistence file is corrupt or written by an incompatible version: {err}"
                ))
            })?;
        let mut records = BTreeMap::new();
        for (namespace, entries) in parsed {
            for (key, value) in entries {
                records.insert((namespace.clone(), key), value);
            }
        }
        Ok(records)
    }

    fn encode(records: &BTreeMap<(String, String), String>) -> String {
        let mut grouped: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
        for ((namespace, key), value) in records {
            grouped
                .entry(namespace)
                .or_default()
                .insert(key, value);
        }
        serde_json::to_string(&grouped).expect("string maps always serialize")
    }

    fn flush(&self, records: &BTreeMap<(String, String), String>) -> FirestoreResult<()> {
        let payload = Self::encode(records);
        let tmp = self.path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|err| {
            unavailable(format!(
                "Failed to write persistence file {}: {err}",
                self.path.display()
            ))
        })
    }

    /// Re-reads the backing file, picking up writes from other processes.
    pub fn reload(&self) -> FirestoreResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            unavailable(format!(
                "Failed to reload persistence file {}: {err}",
                self.path.display()
            ))
        })?;
        let decoded = if raw.trim().is_empty() {
            BTreeMap::new()
        } else {
            Self::decode(&raw)?
        };
        *self.records.lock().unwrap() = decoded;
        Ok(())
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    fn kind(&self) -> PersistenceKind {
        PersistenceKind::Durable
    }

    async fn get(&self, namespace: &str, key: &str) -> FirestoreResult<Option<String>> {
        // Owner records are written by whichever process holds the primary
        // lease; they are the one namespace read across processes.
        if namespace == namespaces::OWNER {
            self.reload()?;
        }
        let records = self.records.lock().unwrap();
        Ok(records
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn apply(&self, ops: Vec<PersistenceOp>) -> FirestoreResult<()> {
        let mut records = self.records.lock().unwrap();
        let mut next = records.clone();
        for op in ops {
            match op {
                PersistenceOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    next.insert((namespace.to_string(), key), value);
                }
                PersistenceOp::Delete { namespace, key } => {
                    next.remove(&(namespace.to_string(), key));
                }
            }
        }
        self.flush(&next)?;
        *records = next;
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> FirestoreResult<Vec<String>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn clear(&self) -> FirestoreResult<()> {
        let mut records = self.records.lock().unwrap();
        let empty = BTreeMap::new();
        self.flush(&empty)?;
        *records = empty;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_round_trips() {
        let persistence = MemoryPersistence::new();
        persistence
            .put(namespaces::DOCUMENTS, "cities/sf", "{}")
            .await
            .unwrap();
        assert_eq!(
            persistence
                .get(namespaces::DOCUMENTS, "cities/sf")
                .await
                .unwrap(),
            Some("{}".to_string())
        );
        persistence
            .delete(namespaces::DOCUMENTS, "cities/sf")
            .await
            .unwrap();
        assert!(persistence
            .get(namespaces::DOCUMENTS, "cities/sf")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let persistence = FilePersistence::open(&path).unwrap();
            persistence
                .put(namespaces::TARGETS, "2", "{\"current\":true}")
                .await
                .unwrap();
        }
        let reopened = FilePersistence::open(&path).unwrap();
        assert_eq!(
            reopened.get(namespaces::TARGETS, "2").await.unwrap(),
            Some("{\"current\":true}".to_string())
        );
    }

    #[tokio::test]
    async fn file_backend_rejects_corrupt_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();
        let err = FilePersistence::open(&path).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }

    #[tokio::test]
    async fn batch_apply_is_all_or_nothing_in_memory_view() {
        let persistence = MemoryPersistence::new();
        persistence
            .apply(vec![
                PersistenceOp::Put {
                    namespace: namespaces::DOCUMENTS,
                    key: "a".into(),
                    value: "1".into(),
                },
                PersistenceOp::Put {
                    namespace: namespaces::MUTATIONS,
                    key: "b".into(),
                    value: "2".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(persistence.keys(namespaces::DOCUMENTS).await.unwrap(), ["a"]);
        assert_eq!(persistence.keys(namespaces::MUTATIONS).await.unwrap(), ["b"]);
    }
}
