use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use crate::api::operations::FirestoreClient;
use crate::error::{failed_precondition, invalid_argument, FirestoreResult};
use crate::local::{FilePersistence, MemoryPersistence, Persistence, PrimaryLeaseManager, DEFAULT_LEASE_DURATION};
use crate::remote::Datastore;

/// Passing this as `cache_size_bytes` disables cache size enforcement.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

const MINIMUM_CACHE_SIZE_BYTES: i64 = 1_048_576;
const DEFAULT_CACHE_SIZE_BYTES: i64 = 41_943_040;
const DEFAULT_HOST: &str = "firestore.googleapis.com";

/// Client configuration. Settings freeze once the first client starts;
/// later changes are rejected.
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    pub host: String,
    pub ssl: bool,
    pub cache_size_bytes: i64,
    pub experimental_force_long_polling: bool,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ssl: true,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            experimental_force_long_polling: false,
        }
    }
}

impl FirestoreSettings {
    fn validate(&self) -> FirestoreResult<()> {
        if self.host.is_empty() {
            return Err(invalid_argument("settings host must not be empty"));
        }
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED
            && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES
        {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {} bytes",
                MINIMUM_CACHE_SIZE_BYTES
            )));
        }
        Ok(())
    }
}

struct SettingsSlot {
    settings: FirestoreSettings,
    frozen: bool,
}

/// The top-level Firestore handle. Holds settings until a client is
/// started from it with one of the `start_*_persistence` functions.
pub struct Firestore {
    slot: StdMutex<SettingsSlot>,
}

impl Default for Firestore {
    fn default() -> Self {
        Self::new()
    }
}

impl Firestore {
    pub fn new() -> Self {
        Self {
            slot: StdMutex::new(SettingsSlot {
                settings: FirestoreSettings::default(),
                frozen: false,
            }),
        }
    }

    /// Replaces the settings. Fails once a client has been started.
    pub fn configure_settings(&self, settings: FirestoreSettings) -> FirestoreResult<()> {
        settings.validate()?;
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| failed_precondition("settings lock poisoned"))?;
        if slot.frozen {
            return Err(failed_precondition(
                "settings can no longer be changed, a client is already started",
            ));
        }
        slot.settings = settings;
        Ok(())
    }

    pub fn settings(&self) -> FirestoreSettings {
        match self.slot.lock() {
            Ok(slot) => slot.settings.clone(),
            Err(poisoned) => poisoned.into_inner().settings.clone(),
        }
    }

    fn freeze_settings(&self) -> FirestoreResult<FirestoreSettings> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| failed_precondition("settings lock poisoned"))?;
        slot.frozen = true;
        Ok(slot.settings.clone())
    }
}

/// Starts a client backed by in-process memory only. State is lost when
/// the client is dropped.
pub async fn start_memory_persistence(
    firestore: &Firestore,
    datastore: Arc<dyn Datastore>,
) -> FirestoreResult<FirestoreClient> {
    let settings = firestore.freeze_settings()?;
    let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
    FirestoreClient::start(settings, persistence, datastore, None).await
}

/// Starts a client backed by durable on-disk storage. Fails hard when the
/// storage path cannot be opened.
pub async fn start_durable_persistence(
    firestore: &Firestore,
    datastore: Arc<dyn Datastore>,
    path: impl AsRef<Path>,
) -> FirestoreResult<FirestoreClient> {
    let settings = firestore.freeze_settings()?;
    let persistence: Arc<dyn Persistence> = Arc::new(FilePersistence::open(path)?);
    FirestoreClient::start(settings, persistence, datastore, None).await
}

/// Starts a client with durable storage when possible, falling back to
/// memory when the storage path cannot be opened.
pub async fn start_durable_or_memory_persistence(
    firestore: &Firestore,
    datastore: Arc<dyn Datastore>,
    path: impl AsRef<Path>,
) -> FirestoreResult<FirestoreClient> {
    let settings = firestore.freeze_settings()?;
    let persistence: Arc<dyn Persistence> = match FilePersistence::open(path) {
        Ok(durable) => Arc::new(durable),
        Err(err) => {
            log::warn!(
                "durable persistence unavailable, falling back to memory: {}",
                err
            );
            Arc::new(MemoryPersistence::new())
        }
    };
    FirestoreClient::start(settings, persistence, datastore, None).await
}

/// Starts a client that shares durable storage with other clients of the
/// same process family. A primary lease election decides which client
/// owns the network; the others serve reads and queue writes.
pub async fn start_multi_tab_durable_persistence(
    firestore: &Firestore,
    datastore: Arc<dyn Datastore>,
    path: impl AsRef<Path>,
) -> FirestoreResult<FirestoreClient> {
    let settings = firestore.freeze_settings()?;
    let persistence: Arc<dyn Persistence> = Arc::new(FilePersistence::open(path)?);
    let lease = Arc::new(PrimaryLeaseManager::new(
        persistence.clone(),
        DEFAULT_LEASE_DURATION,
    ));
    FirestoreClient::start(settings, persistence, datastore, Some(lease)).await
}

/// Multi-tab variant of [`start_durable_or_memory_persistence`]. The
/// memory fallback runs without an election since nothing is shared.
pub async fn start_multi_tab_durable_or_memory_persistence(
    firestore: &Firestore,
    datastore: Arc<dyn Datastore>,
    path: impl AsRef<Path>,
) -> FirestoreResult<FirestoreClient> {
    let settings = firestore.freeze_settings()?;
    match FilePersistence::open(path) {
        Ok(durable) => {
            let persistence: Arc<dyn Persistence> = Arc::new(durable);
            let lease = Arc::new(PrimaryLeaseManager::new(
                persistence.clone(),
                DEFAULT_LEASE_DURATION,
            ));
            FirestoreClient::start(settings, persistence, datastore, Some(lease)).await
        }
        Err(err) => {
            log::warn!(
                "shared durable persistence unavailable, falling back to memory: {}",
                err
            );
            let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
            FirestoreClient::start(settings, persistence, datastore, None).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = FirestoreSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.host, DEFAULT_HOST);
        assert!(settings.ssl);
    }

    #[test]
    fn rejects_tiny_cache_size() {
        let settings = FirestoreSettings {
            cache_size_bytes: 1024,
            ..FirestoreSettings::default()
        };
        let firestore = Firestore::new();
        assert!(firestore.configure_settings(settings).is_err());
    }

    #[test]
    fn unlimited_cache_size_is_accepted() {
        let settings = FirestoreSettings {
            cache_size_bytes: CACHE_SIZE_UNLIMITED,
            ..FirestoreSettings::default()
        };
        let firestore = Firestore::new();
        assert!(firestore.configure_settings(settings).is_ok());
    }

    #[test]
    fn settings_freeze_after_first_use() {
        let firestore = Firestore::new();
        firestore.freeze_settings().unwrap();
        let result = firestore.configure_settings(FirestoreSettings::default());
        assert!(result.is_err());
    }
}
