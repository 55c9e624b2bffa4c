use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_lock::Mutex;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::{json, Value};

use crate::error::{internal_error, FirestoreResult};
use crate::local::persistence::{namespaces, Persistence};

/// How long a primary lease stays valid without a heartbeat.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_millis(5_000);

const OWNER_KEY: &str = "owner";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    Primary,
    Secondary,
}

/// Cooperative single-writer election over a shared durable backend.
///
/// Every tab writes heartbeats under its random client id; whichever tab
/// holds an unexpired lease is the primary and the only one allowed to run
/// the sync engine against the network. A crashed primary is taken over once
/// its lease expires.
pub struct PrimaryLeaseManager {
    persistence: Arc<dyn Persistence>,
    client_id: String,
    lease_duration: Duration,
    state: Mutex<LeaseState>,
}

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(20)
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

struct OwnerRecord {
    owner_id: String,
    lease_timestamp_millis: u64,
}

fn encode_owner(record: &OwnerRecord) -> String {
    json!({
        "ownerId": record.owner_id,
        "leaseTimestampMs": record.lease_timestamp_millis,
    })
    .to_string()
}

fn decode_owner(raw: &str) -> FirestoreResult<OwnerRecord> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| internal_error(format!("bad owner record: {err}")))?;
    let owner_id = value
        .get("ownerId")
        .and_then(Value::as_str)
        .ok_or_else(|| internal_error("owner record missing ownerId"))?
        .to_string();
    let lease_timestamp_millis = value
        .get("leaseTimestampMs")
        .and_then(Value::as_u64)
        .ok_or_else(|| internal_error("owner record missing leaseTimestampMs"))?;
    Ok(OwnerRecord {
        owner_id,
        lease_timestamp_millis,
    })
}

impl PrimaryLeaseManager {
    pub fn new(persistence: Arc<dyn Persistence>, lease_duration: Duration) -> Self {
        Self {
            persistence,
            client_id: generate_client_id(),
            lease_duration,
            state: Mutex::new(LeaseState::Secondary),
        }
    }

    #[cfg(test)]
    fn with_client_id(
        persistence: Arc<dyn Persistence>,
        lease_duration: Duration,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            persistence,
            client_id: client_id.into(),
            lease_duration,
            state: Mutex::new(LeaseState::Secondary),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Attempts to become (or stay) primary. Succeeds when there is no
    /// owner, the owner is this client, or the owner's lease has expired.
    pub async fn try_acquire(&self) -> FirestoreResult<LeaseState> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        let can_take = match self.persistence.get(namespaces::OWNER, OWNER_KEY).await? {
            Some(raw) => {
                let record = decode_owner(&raw)?;
                record.owner_id == self.client_id
                    || now.saturating_sub(record.lease_timestamp_millis)
                        > self.lease_duration.as_millis() as u64
            }
            None => true,
        };
        if can_take {
            self.persistence
                .put(
                    namespaces::OWNER,
                    OWNER_KEY,
                    &encode_owner(&OwnerRecord {
                        owner_id: self.client_id.clone(),
                        lease_timestamp_millis: now,
                    }),
                )
                .await?;
            *state = LeaseState::Primary;
        } else {
            *state = LeaseState::Secondary;
        }
        Ok(*state)
    }

    /// Heartbeat. Re-writes the lease timestamp while primary; demotes this
    /// client if another tab has taken the lease in the meantime.
    pub async fn refresh(&self) -> FirestoreResult<LeaseState> {
        {
            let state = self.state.lock().await;
            if *state != LeaseState::Primary {
                return Ok(*state);
            }
        }
        self.try_acquire().await
    }

    /// Gives the lease up so another tab can take over immediately.
    pub async fn release(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if *state == LeaseState::Primary {
            if let Some(raw) = self.persistence.get(namespaces::OWNER, OWNER_KEY).await? {
                if decode_owner(&raw)?.owner_id == self.client_id {
                    self.persistence.delete(namespaces::OWNER, OWNER_KEY).await?;
                }
            }
            *state = LeaseState::Secondary;
        }
        Ok(())
    }

    pub async fn is_primary(&self) -> bool {
        *self.state.lock().await == LeaseState::Primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryPersistence;

    #[tokio::test]
    async fn first_client_becomes_primary() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let manager =
            PrimaryLeaseManager::with_client_id(persistence, DEFAULT_LEASE_DURATION, "tab-a");
        assert_eq!(manager.try_acquire().await.unwrap(), LeaseState::Primary);
        assert!(manager.is_primary().await);
    }

    #[tokio::test]
    async fn second_client_stays_secondary_while_lease_is_fresh() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let a = PrimaryLeaseManager::with_client_id(
            persistence.clone(),
            DEFAULT_LEASE_DURATION,
            "tab-a",
        );
        let b =
            PrimaryLeaseManager::with_client_id(persistence, DEFAULT_LEASE_DURATION, "tab-b");
        a.try_acquire().await.unwrap();
        assert_eq!(b.try_acquire().await.unwrap(), LeaseState::Secondary);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let a = PrimaryLeaseManager::with_client_id(
            persistence.clone(),
            Duration::from_millis(0),
            "tab-a",
        );
        let b =
            PrimaryLeaseManager::with_client_id(persistence, Duration::from_millis(0), "tab-b");
        a.try_acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(b.try_acquire().await.unwrap(), LeaseState::Primary);
    }

    #[tokio::test]
    async fn release_hands_the_lease_over() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let a = PrimaryLeaseManager::with_client_id(
            persistence.clone(),
            DEFAULT_LEASE_DURATION,
            "tab-a",
        );
        let b =
            PrimaryLeaseManager::with_client_id(persistence, DEFAULT_LEASE_DURATION, "tab-b");
        a.try_acquire().await.unwrap();
        a.release().await.unwrap();
        assert!(!a.is_primary().await);
        assert_eq!(b.try_acquire().await.unwrap(), LeaseState::Primary);
    }

    #[tokio::test]
    async fn refresh_detects_loss_of_lease() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        // Tab b treats any lease as expired, tab a honors a long one, so a
        // cannot steal the lease back after b takes it.
        let a = PrimaryLeaseManager::with_client_id(
            persistence.clone(),
            Duration::from_secs(3_600),
            "tab-a",
        );
        let b =
            PrimaryLeaseManager::with_client_id(persistence, Duration::from_millis(0), "tab-b");
        a.try_acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(b.try_acquire().await.unwrap(), LeaseState::Primary);
        assert_eq!(a.refresh().await.unwrap(), LeaseState::Secondary);
    }
}
