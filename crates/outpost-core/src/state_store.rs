use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Default interval at which outposts are expected to send HELLO.
pub const OUTPOST_HELLO_INTERVAL: Duration = Duration::from_secs(5);

/// Records live for one and a half hello intervals, which tolerates a single
/// late beat before the instance is considered gone.
/// Saturates at `Duration::MAX`, which the store then rejects as `InvalidTtl`.
pub fn state_ttl(hello_interval: Duration) -> Duration {
    hello_interval
        .checked_mul(3)
        .map(|tripled| tripled / 2)
        .unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub outpost_id: String,
    pub instance_uid: String,
}

impl InstanceKey {
    pub fn new(outpost_id: impl Into<String>, instance_uid: impl Into<String>) -> Self {
        Self {
            outpost_id: outpost_id.into(),
            instance_uid: instance_uid.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.outpost_id, self.instance_uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_uid: String,
    pub channel_ids: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build_hash: Option<String>,
}

impl InstanceState {
    fn empty(instance_uid: &str, now: DateTime<Utc>) -> Self {
        Self {
            instance_uid: instance_uid.to_string(),
            channel_ids: BTreeSet::new(),
            last_seen: now,
            version: None,
            build_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloReport {
    pub version: Option<String>,
    pub build_hash: String,
}

/// One processed envelope, as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub channel_id: String,
    pub seen_at: DateTime<Utc>,
    pub report: Option<HelloReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("instance store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
}

/// TTL-backed map from (outpost, instance) to live instance state.
///
/// Every method is atomic per key: concurrent upserts and detaches on the same
/// instance never lose a channel id. Expired records behave as absent.
#[async_trait]
pub trait InstanceStateStore: Send + Sync {
    async fn get(&self, key: &InstanceKey) -> Result<Option<InstanceState>, StoreError>;

    /// Fetch-or-create the record, add the channel id, stamp `last_seen`,
    /// apply the HELLO report if any, and reset the expiry to `now + ttl`.
    async fn upsert(
        &self,
        key: &InstanceKey,
        update: StateUpdate,
        ttl: Duration,
    ) -> Result<InstanceState, StoreError>;

    /// Remove one channel id without touching the rest of the record or its
    /// expiry. Returns whether the id was present.
    async fn detach(&self, key: &InstanceKey, channel_id: &str) -> Result<bool, StoreError>;

    /// Live records of an outpost, ordered by instance uid.
    async fn instances_for_outpost(&self, outpost_id: &str)
        -> Result<Vec<InstanceState>, StoreError>;

    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

struct StoredInstance {
    state: InstanceState,
    expires_at: DateTime<Utc>,
}

impl StoredInstance {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

pub struct MemoryInstanceStore {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<InstanceKey, StoredInstance>>,
}

impl MemoryInstanceStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of unexpired records across all outposts.
    pub async fn live_count(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }
}

#[async_trait]
impl InstanceStateStore for MemoryInstanceStore {
    async fn get(&self, key: &InstanceKey) -> Result<Option<InstanceState>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.state.clone()))
    }

    async fn upsert(
        &self,
        key: &InstanceKey,
        update: StateUpdate,
        ttl: Duration,
    ) -> Result<InstanceState, StoreError> {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| StoreError::InvalidTtl(format!("{}s from {now}", ttl.as_secs())))?;
        let mut entries = self.entries.write().await;

        // An expired record is replaced, never revived with its old fields.
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
            debug!(event = "instance_state_expired", key = %key);
        }

        let entry = entries.entry(key.clone()).or_insert_with(|| StoredInstance {
            state: InstanceState::empty(&key.instance_uid, now),
            expires_at: now,
        });
        entry.state.channel_ids.insert(update.channel_id);
        entry.state.last_seen = update.seen_at;
        if let Some(report) = update.report {
            entry.state.version = report.version;
            entry.state.build_hash = Some(report.build_hash);
        }
        entry.expires_at = expires_at;
        Ok(entry.state.clone())
    }

    async fn detach(&self, key: &InstanceKey, channel_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        if !entry.is_live(now) {
            entries.remove(key);
            return Ok(false);
        }
        let removed = entry.state.channel_ids.remove(channel_id);
        if entry.state.channel_ids.is_empty() {
            entries.remove(key);
            debug!(event = "instance_state_dropped", key = %key);
        }
        Ok(removed)
    }

    async fn instances_for_outpost(
        &self,
        outpost_id: &str,
    ) -> Result<Vec<InstanceState>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        let mut states = entries
            .iter()
            .filter(|(key, entry)| key.outpost_id == outpost_id && entry.is_live(now))
            .map(|(_, entry)| entry.state.clone())
            .collect::<Vec<_>>();
        states.sort_by(|a, b| a.instance_uid.cmp(&b.instance_uid));
        Ok(states)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}
