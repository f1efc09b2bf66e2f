use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures surfaced by the shared store. Version conflicts and unique-key
/// violations are distinct so callers can implement optimistic retry.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Row version conflict")]
    Conflict,

    #[error("Unique constraint violation")]
    UniqueViolation,

    #[error("Store error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ban {
    pub username: String,
    pub reason: String,
    pub admin: String,
    pub date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regular {
    pub name: String,
    pub promoted_by: String,
    pub date: DateTime<Utc>,
}

/// A `(data_set, key)` pair with an optional value. `value: None` means the
/// entry is deleted, not present-with-null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDataEntry {
    pub data_set: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel_id: String,
    pub server_id: String,
}

/// Point access plus range-query-by-dataset for scenario data. Writes are
/// versioned: `update`/`delete` fail with `Conflict` when the stored version
/// no longer matches the one the caller fetched.
#[async_trait]
pub trait ScenarioStore: Send + Sync {
    async fn fetch(&self, data_set: &str, key: &str) -> StoreResult<Option<(String, u64)>>;
    async fn insert(&self, data_set: &str, key: &str, value: &str) -> StoreResult<()>;
    async fn update(
        &self,
        data_set: &str,
        key: &str,
        value: &str,
        expected_version: u64,
    ) -> StoreResult<()>;
    async fn delete(&self, data_set: &str, key: &str, expected_version: u64) -> StoreResult<()>;
    async fn entries(&self, data_set: &str) -> StoreResult<Vec<ScenarioDataEntry>>;
    async fn data_sets(&self) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait ModerationStore: Send + Sync {
    /// Keyed by lowercased username; banning an existing name updates
    /// reason/admin/timestamp in place.
    async fn upsert_ban(&self, ban: Ban) -> StoreResult<()>;
    async fn remove_ban(&self, username: &str) -> StoreResult<()>;
    async fn bans(&self) -> StoreResult<Vec<Ban>>;
    async fn add_regular(&self, regular: Regular) -> StoreResult<()>;
    async fn remove_regular(&self, name: &str) -> StoreResult<()>;
    async fn regulars(&self) -> StoreResult<Vec<Regular>>;
}

#[async_trait]
pub trait ChannelBindingStore: Send + Sync {
    /// Binding is unique in both directions; binding an already-mapped channel
    /// or server replaces the previous mapping.
    async fn bind(&self, binding: ChannelBinding) -> StoreResult<()>;
    async fn unbind_channel(&self, channel_id: &str) -> StoreResult<()>;
    async fn server_for_channel(&self, channel_id: &str) -> StoreResult<Option<String>>;
    async fn channel_for_server(&self, server_id: &str) -> StoreResult<Option<String>>;
}

/// In-memory shared store. Scenario rows carry a version counter so the
/// synchronizer's conflict-retry path behaves like it does against a real
/// optimistic-concurrency backend.
#[derive(Default)]
pub struct MemoryStore {
    scenario: DashMap<(String, String), (String, u64)>,
    bans: DashMap<String, Ban>,
    regulars: DashMap<String, Regular>,
    channel_to_server: DashMap<String, String>,
    server_to_channel: DashMap<String, String>,
    version_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl ScenarioStore for MemoryStore {
    async fn fetch(&self, data_set: &str, key: &str) -> StoreResult<Option<(String, u64)>> {
        Ok(self
            .scenario
            .get(&(data_set.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn insert(&self, data_set: &str, key: &str, value: &str) -> StoreResult<()> {
        let map_key = (data_set.to_string(), key.to_string());
        let version = self.next_version();
        match self.scenario.entry(map_key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::UniqueViolation),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((value.to_string(), version));
                Ok(())
            }
        }
    }

    async fn update(
        &self,
        data_set: &str,
        key: &str,
        value: &str,
        expected_version: u64,
    ) -> StoreResult<()> {
        let map_key = (data_set.to_string(), key.to_string());
        let version = self.next_version();
        match self.scenario.get_mut(&map_key) {
            Some(mut entry) if entry.value().1 == expected_version => {
                *entry.value_mut() = (value.to_string(), version);
                Ok(())
            }
            _ => Err(StoreError::Conflict),
        }
    }

    async fn delete(&self, data_set: &str, key: &str, expected_version: u64) -> StoreResult<()> {
        let map_key = (data_set.to_string(), key.to_string());
        let removed = self
            .scenario
            .remove_if(&map_key, |_, (_, version)| *version == expected_version);
        if removed.is_some() || !self.scenario.contains_key(&map_key) {
            Ok(())
        } else {
            Err(StoreError::Conflict)
        }
    }

    async fn entries(&self, data_set: &str) -> StoreResult<Vec<ScenarioDataEntry>> {
        let mut entries: Vec<ScenarioDataEntry> = self
            .scenario
            .iter()
            .filter(|entry| entry.key().0 == data_set)
            .map(|entry| ScenarioDataEntry {
                data_set: entry.key().0.clone(),
                key: entry.key().1.clone(),
                value: Some(entry.value().0.clone()),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn data_sets(&self) -> StoreResult<Vec<String>> {
        let mut sets: Vec<String> = self
            .scenario
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        sets.sort();
        sets.dedup();
        Ok(sets)
    }
}

#[async_trait]
impl ModerationStore for MemoryStore {
    async fn upsert_ban(&self, mut ban: Ban) -> StoreResult<()> {
        ban.username = ban.username.to_lowercase();
        self.bans.insert(ban.username.clone(), ban);
        Ok(())
    }

    async fn remove_ban(&self, username: &str) -> StoreResult<()> {
        self.bans.remove(&username.to_lowercase());
        Ok(())
    }

    async fn bans(&self) -> StoreResult<Vec<Ban>> {
        let mut bans: Vec<Ban> = self.bans.iter().map(|b| b.value().clone()).collect();
        bans.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(bans)
    }

    async fn add_regular(&self, regular: Regular) -> StoreResult<()> {
        self.regulars.insert(regular.name.clone(), regular);
        Ok(())
    }

    async fn remove_regular(&self, name: &str) -> StoreResult<()> {
        self.regulars.remove(name);
        Ok(())
    }

    async fn regulars(&self) -> StoreResult<Vec<Regular>> {
        let mut regulars: Vec<Regular> = self.regulars.iter().map(|r| r.value().clone()).collect();
        regulars.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(regulars)
    }
}

#[async_trait]
impl ChannelBindingStore for MemoryStore {
    async fn bind(&self, binding: ChannelBinding) -> StoreResult<()> {
        // Drop any previous mapping on either side before inserting.
        if let Some((_, old_server)) = self.channel_to_server.remove(&binding.channel_id) {
            self.server_to_channel.remove(&old_server);
        }
        if let Some((_, old_channel)) = self.server_to_channel.remove(&binding.server_id) {
            self.channel_to_server.remove(&old_channel);
        }
        self.channel_to_server
            .insert(binding.channel_id.clone(), binding.server_id.clone());
        self.server_to_channel
            .insert(binding.server_id, binding.channel_id);
        Ok(())
    }

    async fn unbind_channel(&self, channel_id: &str) -> StoreResult<()> {
        if let Some((_, server_id)) = self.channel_to_server.remove(channel_id) {
            self.server_to_channel.remove(&server_id);
        }
        Ok(())
    }

    async fn server_for_channel(&self, channel_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .channel_to_server
            .get(channel_id)
            .map(|entry| entry.value().clone()))
    }

    async fn channel_for_server(&self, server_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .server_to_channel
            .get(server_id)
            .map(|entry| entry.value().clone()))
    }
}
