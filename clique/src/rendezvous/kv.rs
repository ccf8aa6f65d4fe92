use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::callback::CliqueIdCallback;
use crate::error::{CliqueError, Result};
use crate::id::CliqueId;
use crate::types::{CliqueKey, ORIGINATOR_RANK, Rank};

/// Minimal interface of a distributed key-value store (the coordination
/// service most launchers already run).
pub trait KeyValueStore: Send + Sync {
    /// Insert `value` under `key` unless the key already exists.
    ///
    /// Returns `false` without modifying the store if the key was taken.
    fn try_insert<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Wait up to `timeout` for `key` to appear. Returns `None` on timeout.
    fn get<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Option<String>>>;

    /// Delete `key`. Deleting an absent key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

const OUTCOME_READY: &str = "ready";
const OUTCOME_ABORTED: &str = "aborted";

/// How often a waiter looks for an abort while its entry is absent.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(20);

enum Entry {
    Value(String),
    Aborted,
    Missing,
}

/// Clique id exchange on top of a `KeyValueStore`.
///
/// Every attempt lives under `{prefix}/{group_key}/{attempt}/`: the hex id
/// under `id`, one entry per rank under `agree/{rank}`, and the attempt's
/// fate under `outcome`. `outcome` is written once, through `try_insert`,
/// as either `ready` or `aborted`, so the store decides between a met
/// barrier and a timeout racing it. An aborted attempt is skipped; the next
/// publish lands in the attempt after it.
pub struct KvStoreCallback<S> {
    store: Arc<S>,
    prefix: String,
}

impl<S: KeyValueStore> KvStoreCallback<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_prefix(store, "clique")
    }

    pub fn with_prefix(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn attempt_key(&self, key: &CliqueKey, attempt: u64, leaf: &str) -> String {
        format!("{}/{:016x}/{attempt}/{leaf}", self.prefix, key.group_key())
    }

    fn id_key(&self, key: &CliqueKey, attempt: u64) -> String {
        self.attempt_key(key, attempt, "id")
    }

    fn agree_key(&self, key: &CliqueKey, attempt: u64, rank: Rank) -> String {
        self.attempt_key(key, attempt, &format!("agree/{rank}"))
    }

    fn outcome_key(&self, key: &CliqueKey, attempt: u64) -> String {
        self.attempt_key(key, attempt, "outcome")
    }

    async fn peek(&self, entry: &str) -> Result<Option<String>> {
        self.store.get(entry, Duration::ZERO).await
    }

    async fn aborted(&self, key: &CliqueKey, attempt: u64) -> Result<bool> {
        let outcome = self.peek(&self.outcome_key(key, attempt)).await?;
        Ok(outcome.as_deref() == Some(OUTCOME_ABORTED))
    }

    /// First attempt that has not been aborted.
    async fn live_attempt(&self, key: &CliqueKey) -> Result<u64> {
        let mut attempt = 0;
        while self.aborted(key, attempt).await? {
            attempt += 1;
        }
        Ok(attempt)
    }

    /// Attempt that published `id`, or the live one if none did.
    async fn attempt_of(&self, key: &CliqueKey, rank: Rank, id: &CliqueId) -> Result<u64> {
        let hex = id.to_hex();
        let live = self.live_attempt(key).await?;
        for attempt in 0..=live {
            match self.peek(&self.id_key(key, attempt)).await? {
                Some(value) if value == hex => return Ok(attempt),
                Some(_) if attempt == live => {
                    return Err(CliqueError::Consistency {
                        group_key: key.group_key(),
                        reason: format!("rank {rank} holds {id}, attempt {live} published another id"),
                    });
                }
                _ => {}
            }
        }
        Ok(live)
    }

    /// Wait for `entry` until `deadline`, giving up early once the attempt
    /// is aborted.
    async fn wait_entry(
        &self,
        entry: &str,
        key: &CliqueKey,
        attempt: u64,
        deadline: Instant,
    ) -> Result<Entry> {
        loop {
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(ABORT_POLL_INTERVAL);
            if let Some(value) = self.store.get(entry, slice).await? {
                return Ok(Entry::Value(value));
            }
            if self.aborted(key, attempt).await? {
                return Ok(Entry::Aborted);
            }
            if Instant::now() >= deadline {
                return Ok(Entry::Missing);
            }
        }
    }

    /// Propose `outcome` for the attempt and return whichever one won.
    async fn settle(&self, key: &CliqueKey, attempt: u64, outcome: &str) -> Result<String> {
        let entry = self.outcome_key(key, attempt);
        if self.store.try_insert(&entry, outcome).await? {
            return Ok(outcome.to_string());
        }
        self.peek(&entry)
            .await?
            .ok_or_else(|| CliqueError::transport(format!("outcome of {entry} vanished")))
    }

    async fn publish_id(&self, key: &CliqueKey, id: &CliqueId) -> Result<()> {
        let attempt = self.live_attempt(key).await?;
        let inserted = self
            .store
            .try_insert(&self.id_key(key, attempt), &id.to_hex())
            .await?;
        if !inserted {
            return Err(CliqueError::Consistency {
                group_key: key.group_key(),
                reason: format!("duplicate publish of {id}: attempt {attempt} already has an id"),
            });
        }
        tracing::debug!(group_key = key.group_key(), attempt, "clique id stored");
        Ok(())
    }

    async fn fetch_id(&self, key: &CliqueKey, timeout: Duration) -> Result<CliqueId> {
        let deadline = Instant::now() + timeout;
        let attempt = self.live_attempt(key).await?;
        match self
            .wait_entry(&self.id_key(key, attempt), key, attempt, deadline)
            .await?
        {
            Entry::Value(value) => CliqueId::from_hex(&value),
            Entry::Aborted => Err(CliqueError::Cancelled {
                group_key: key.group_key(),
            }),
            Entry::Missing => Err(CliqueError::Timeout {
                group_key: key.group_key(),
                missing: vec![ORIGINATOR_RANK],
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn agree_on(
        &self,
        key: &CliqueKey,
        rank: Rank,
        id: &CliqueId,
        timeout: Duration,
    ) -> Result<()> {
        let group_key = key.group_key();
        let deadline = Instant::now() + timeout;
        let hex = id.to_hex();
        let attempt = self.attempt_of(key, rank, id).await?;
        if self.aborted(key, attempt).await? {
            return Err(CliqueError::Cancelled { group_key });
        }
        if !self
            .store
            .try_insert(&self.agree_key(key, attempt, rank), &hex)
            .await?
        {
            return Err(CliqueError::Consistency {
                group_key,
                reason: format!("rank {rank} already took part in attempt {attempt}"),
            });
        }

        let mut missing = Vec::new();
        for peer in (0..key.world_size()).filter(|&r| r != rank) {
            let entry = self.agree_key(key, attempt, peer);
            match self.wait_entry(&entry, key, attempt, deadline).await? {
                Entry::Value(value) if value == hex => {}
                Entry::Value(_) => {
                    return Err(CliqueError::Consistency {
                        group_key,
                        reason: format!("rank {peer} holds a different id than rank {rank}"),
                    });
                }
                Entry::Aborted => return Err(CliqueError::Cancelled { group_key }),
                Entry::Missing => missing.push(peer),
            }
        }

        let proposed = if missing.is_empty() {
            OUTCOME_READY
        } else {
            OUTCOME_ABORTED
        };
        match self.settle(key, attempt, proposed).await?.as_str() {
            OUTCOME_READY => Ok(()),
            _ if missing.is_empty() => Err(CliqueError::Cancelled { group_key }),
            _ => Err(CliqueError::Timeout {
                group_key,
                missing,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn abort_attempt(&self, key: &CliqueKey) -> Result<()> {
        let attempt = self.live_attempt(key).await?;
        // Nothing was published since the last abort.
        if attempt > 0 && self.peek(&self.id_key(key, attempt)).await?.is_none() {
            return Ok(());
        }
        if self
            .store
            .try_insert(&self.outcome_key(key, attempt), OUTCOME_ABORTED)
            .await?
        {
            tracing::warn!(group_key = key.group_key(), attempt, %key, "exchange attempt aborted");
        }
        Ok(())
    }

    async fn release_all(&self, key: &CliqueKey) -> Result<()> {
        let live = self.live_attempt(key).await?;
        for attempt in 0..=live {
            self.store.remove(&self.id_key(key, attempt)).await?;
            for rank in 0..key.world_size() {
                self.store.remove(&self.agree_key(key, attempt, rank)).await?;
            }
            self.store.remove(&self.outcome_key(key, attempt)).await?;
        }
        Ok(())
    }
}

impl<S: KeyValueStore> CliqueIdCallback for KvStoreCallback<S> {
    fn publish<'a>(&'a self, key: &'a CliqueKey, id: &'a CliqueId) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.publish_id(key, id))
    }

    fn fetch<'a>(
        &'a self,
        key: &'a CliqueKey,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CliqueId>> {
        Box::pin(self.fetch_id(key, timeout))
    }

    fn agree<'a>(
        &'a self,
        key: &'a CliqueKey,
        rank: Rank,
        id: &'a CliqueId,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.agree_on(key, rank, id, timeout))
    }

    fn abort<'a>(&'a self, key: &'a CliqueKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.abort_attempt(key))
    }

    fn release<'a>(&'a self, key: &'a CliqueKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.release_all(key))
    }
}

/// `KeyValueStore` held in process memory.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
    inserted: Notify,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("kv store entries"))?;
        Ok(entries.get(key).cloned())
    }

    fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("kv store entries"))?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        drop(entries);
        self.inserted.notify_waiters();
        Ok(true)
    }

    async fn wait_for(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before looking so an insert between the lookup and the
            // await still wakes us.
            let notified = self.inserted.notified();
            if let Some(value) = self.lookup(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lookup(key);
            }
        }
    }
}

impl KeyValueStore for MemoryKvStore {
    fn try_insert<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.insert_if_absent(key, value) })
    }

    fn get<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(self.wait_for(key, timeout))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| CliqueError::LockPoisoned("kv store entries"))?;
            entries.remove(key);
            Ok(())
        })
    }
}
