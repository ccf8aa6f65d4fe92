use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::callback::CliqueIdCallback;
use crate::error::{CliqueError, Result};
use crate::id::CliqueId;
use crate::types::{CliqueKey, ORIGINATOR_RANK, Rank};

/// Exchange state for one group key.
///
/// Holds one attempt at a time. An aborted attempt stays visible, so its
/// late waiters fail instead of picking up its id, until the next publish
/// replaces it with a fresh attempt.
#[derive(Default)]
struct ExchangeSlot {
    attempt: u64,
    published: Option<CliqueId>,
    arrived: BTreeMap<Rank, CliqueId>,
    aborted: bool,
}

impl ExchangeSlot {
    fn divergent_rank(&self, id: &CliqueId) -> Option<Rank> {
        self.arrived
            .iter()
            .find(|(_, other)| *other != id)
            .map(|(r, _)| *r)
    }

    fn complete(&self, world: u32) -> bool {
        self.arrived.len() >= world as usize
    }

    fn met(&self, world: u32) -> bool {
        self.complete(world)
            && self
                .arrived
                .values()
                .next()
                .is_some_and(|first| self.divergent_rank(first).is_none())
    }

    fn missing(&self, world: u32) -> Vec<Rank> {
        (0..world).filter(|r| !self.arrived.contains_key(r)).collect()
    }
}

/// In-process rendezvous for participants living in one process (one host
/// driving several GPUs, or tests simulating a whole job).
///
/// Slots are keyed by `CliqueKey::group_key`. A failed attempt is closed by
/// `abort`; the originator's next publish opens a fresh one on the same
/// slot. `release` (or `forget`) drops the slot once the group is gone.
#[derive(Default)]
pub struct InMemoryRendezvous {
    slots: Mutex<HashMap<u64, Arc<watch::Sender<ExchangeSlot>>>>,
}

impl InMemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all exchange state for `key`. Participants already waiting keep
    /// their view of the old slot.
    pub fn forget(&self, key: &CliqueKey) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("rendezvous slots"))?;
        slots.remove(&key.group_key());
        Ok(())
    }

    /// Number of groups with exchange state.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &CliqueKey) -> Result<Arc<watch::Sender<ExchangeSlot>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("rendezvous slots"))?;
        let slot = slots
            .entry(key.group_key())
            .or_insert_with(|| Arc::new(watch::Sender::new(ExchangeSlot::default())));
        Ok(Arc::clone(slot))
    }

    fn publish_now(&self, key: &CliqueKey, id: &CliqueId) -> Result<()> {
        let group_key = key.group_key();
        let slot = self.slot(key)?;
        let mut outcome = Ok(());
        slot.send_if_modified(|s| {
            if s.aborted {
                *s = ExchangeSlot {
                    attempt: s.attempt + 1,
                    published: Some(id.clone()),
                    ..ExchangeSlot::default()
                };
                tracing::debug!(group_key, attempt = s.attempt, "rendezvous attempt opened");
                return true;
            }
            if let Some(existing) = &s.published {
                outcome = Err(CliqueError::Consistency {
                    group_key,
                    reason: format!(
                        "duplicate publish: {existing} already published, rejected {id}"
                    ),
                });
                return false;
            }
            s.published = Some(id.clone());
            true
        });
        outcome
    }

    async fn fetch_published(&self, key: &CliqueKey, timeout: Duration) -> Result<CliqueId> {
        let group_key = key.group_key();
        let slot = self.slot(key)?;
        let mut rx = slot.subscribe();

        // Arriving at a closed attempt means waiting for the next one.
        let (start_attempt, start_aborted) = {
            let s = rx.borrow_and_update();
            (s.attempt, s.aborted)
        };
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                let closed_before_us = start_aborted && s.attempt == start_attempt;
                !closed_before_us && (s.aborted || s.published.is_some())
            }),
        )
        .await;

        match waited {
            Err(_) => Err(CliqueError::Timeout {
                group_key,
                missing: vec![ORIGINATOR_RANK],
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(CliqueError::transport_with_source("rendezvous slot closed", e)),
            Ok(Ok(state)) => match (&state.published, state.aborted) {
                (_, true) => Err(CliqueError::Cancelled { group_key }),
                (Some(id), false) => Ok(id.clone()),
                (None, false) => Err(CliqueError::transport("rendezvous woke without an id")),
            },
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
        let world = key.world_size();
        let slot = self.slot(key)?;

        let mut attempt = 0;
        let mut outcome = Ok(());
        slot.send_if_modified(|s| {
            if s.aborted {
                outcome = Err(CliqueError::Cancelled { group_key });
                return false;
            }
            if let Some(published) = s.published.as_ref().filter(|p| *p != id) {
                // Stale id from a closed attempt, or a foreign one: never joins.
                outcome = Err(CliqueError::Consistency {
                    group_key,
                    reason: format!("rank {rank} holds {id}, but {published} was published"),
                });
                return false;
            }
            if let Some(other) = s.divergent_rank(id) {
                outcome = Err(CliqueError::Consistency {
                    group_key,
                    reason: format!("rank {rank} holds {id}, rank {other} holds a different id"),
                });
            }
            attempt = s.attempt;
            s.arrived.insert(rank, id.clone());
            true
        });
        outcome?;

        let mut rx = slot.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                s.attempt != attempt
                    || s.aborted
                    || s.complete(world)
                    || s.divergent_rank(id).is_some()
            }),
        )
        .await;

        match waited {
            Err(_) => {
                // Close the attempt unless the barrier was met right at the
                // deadline; both under the slot lock.
                let mut outcome = Ok(());
                slot.send_if_modified(|s| {
                    if s.attempt != attempt || s.aborted {
                        outcome = Err(CliqueError::Cancelled { group_key });
                        return false;
                    }
                    if s.complete(world) && s.divergent_rank(id).is_none() {
                        return false;
                    }
                    outcome = Err(CliqueError::Timeout {
                        group_key,
                        missing: s.missing(world),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                    s.aborted = true;
                    true
                });
                outcome
            }
            Ok(Err(e)) => Err(CliqueError::transport_with_source("rendezvous slot closed", e)),
            Ok(Ok(state)) => {
                if state.attempt != attempt || state.aborted {
                    return Err(CliqueError::Cancelled { group_key });
                }
                match state.divergent_rank(id) {
                    Some(other) => Err(CliqueError::Consistency {
                        group_key,
                        reason: format!("rank {other} arrived with a different id than rank {rank}"),
                    }),
                    None => Ok(()),
                }
            }
        }
    }

    fn abort_now(&self, key: &CliqueKey) -> Result<()> {
        let world = key.world_size();
        let slot = self.slot(key)?;
        let closed = slot.send_if_modified(|s| {
            // A met barrier is final.
            if s.aborted || s.met(world) {
                return false;
            }
            s.aborted = true;
            true
        });
        if closed {
            tracing::warn!(group_key = key.group_key(), %key, "rendezvous attempt aborted");
        }
        Ok(())
    }
}

impl CliqueIdCallback for InMemoryRendezvous {
    fn publish<'a>(&'a self, key: &'a CliqueKey, id: &'a CliqueId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.publish_now(key, id) })
    }

    fn fetch<'a>(
        &'a self,
        key: &'a CliqueKey,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CliqueId>> {
        Box::pin(self.fetch_published(key, timeout))
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
        Box::pin(async move { self.abort_now(key) })
    }

    fn release<'a>(&'a self, key: &'a CliqueKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.forget(key) })
    }
}
