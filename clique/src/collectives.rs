use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::bootstrap::CliqueBootstrap;
use crate::callback::CliqueIdCallback;
use crate::config::CollectivesConfig;
use crate::error::{CliqueError, Result};
use crate::id::CliqueId;
use crate::resolver::{CollectivesBackend, global_resolver};
use crate::types::{CliqueKey, ConfigMode, DeviceId, Rank};

/// A communicator materialized by the collective transport.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// Access the concrete communicator (e.g. to reach the NCCL handle).
    fn as_any(&self) -> &dyn Any;
}

/// Turns an agreed clique id into a transport communicator.
///
/// `create` may block until every participant has called it (NCCL's
/// `ncclCommInitRank` does), so it runs on the blocking thread pool.
pub trait CommunicatorFactory: Send + Sync {
    fn create(
        &self,
        id: &CliqueId,
        key: &CliqueKey,
        rank: Rank,
    ) -> Result<Arc<dyn Communicator>>;
}

/// Transport-less communicator: records membership only.
#[derive(Debug)]
pub struct LoopbackCommunicator {
    rank: Rank,
    world_size: u32,
}

impl Communicator for LoopbackCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for [`LoopbackCommunicator`]s, for hosts without a collective
/// transport and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackFactory;

impl CommunicatorFactory for LoopbackFactory {
    fn create(
        &self,
        _id: &CliqueId,
        key: &CliqueKey,
        rank: Rank,
    ) -> Result<Arc<dyn Communicator>> {
        Ok(Arc::new(LoopbackCommunicator {
            rank,
            world_size: key.world_size(),
        }))
    }
}

/// A formed clique as seen from one participant.
#[derive(Clone)]
pub struct GroupHandle {
    key: CliqueKey,
    device: DeviceId,
    rank: Rank,
    clique_id: CliqueId,
    communicator: Arc<dyn Communicator>,
    exchanged_via: Option<Arc<dyn CliqueIdCallback>>,
}

impl GroupHandle {
    pub fn key(&self) -> &CliqueKey {
        &self.key
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.key.world_size()
    }

    pub fn clique_id(&self) -> &CliqueId {
        &self.clique_id
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.communicator
    }

    async fn release_exchange(&self) -> Result<()> {
        match &self.exchanged_via {
            Some(callback) => callback.release(&self.key).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHandle")
            .field("key", &self.key)
            .field("device", &self.device)
            .field("rank", &self.rank)
            .field("clique_id", &self.clique_id)
            .finish_non_exhaustive()
    }
}

/// One group-formation request.
pub struct GroupRequest {
    key: CliqueKey,
    local: DeviceId,
    callback: Option<Arc<dyn CliqueIdCallback>>,
    mode: ConfigMode,
}

impl GroupRequest {
    /// Form `key` on behalf of the participant `local`.
    pub fn new(key: CliqueKey, local: DeviceId) -> Self {
        Self {
            key,
            local,
            callback: None,
            mode: ConfigMode::Global,
        }
    }

    /// Exchange through `callback` instead of the configured one.
    pub fn with_callback(mut self, callback: Arc<dyn CliqueIdCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// All participants are local to this process.
    pub fn local(mut self, is_local: bool) -> Self {
        self.mode = ConfigMode::from_is_local(is_local);
        self
    }
}

/// (group key, local device): one participant's view of one group.
type GroupSlot = (u64, DeviceId);

type InFlightMap = HashMap<GroupSlot, watch::Sender<bool>>;

enum Begin {
    Formed(GroupHandle),
    Started(InFlightGuard, watch::Receiver<bool>),
}

/// Marks a group as bootstrapping on this process; released on drop, so
/// success, failure and cancellation all free the slot.
struct InFlightGuard {
    in_flight: Arc<Mutex<InFlightMap>>,
    slot: GroupSlot,
}

impl InFlightGuard {
    fn acquire(
        in_flight: &Arc<Mutex<InFlightMap>>,
        slot: GroupSlot,
    ) -> Result<(Self, watch::Receiver<bool>)> {
        let mut map = in_flight
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("in-flight groups"))?;
        if map.contains_key(&slot) {
            return Err(CliqueError::InFlight {
                group_key: slot.0,
                device: slot.1,
            });
        }
        let (tx, rx) = watch::channel(false);
        map.insert(slot, tx);
        Ok((
            Self {
                in_flight: Arc::clone(in_flight),
                slot,
            },
            rx,
        ))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(&self.slot);
        }
    }
}

/// Entry point for forming collective groups.
///
/// Resolves the exchange callback, runs the bootstrap for the local
/// participant, hands the agreed id to the transport and keeps the resulting
/// handle until the group is destroyed.
pub struct Collectives {
    backend: Arc<dyn CollectivesBackend>,
    factory: Arc<dyn CommunicatorFactory>,
    config: CollectivesConfig,
    in_flight: Arc<Mutex<InFlightMap>>,
    groups: Mutex<HashMap<GroupSlot, GroupHandle>>,
}

impl Collectives {
    pub fn new(
        backend: Arc<dyn CollectivesBackend>,
        factory: Arc<dyn CommunicatorFactory>,
        config: CollectivesConfig,
    ) -> Self {
        Self {
            backend,
            factory,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Build on the process-wide resolver installed at startup.
    pub fn from_global(
        factory: Arc<dyn CommunicatorFactory>,
        config: CollectivesConfig,
    ) -> Result<Self> {
        let backend: Arc<dyn CollectivesBackend> = global_resolver()?;
        Ok(Self::new(backend, factory, config))
    }

    pub fn config(&self) -> &CollectivesConfig {
        &self.config
    }

    pub fn is_global_config(&self) -> bool {
        self.backend.is_global_config()
    }

    /// Form (or return the already formed) group for `request`.
    ///
    /// A second request for the same group and device while the first is
    /// still bootstrapping fails with `CliqueError::InFlight`.
    pub async fn form_group(&self, request: GroupRequest) -> Result<GroupHandle> {
        let GroupRequest {
            key,
            local,
            callback,
            mode,
        } = request;
        let slot = (key.group_key(), local);

        let (_guard, cancel) = match self.begin(&key, local)? {
            Begin::Formed(handle) => {
                tracing::debug!(group_key = slot.0, device = local, "group already formed");
                return Ok(handle);
            }
            Begin::Started(guard, cancel) => (guard, cancel),
        };

        let mut bootstrap = CliqueBootstrap::new(key.clone(), local, Arc::clone(&self.backend))?
            .with_mode(mode)
            .with_timeouts(&self.config)
            .with_cancellation(cancel);
        if let Some(callback) = callback {
            bootstrap = bootstrap.with_callback(callback);
        }
        let clique_id = bootstrap.run().await?;
        let rank = bootstrap.rank();

        let factory = Arc::clone(&self.factory);
        let (id, k) = (clique_id.clone(), key.clone());
        let communicator = tokio::task::spawn_blocking(move || factory.create(&id, &k, rank))
            .await
            .map_err(|e| CliqueError::communicator_with_source("communicator task failed", e))??;

        let handle = GroupHandle {
            key,
            device: local,
            rank,
            clique_id,
            communicator,
            exchanged_via: bootstrap.callback().cloned(),
        };
        self.groups
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("groups"))?
            .insert(slot, handle.clone());

        tracing::info!(
            group_key = slot.0,
            key = %handle.key,
            rank,
            world_size = handle.world_size(),
            fingerprint = %handle.clique_id,
            "clique formed"
        );
        Ok(handle)
    }

    /// Either the registered handle, or the in-flight slot for a new
    /// bootstrap.
    fn begin(&self, key: &CliqueKey, local: DeviceId) -> Result<Begin> {
        if let Some(handle) = self.group(key, local)? {
            return Ok(Begin::Formed(handle));
        }
        let (guard, cancel) = InFlightGuard::acquire(&self.in_flight, (key.group_key(), local))?;
        // A bootstrap finishing between the lookup and the acquire registered
        // its handle before dropping its guard.
        if let Some(handle) = self.group(key, local)? {
            return Ok(Begin::Formed(handle));
        }
        Ok(Begin::Started(guard, cancel))
    }

    /// Abort every in-flight bootstrap of `key` on this process.
    ///
    /// Each aborted participant also aborts the exchange itself, failing the
    /// remaining participants of the group. Returns how many local attempts
    /// were signalled.
    pub fn cancel(&self, key: &CliqueKey) -> Result<usize> {
        let group_key = key.group_key();
        let map = self
            .in_flight
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("in-flight groups"))?;
        let mut signalled = 0;
        for ((gk, _), tx) in map.iter() {
            if *gk == group_key {
                tx.send_replace(true);
                signalled += 1;
            }
        }
        if signalled > 0 {
            tracing::warn!(group_key, %key, signalled, "cancelling clique bootstrap");
        }
        Ok(signalled)
    }

    /// The formed group for `key` on device `local`, if any.
    pub fn group(&self, key: &CliqueKey, local: DeviceId) -> Result<Option<GroupHandle>> {
        let groups = self
            .groups
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("groups"))?;
        Ok(groups.get(&(key.group_key(), local)).cloned())
    }

    /// All groups formed through this instance.
    pub fn groups(&self) -> Result<Vec<GroupHandle>> {
        let groups = self
            .groups
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("groups"))?;
        Ok(groups.values().cloned().collect())
    }

    /// Forget the group and release its exchange state on the callback. The
    /// communicator is released once the last handle is dropped.
    pub async fn destroy_group(
        &self,
        key: &CliqueKey,
        local: DeviceId,
    ) -> Result<Option<GroupHandle>> {
        let removed = self
            .groups
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("groups"))?
            .remove(&(key.group_key(), local));
        if let Some(handle) = &removed {
            handle.release_exchange().await?;
            tracing::info!(group_key = key.group_key(), %key, device = local, "clique destroyed");
        }
        Ok(removed)
    }

    /// Destroy every registered group. Returns how many were destroyed.
    pub async fn shutdown(&self) -> Result<usize> {
        let drained: Vec<GroupHandle> = self
            .groups
            .lock()
            .map_err(|_| CliqueError::LockPoisoned("groups"))?
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &drained {
            if let Err(e) = handle.release_exchange().await {
                tracing::warn!(
                    group_key = handle.key.group_key(),
                    device = handle.device,
                    error = %e,
                    "failed to release exchange state"
                );
            }
        }
        Ok(drained.len())
    }
}
