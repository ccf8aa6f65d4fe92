use std::collections::HashMap;
use std::sync::Arc;

use clique::{CliqueId, CliqueKey, Communicator, CommunicatorFactory, DeviceId, Rank};
use cudarc::driver::{CudaContext, CudaStream};

use crate::error::{NcclCliqueError, Result};
use crate::group::NcclGroup;

/// Builds an [`NcclGroup`] per formed clique, on the stream registered for
/// the participant's device.
#[derive(Default)]
pub struct NcclCommunicatorFactory {
    streams: HashMap<DeviceId, Arc<CudaStream>>,
}

impl NcclCommunicatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the default stream of a fresh context on each listed device.
    pub fn for_devices(devices: impl IntoIterator<Item = DeviceId>) -> Result<Self> {
        let mut factory = Self::new();
        for device in devices {
            let ctx = CudaContext::new(device as usize)?;
            factory = factory.with_stream(device, ctx.default_stream());
        }
        Ok(factory)
    }

    pub fn with_stream(mut self, device: DeviceId, stream: Arc<CudaStream>) -> Self {
        self.streams.insert(device, stream);
        self
    }

    fn stream_for(&self, device: DeviceId) -> Result<Arc<CudaStream>> {
        self.streams
            .get(&device)
            .cloned()
            .ok_or(NcclCliqueError::NoStream { device })
    }
}

impl CommunicatorFactory for NcclCommunicatorFactory {
    fn create(
        &self,
        id: &CliqueId,
        key: &CliqueKey,
        rank: Rank,
    ) -> clique::Result<Arc<dyn Communicator>> {
        let world_size = key.world_size();
        let device = key
            .device(rank)
            .ok_or(NcclCliqueError::InvalidRank { rank, world_size })?;
        let stream = self.stream_for(device)?;
        let group = NcclGroup::init(stream, rank, world_size, id)?;
        Ok(Arc::new(group))
    }
}
