use clique::{CliqueError, DeviceId, Rank};
use cudarc::nccl::result::NcclError;

pub type Result<T> = std::result::Result<T, NcclCliqueError>;

#[derive(Debug, thiserror::Error)]
pub enum NcclCliqueError {
    #[error("NCCL error: {0:?}")]
    Nccl(NcclError),

    #[error("CUDA driver error: {0}")]
    CudaDriver(#[from] cudarc::driver::result::DriverError),

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("no CUDA stream registered for device {device}")]
    NoStream { device: DeviceId },
}

impl From<NcclError> for NcclCliqueError {
    fn from(e: NcclError) -> Self {
        NcclCliqueError::Nccl(e)
    }
}

impl From<NcclCliqueError> for CliqueError {
    fn from(e: NcclCliqueError) -> Self {
        CliqueError::communicator_with_source("NCCL communicator", e)
    }
}
