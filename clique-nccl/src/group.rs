use std::any::Any;
use std::ffi::c_char;
use std::mem::MaybeUninit;
use std::sync::Arc;

use clique::{CLIQUE_ID_SIZE, CliqueId, Communicator, Rank};
use cudarc::driver::CudaStream;
use cudarc::nccl::{result as nccl, safe::Id, sys};

use crate::error::{NcclCliqueError, Result};
use crate::id::nccl_id_from_clique;

/// An NCCL communicator created from an agreed clique id.
///
/// Uses cudarc's `result` layer directly so the raw `ncclComm_t` stays
/// reachable for callers issuing their own NCCL calls.
pub struct NcclGroup {
    comm: sys::ncclComm_t,
    stream: Arc<CudaStream>,
    rank: Rank,
    world_size: u32,
    clique_id: CliqueId,
}

// SAFETY: ncclComm_t is thread-safe per NCCL documentation when used with
// proper stream synchronization. The CudaStream is already Send+Sync via Arc.
unsafe impl Send for NcclGroup {}
unsafe impl Sync for NcclGroup {}

impl NcclGroup {
    /// Join the clique identified by `id` as `rank`.
    ///
    /// Blocks until all `world_size` participants have called `init` with the
    /// same id. The stream's context is bound to the calling thread first.
    pub fn init(
        stream: Arc<CudaStream>,
        rank: Rank,
        world_size: u32,
        id: &CliqueId,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(NcclCliqueError::InvalidRank { rank, world_size });
        }
        stream.context().bind_to_thread()?;

        let nccl_id = nccl_id_from_clique(id);
        let mut comm = MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(
                comm.as_mut_ptr(),
                world_size as i32,
                *id_to_sys(&nccl_id),
                rank as i32,
            )?;
        }
        tracing::debug!(rank, world_size, fingerprint = %id, "NCCL communicator initialized");
        Ok(Self {
            comm: unsafe { comm.assume_init() },
            stream,
            rank,
            world_size,
            clique_id: id.clone(),
        })
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    pub fn clique_id(&self) -> &CliqueId {
        &self.clique_id
    }

    /// The raw communicator handle.
    ///
    /// Valid until this group is dropped.
    pub fn comm(&self) -> sys::ncclComm_t {
        self.comm
    }

    /// Synchronize the CUDA stream (block until all NCCL ops complete).
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()?;
        Ok(())
    }
}

impl Communicator for NcclGroup {
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

impl Drop for NcclGroup {
    fn drop(&mut self) {
        unsafe {
            // comm_abort doesn't require stream sync.
            if let Err(e) = nccl::comm_abort(self.comm) {
                tracing::warn!(rank = self.rank, error = ?e, "ncclCommAbort failed");
            }
        }
    }
}

/// Convert our `Id` to the sys-level `ncclUniqueId`.
///
/// `ncclUniqueId` is `#[repr(C)]` with a single field `internal: [c_char; 128]`,
/// the same layout as `Id::internal()`.
fn id_to_sys(id: &Id) -> &sys::ncclUniqueId {
    let internal = id.internal();
    unsafe { &*(internal as *const [c_char; CLIQUE_ID_SIZE] as *const sys::ncclUniqueId) }
}
