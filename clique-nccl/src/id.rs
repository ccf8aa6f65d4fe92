use std::ffi::c_char;

use clique::{CLIQUE_ID_SIZE, CliqueError, CliqueId, CliqueIdGenerator};
use cudarc::nccl::safe::Id;

use crate::error::NcclCliqueError;

/// Generates clique ids with `ncclGetUniqueId`, so the id carries the
/// originator's NCCL bootstrap address.
#[derive(Debug, Clone, Copy, Default)]
pub struct NcclIdGenerator;

impl CliqueIdGenerator for NcclIdGenerator {
    fn generate(&self) -> clique::Result<CliqueId> {
        let id = Id::new().map_err(|e| CliqueError::Generation {
            message: "ncclGetUniqueId failed".into(),
            source: Some(Box::new(NcclCliqueError::from(e))),
        })?;
        tracing::debug!("generated NCCL unique id");
        Ok(clique_id_from_nccl(&id))
    }
}

/// Copy an NCCL unique id into a `CliqueId`.
pub fn clique_id_from_nccl(id: &Id) -> CliqueId {
    let mut bytes = [0u8; CLIQUE_ID_SIZE];
    for (dst, &c) in bytes.iter_mut().zip(id.internal().iter()) {
        *dst = c as u8;
    }
    CliqueId::from_array(bytes)
}

/// Rebuild the NCCL unique id carried by `id`.
pub fn nccl_id_from_clique(id: &CliqueId) -> Id {
    let mut internal = [0 as c_char; CLIQUE_ID_SIZE];
    for (dst, &b) in internal.iter_mut().zip(id.as_bytes().iter()) {
        *dst = b as c_char;
    }
    Id::uninit(internal)
}
