//! Clique ids: the opaque token every participant of a clique must share.

use rand::TryRngCore;
use rand::rngs::OsRng;

use crate::error::{CliqueError, Result};
use crate::hash::{fnv1a, fold32};

/// Size of a clique id in bytes.
///
/// Matches `NCCL_UNIQUE_ID_BYTES` so an id can be handed to NCCL unchanged.
pub const CLIQUE_ID_SIZE: usize = 128;

/// Opaque, fixed-size token identifying one clique instantiation.
///
/// Created once by the originator, never mutated. `Debug` and `Display`
/// print a short fingerprint instead of the raw bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CliqueId([u8; CLIQUE_ID_SIZE]);

impl CliqueId {
    pub const fn from_array(bytes: [u8; CLIQUE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse an id received from the exchange.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; CLIQUE_ID_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CliqueError::InvalidCliqueId {
                    expected: CLIQUE_ID_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Parse an id from its hex encoding (as stored in text key-value stores).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| CliqueError::InvalidCliqueId {
            expected: CLIQUE_ID_SIZE,
            actual: s.len() / 2,
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CLIQUE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short stable digest for logs and error messages.
    pub fn fingerprint(&self) -> u32 {
        fold32(fnv1a([&self.0[..]]))
    }
}

impl std::fmt::Debug for CliqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CliqueId({:08x})", self.fingerprint())
    }
}

impl std::fmt::Display for CliqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.fingerprint())
    }
}

/// Source of fresh clique ids.
///
/// The default draws from the OS entropy source. Transports whose ids carry
/// meaning (NCCL embeds the originator's bootstrap address) plug in their own.
pub trait CliqueIdGenerator: Send + Sync {
    fn generate(&self) -> Result<CliqueId>;
}

/// Generates ids from the operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator;

impl CliqueIdGenerator for RandomIdGenerator {
    fn generate(&self) -> Result<CliqueId> {
        create_unique_clique_id()
    }
}

/// Create a fresh clique id from the OS entropy source.
///
/// Fails with `CliqueError::Generation` if the entropy source is unavailable;
/// no partially filled id is ever returned.
pub fn create_unique_clique_id() -> Result<CliqueId> {
    let mut bytes = [0u8; CLIQUE_ID_SIZE];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CliqueError::generation(format!("os entropy source unavailable: {e}")))?;
    Ok(CliqueId(bytes))
}
