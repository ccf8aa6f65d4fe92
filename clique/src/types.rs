use indexmap::IndexSet;

use crate::error::{CliqueError, Result};
use crate::hash::fnv1a;

/// Identifier of a device (or the process driving it) taking part in a clique.
pub type DeviceId = u32;

/// Position of a participant within an ordered participant set (0-indexed).
pub type Rank = u32;

/// Rank that generates and publishes the clique id.
pub const ORIGINATOR_RANK: Rank = 0;

/// Where callback resolution for one bootstrap request comes from.
///
/// Recorded once per request and fixed for the lifetime of that bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigMode {
    /// Use the process-wide default callback.
    Global,
    /// Use the callback supplied with this request.
    Local,
}

impl ConfigMode {
    pub fn from_is_local(is_local: bool) -> Self {
        if is_local {
            ConfigMode::Local
        } else {
            ConfigMode::Global
        }
    }

    pub fn is_local(self) -> bool {
        self == ConfigMode::Local
    }
}

impl std::fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigMode::Global => f.write_str("global"),
            ConfigMode::Local => f.write_str("local"),
        }
    }
}

/// Ordered participant set identifying one clique.
///
/// Every participant must construct the same key (same devices, same order,
/// same tag) or the exchange will not meet. The tag separates cliques over
/// the same devices, e.g. one per stream kind or tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CliqueKey {
    devices: Vec<DeviceId>,
    tag: u32,
}

impl CliqueKey {
    /// Build a key from an ordered device list.
    ///
    /// Fails if the list is empty or names a device twice.
    pub fn new(devices: impl IntoIterator<Item = DeviceId>) -> Result<Self> {
        let devices: Vec<DeviceId> = devices.into_iter().collect();
        if devices.is_empty() {
            return Err(CliqueError::InvalidParticipants {
                reason: "participant set is empty".into(),
            });
        }

        let unique: IndexSet<DeviceId> = devices.iter().copied().collect();
        if unique.len() != devices.len() {
            let dup = devices
                .iter()
                .enumerate()
                .find(|&(i, d)| unique.get_index_of(d) != Some(i))
                .map(|(_, d)| *d);
            return Err(CliqueError::InvalidParticipants {
                reason: format!("device {} appears more than once", dup.unwrap_or_default()),
            });
        }

        Ok(Self { devices, tag: 0 })
    }

    /// Separate this clique from others over the same devices.
    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn world_size(&self) -> u32 {
        self.devices.len() as u32
    }

    /// Rank of `device` within this clique, if it participates.
    pub fn rank_of(&self, device: DeviceId) -> Option<Rank> {
        self.devices
            .iter()
            .position(|&d| d == device)
            .map(|r| r as Rank)
    }

    /// Device holding `rank`.
    pub fn device(&self, rank: Rank) -> Option<DeviceId> {
        self.devices.get(rank as usize).copied()
    }

    /// The device elected to generate the clique id.
    pub fn originator(&self) -> DeviceId {
        self.devices[ORIGINATOR_RANK as usize]
    }

    /// Deterministic identity of this participant set, used to address the
    /// exchange so concurrent groups never see each other's ids.
    pub fn group_key(&self) -> u64 {
        let len = (self.devices.len() as u64).to_le_bytes();
        let tag = self.tag.to_le_bytes();
        let devices = self.devices.iter().map(|d| d.to_le_bytes());
        fnv1a(
            [len.to_vec(), tag.to_vec()]
                .into_iter()
                .chain(devices.map(|d| d.to_vec())),
        )
    }
}

impl std::fmt::Display for CliqueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clique[")?;
        for (i, d) in self.devices.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")?;
        if self.tag != 0 {
            write!(f, "#{}", self.tag)?;
        }
        Ok(())
    }
}
