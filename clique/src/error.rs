use crate::types::Rank;

pub type Result<T> = std::result::Result<T, CliqueError>;

#[derive(Debug, thiserror::Error)]
pub enum CliqueError {
    #[error("clique id generation failed: {message}")]
    Generation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("no usable clique id callback: {reason}")]
    Config { reason: String },

    #[error(
        "clique exchange for group {group_key:016x} timed out after {timeout_ms}ms; no response from ranks {missing:?}"
    )]
    Timeout {
        group_key: u64,
        missing: Vec<Rank>,
        timeout_ms: u64,
    },

    #[error("clique exchange transport failed at rank {}: {message}", display_rank(.rank))]
    Transport {
        rank: Option<Rank>,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("inconsistent clique id for group {group_key:016x}: {reason}")]
    Consistency { group_key: u64, reason: String },

    #[error("clique bootstrap for group {group_key:016x} cancelled")]
    Cancelled { group_key: u64 },

    #[error("clique bootstrap for group {group_key:016x} is already in flight on device {device}")]
    InFlight { group_key: u64, device: u32 },

    #[error("invalid participant set: {reason}")]
    InvalidParticipants { reason: String },

    #[error("invalid clique id: expected {expected} bytes, got {actual}")]
    InvalidCliqueId { expected: usize, actual: usize },

    #[error("clique bootstrap for group {group_key:016x} already failed; start a new attempt")]
    Failed { group_key: u64 },

    #[error("communicator creation failed: {message}")]
    Communicator {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

fn display_rank(rank: &Option<Rank>) -> String {
    match rank {
        Some(r) => r.to_string(),
        None => "?".to_string(),
    }
}

impl CliqueError {
    /// Create a `Generation` error with just a message.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Config` error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a `Transport` error not yet attributed to a participant.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            rank: None,
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            rank: None,
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Communicator` error with a message and a source error.
    pub fn communicator_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Communicator {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Attribute an unattributed `Transport` error to `rank`.
    ///
    /// Other variants, and transport errors that already name a rank, pass
    /// through unchanged.
    pub fn at_rank(self, rank: Rank) -> Self {
        match self {
            Self::Transport {
                rank: None,
                message,
                source,
            } => Self::Transport {
                rank: Some(rank),
                message,
                source,
            },
            other => other,
        }
    }

    /// Whether re-running the whole bootstrap from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Transport { .. }
                | Self::Cancelled { .. }
                | Self::InFlight { .. }
                | Self::Failed { .. }
        )
    }
}
