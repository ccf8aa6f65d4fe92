//! Per-participant clique bootstrap.
//!
//! Every participant of a clique runs one `CliqueBootstrap`. The originator
//! (rank 0) generates the id and publishes it; everyone else fetches it
//! through the same callback. All of them then meet in the callback's
//! agreement barrier, so either every participant reaches `Ready` holding
//! the same id or none does.
//!
//! ```text
//! Init ─▶ ResolvingConfig ─┬─▶ Generating (rank 0) ─┬─▶ Exchanging ─▶ Ready
//!                          └─▶ Awaiting   (rank>0) ─┘
//!            any non-terminal state ─▶ Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::callback::CliqueIdCallback;
use crate::config::CollectivesConfig;
use crate::error::{CliqueError, Result};
use crate::id::CliqueId;
use crate::resolver::CollectivesBackend;
use crate::types::{CliqueKey, ConfigMode, DeviceId, ORIGINATOR_RANK, Rank};

/// Observable state of one bootstrap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapPhase {
    Init,
    ResolvingConfig,
    Generating,
    Awaiting,
    Exchanging,
    Ready,
    Failed,
}

impl BootstrapPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, BootstrapPhase::Ready | BootstrapPhase::Failed)
    }
}

/// One participant's attempt to obtain the clique id for a group.
///
/// Attempts are single-use: once `Failed` (or abandoned mid-flight by
/// dropping the `run` future) the attempt cannot resume, and a retry must
/// build a new `CliqueBootstrap`. A failing attempt aborts its exchange on
/// the callback, so the retry may reuse the same callback.
pub struct CliqueBootstrap {
    key: CliqueKey,
    rank: Rank,
    mode: ConfigMode,
    backend: Arc<dyn CollectivesBackend>,
    candidate: Option<Arc<dyn CliqueIdCallback>>,
    exchange_timeout: Duration,
    publish_timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
    phase: watch::Sender<BootstrapPhase>,
    resolved: Option<CliqueId>,
    exchanged_via: Option<Arc<dyn CliqueIdCallback>>,
}

impl CliqueBootstrap {
    /// Prepare the bootstrap of `key` as seen from `local`.
    ///
    /// Fails if `local` is not a member of the participant set.
    pub fn new(
        key: CliqueKey,
        local: DeviceId,
        backend: Arc<dyn CollectivesBackend>,
    ) -> Result<Self> {
        let rank = key
            .rank_of(local)
            .ok_or_else(|| CliqueError::InvalidParticipants {
                reason: format!("device {local} is not a member of {key}"),
            })?;
        let defaults = CollectivesConfig::default();
        Ok(Self {
            key,
            rank,
            mode: ConfigMode::Global,
            backend,
            candidate: None,
            exchange_timeout: defaults.exchange_timeout,
            publish_timeout: defaults.publish_timeout,
            cancel: None,
            phase: watch::Sender::new(BootstrapPhase::Init),
            resolved: None,
            exchanged_via: None,
        })
    }

    /// Supply a caller-owned callback that overrides configuration.
    pub fn with_callback(mut self, callback: Arc<dyn CliqueIdCallback>) -> Self {
        self.candidate = Some(callback);
        self
    }

    /// Mark the request as local: all participants live in this process and
    /// the process-wide default callback must not be used.
    pub fn with_mode(mut self, mode: ConfigMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeouts(mut self, config: &CollectivesConfig) -> Self {
        self.exchange_timeout = config.exchange_timeout;
        self.publish_timeout = config.publish_timeout;
        self
    }

    /// Abort the exchange as soon as `cancel` becomes `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn key(&self) -> &CliqueKey {
        &self.key
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn mode(&self) -> ConfigMode {
        self.mode
    }

    pub fn is_originator(&self) -> bool {
        self.rank == ORIGINATOR_RANK
    }

    pub fn phase(&self) -> BootstrapPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions of this attempt.
    pub fn subscribe(&self) -> watch::Receiver<BootstrapPhase> {
        self.phase.subscribe()
    }

    /// The agreed id, once `Ready`.
    pub fn clique_id(&self) -> Option<&CliqueId> {
        self.resolved.as_ref()
    }

    /// The callback the id went through, once `Ready`.
    pub fn callback(&self) -> Option<&Arc<dyn CliqueIdCallback>> {
        self.exchanged_via.as_ref()
    }

    /// Drive the attempt to a terminal state.
    ///
    /// Once `Ready`, further calls return the same id without touching the
    /// exchange. Calling again after a failure, or after a previous `run`
    /// future was dropped mid-flight, returns `CliqueError::Failed`.
    pub async fn run(&mut self) -> Result<CliqueId> {
        let group_key = self.key.group_key();
        match self.phase() {
            BootstrapPhase::Ready => {
                if let Some(id) = &self.resolved {
                    return Ok(id.clone());
                }
                return Err(CliqueError::Failed { group_key });
            }
            BootstrapPhase::Init => {}
            _ => {
                self.transition(BootstrapPhase::Failed);
                return Err(CliqueError::Failed { group_key });
            }
        }

        match self.drive().await {
            Ok((id, callback)) => {
                self.resolved = Some(id.clone());
                self.exchanged_via = Some(callback);
                self.transition(BootstrapPhase::Ready);
                tracing::debug!(
                    group_key,
                    rank = self.rank,
                    world_size = self.key.world_size(),
                    fingerprint = %id,
                    "clique id ready"
                );
                Ok(id)
            }
            Err(e) => {
                self.transition(BootstrapPhase::Failed);
                tracing::warn!(group_key, rank = self.rank, error = %e, "clique bootstrap failed");
                Err(e)
            }
        }
    }

    async fn drive(&self) -> Result<(CliqueId, Arc<dyn CliqueIdCallback>)> {
        self.transition(BootstrapPhase::ResolvingConfig);
        let callback = self
            .backend
            .clique_id_callback(self.candidate.clone(), self.mode.is_local())?;

        match self.exchange(&*callback).await {
            Ok(id) => Ok((id, callback)),
            Err(e) => {
                if self.key.world_size() > 1 {
                    if let Err(abort) = callback.abort(&self.key).await {
                        tracing::warn!(
                            group_key = self.key.group_key(),
                            rank = self.rank,
                            error = %abort,
                            "failed to abort clique exchange"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn exchange(&self, callback: &dyn CliqueIdCallback) -> Result<CliqueId> {
        let deadline = Instant::now() + self.exchange_timeout;
        let mut cancel = self.cancel.clone();

        if self.is_originator() {
            self.transition(BootstrapPhase::Generating);
            let id = self.backend.create_unique_clique_id()?;

            if self.key.world_size() == 1 {
                return Ok(id);
            }

            self.transition(BootstrapPhase::Exchanging);
            // Only the local publish is bounded here; no peer is involved yet.
            let publish_bound = remaining(deadline).min(self.publish_timeout);
            let publish = callback.publish(&self.key, &id);
            self.bounded(&mut cancel, Instant::now() + publish_bound, publish, || {
                CliqueError::Timeout {
                    group_key: self.key.group_key(),
                    missing: vec![self.rank],
                    timeout_ms: publish_bound.as_millis() as u64,
                }
            })
            .await?;
            self.agree(callback, &mut cancel, deadline, &id).await?;
            Ok(id)
        } else {
            self.transition(BootstrapPhase::Awaiting);
            let fetch = callback.fetch(&self.key, remaining(deadline));
            let id = self
                .bounded(&mut cancel, deadline, fetch, || self.exchange_timed_out())
                .await?;

            self.transition(BootstrapPhase::Exchanging);
            self.agree(callback, &mut cancel, deadline, &id).await?;
            Ok(id)
        }
    }

    async fn agree(
        &self,
        callback: &dyn CliqueIdCallback,
        cancel: &mut Option<watch::Receiver<bool>>,
        deadline: Instant,
        id: &CliqueId,
    ) -> Result<()> {
        let agree = callback.agree(&self.key, self.rank, id, remaining(deadline));
        self.bounded(cancel, deadline, agree, || self.exchange_timed_out())
            .await
    }

    /// Await one exchange step under `deadline` and cancellation.
    ///
    /// The callback is given the remaining time too, but a callback that
    /// ignores it must still not hang the participant.
    async fn bounded<T>(
        &self,
        cancel: &mut Option<watch::Receiver<bool>>,
        deadline: Instant,
        step: impl Future<Output = Result<T>>,
        on_timeout: impl FnOnce() -> CliqueError,
    ) -> Result<T> {
        let outcome = tokio::select! {
            r = tokio::time::timeout_at(deadline, step) => match r {
                Ok(r) => r,
                Err(_) => Err(on_timeout()),
            },
            _ = cancelled(cancel) => Err(CliqueError::Cancelled {
                group_key: self.key.group_key(),
            }),
        };
        outcome.map_err(|e| e.at_rank(self.rank))
    }

    fn exchange_timed_out(&self) -> CliqueError {
        CliqueError::Timeout {
            group_key: self.key.group_key(),
            missing: self.unresponsive_peers(),
            timeout_ms: self.exchange_timeout.as_millis() as u64,
        }
    }

    /// Peers this participant was waiting on when the exchange stalled.
    fn unresponsive_peers(&self) -> Vec<Rank> {
        if self.is_originator() {
            (0..self.key.world_size())
                .filter(|&r| r != ORIGINATOR_RANK)
                .collect()
        } else {
            vec![ORIGINATOR_RANK]
        }
    }

    fn transition(&self, next: BootstrapPhase) {
        let prev = self.phase.send_replace(next);
        tracing::debug!(
            group_key = self.key.group_key(),
            rank = self.rank,
            ?prev,
            ?next,
            "clique bootstrap transition"
        );
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            let closed = rx.wait_for(|c| *c).await.is_err();
            if closed {
                // Sender gone without cancelling: never fires.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
