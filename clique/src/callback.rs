use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::id::CliqueId;
use crate::types::{CliqueKey, Rank};

/// Out-of-band exchange of a clique id among the participants of a clique.
///
/// The originator publishes, everyone else fetches. Every exchange is
/// addressed by the clique key, so one callback can serve many concurrent
/// groups without cross-delivering ids.
///
/// Implementations are supplied by whatever rendezvous the job has (a
/// distributed key-value store, a launcher socket, an in-process table).
pub trait CliqueIdCallback: Send + Sync {
    /// Make `id` available to the other participants of `key`.
    ///
    /// Must reject a second publish into the same attempt with
    /// `CliqueError::Consistency`: two originators means a misconfigured job.
    /// A publish after `abort` opens a fresh attempt instead.
    fn publish<'a>(&'a self, key: &'a CliqueKey, id: &'a CliqueId) -> BoxFuture<'a, Result<()>>;

    /// Wait up to `timeout` for the id published for `key`.
    fn fetch<'a>(&'a self, key: &'a CliqueKey, timeout: Duration)
    -> BoxFuture<'a, Result<CliqueId>>;

    /// Agreement barrier: returns once every rank of `key` has arrived
    /// holding the same id.
    ///
    /// Fails with `CliqueError::Timeout` naming the ranks that never arrived,
    /// or `CliqueError::Consistency` if someone arrived with a different id.
    /// Callbacks without barrier support keep the default, which trusts the
    /// publish/fetch exchange.
    fn agree<'a>(
        &'a self,
        _key: &'a CliqueKey,
        _rank: Rank,
        _id: &'a CliqueId,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Close the current exchange attempt for `key`: every participant
    /// blocked in it fails with `CliqueError::Cancelled`, and the next
    /// `publish` starts a fresh attempt.
    ///
    /// A bootstrap calls this whenever it fails after resolving the callback.
    /// Participants that start waiting after the abort wait for the next
    /// attempt. Aborting an attempt whose barrier was already met does
    /// nothing.
    fn abort<'a>(&'a self, _key: &'a CliqueKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Drop every piece of exchange state kept for `key`. Called when the
    /// formed group is torn down.
    fn release<'a>(&'a self, _key: &'a CliqueKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
