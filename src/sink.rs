//! The interface the watcher reports resolution results to.

use crate::instance::ResolvedAddress;
use crate::query::QueryError;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("update sink closed")]
    Closed,

    #[error("update rejected: {0}")]
    Rejected(String),
}

/// Receives resolution results.
///
/// Implementations must not block: they are invoked directly from the
/// watcher's worker task.
pub trait UpdateSink: Send + Sync {
    /// Accepts a new, sorted set of addresses.
    ///
    /// Errors are logged by the watcher but otherwise ignored. A sink that
    /// needs the update again should ask for it via
    /// [crate::watcher::Watcher::trigger_resolution].
    fn report_addresses(&self, addresses: Arc<[ResolvedAddress]>) -> Result<(), DeliveryError>;

    /// Accepts a resolution failure.
    fn report_error(&self, error: &QueryError);
}

pub type SharedUpdateSink = Arc<dyn UpdateSink>;

/// The most recent resolution result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolverState {
    /// Nothing has been reported yet.
    Pending,
    Addresses(Arc<[ResolvedAddress]>),
    Error(Arc<str>),
}

/// An [UpdateSink] which publishes the latest [ResolverState] on a
/// [watch] channel.
#[derive(Debug)]
pub struct WatchSink {
    tx: watch::Sender<ResolverState>,
}

impl Default for WatchSink {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchSink {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ResolverState::Pending);
        Self { tx }
    }

    /// Returns a receiver to track ongoing resolution results.
    pub fn monitor(&self) -> watch::Receiver<ResolverState> {
        self.tx.subscribe()
    }

    /// Returns a stream yielding the current state, then every change.
    pub fn updates(&self) -> WatchStream<ResolverState> {
        WatchStream::new(self.monitor())
    }
}

impl UpdateSink for WatchSink {
    // The state is stored even without receivers, so later subscribers start
    // from the latest result.
    fn report_addresses(&self, addresses: Arc<[ResolvedAddress]>) -> Result<(), DeliveryError> {
        self.tx.send_replace(ResolverState::Addresses(addresses));
        if self.tx.receiver_count() == 0 {
            return Err(DeliveryError::Closed);
        }
        Ok(())
    }

    fn report_error(&self, error: &QueryError) {
        self.tx
            .send_replace(ResolverState::Error(error.to_string().into()));
    }
}
