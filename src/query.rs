//! The interface to the discovery backend, which answers blocking queries.

use crate::instance::ServiceInstance;
use crate::target::ServiceName;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Marks the last-seen version of the backend's data.
///
/// A query carrying a token blocks until the backend holds data newer than
/// the token. The initial token never blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ContinuationToken(pub u64);

impl ContinuationToken {
    pub const INITIAL: Self = Self(0);
}

/// Parameters of a single blocking query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    pub service: ServiceName,
    pub tags: Arc<[String]>,

    /// Ask the backend to return only instances with passing health checks.
    pub healthy_only: bool,

    pub token: ContinuationToken,

    /// How long the backend may hold the query open.
    ///
    /// `None` leaves the choice to the [QueryPort].
    pub wait_time: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResponse {
    pub instances: Vec<ServiceInstance>,
    pub token: ContinuationToken,
}

#[derive(Error, Debug)]
pub enum QueryError {
    /// The query was abandoned because its caller shut down.
    #[error("query cancelled")]
    Cancelled,

    #[error("discovery backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Issues blocking queries against a discovery backend.
///
/// # Cancellation
///
/// The watcher cancels an outstanding query by dropping its future, so
/// implementations must not rely on running to completion. Implementations
/// which notice shutdown on their own (for example, because their client was
/// closed) report it as [QueryError::Cancelled].
#[async_trait]
pub trait QueryPort: Send + Sync {
    /// Returns the instances of `request.service`.
    ///
    /// Blocks until the backend holds data newer than `request.token`, or
    /// until the wait time elapses.
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError>;
}

pub type SharedQueryPort = Arc<dyn QueryPort>;
