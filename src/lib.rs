//! blockwatch keeps a consumer informed about the addresses of a service,
//! by watching a discovery backend with blocking queries.
//!
//! It uses the following terminology:
//! * Services are named entities registered with a discovery backend.
//! * Instances are the registrations of a service, each with an address and
//!   a set of health checks.
//! * A blocking query is a request which the backend holds open until its
//!   data changes past a [query::ContinuationToken], or a wait time elapses.
//!
//! # Usage
//!
//! * The main interface for this crate is [watcher::Watcher].
//! * To start a watcher, you must supply a [target::Target], a
//!   [query::QueryPort] and a [sink::UpdateSink]. These describe "what to
//!   resolve", "how to ask the backend" and "where to deliver results",
//!   respectively. [sink::WatchSink] is a ready-made sink which publishes
//!   results on a `tokio::sync::watch` channel.
//!
//! The watcher only calls the sink when something changed: the same address
//! set is never delivered twice in a row, and a failure is only reported if
//! its message differs from the previously reported failure. Failed queries
//! are retried indefinitely, with delays taken from a
//! [backoff::BackoffConfig].
//!
//! # DTrace probes
//!
//! blockwatch contains a number of DTrace USDT probes, which fire as the
//! watcher queries the backend and reports results. The full list of probes
//! is:
//!
//! - `query-start`: Fires before issuing a query to the discovery backend.
//! - `query-done`: Fires after a query returned successfully.
//! - `query-failed`: Fires after a query failed, with the reason.
//! - `token-reset`: Fires when the backend returned an older continuation
//!   token than it was given.
//! - `report-addresses`: Fires before delivering a new address set.
//! - `report-error`: Fires before delivering a failure.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly
//! enabled, by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registering the probes is technically fallible. To account for this,
//! [watcher::Watcher::start] returns an `Err` if registration fails, which
//! still gives access to the running watcher.

// Public API
pub mod backoff;
pub mod health;
pub mod instance;
pub mod policy;
pub mod query;
pub mod sink;
pub mod target;
pub mod watcher;

#[cfg(test)]
mod test_utils;

/// USDT probes for tracing how blockwatch queries backends and reports
/// results.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "blockwatch")]
mod probes {
    /// Fires right before querying the discovery backend, with the
    /// continuation token sent along.
    fn query__start(service: &str, token: u64) {}

    /// Fires when a query returns, with the new continuation token and the
    /// number of instances before health filtering.
    fn query__done(service: &str, token: u64, instances: u64) {}

    /// Fires when a query fails, with a string identifying the reason.
    fn query__failed(service: &str, reason: &str) {}

    /// Fires when the backend returned a continuation token older than the
    /// one it was sent, and the watcher starts over.
    fn token__reset(service: &str, sent: u64, returned: u64) {}

    /// Fires right before delivering a changed address set.
    fn report__addresses(service: &str, count: u64) {}

    /// Fires right before delivering a failure.
    fn report__error(service: &str, reason: &str) {}
}
