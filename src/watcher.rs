//! The resolution watcher, which turns blocking queries into a stream of
//! deduplicated updates.

use crate::backoff::Backoff;
use crate::health::{self, HealthFilterMode};
use crate::instance::{ResolvedAddress, ServiceInstance};
use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::query::{ContinuationToken, QueryError, QueryRequest, SharedQueryPort};
use crate::sink::SharedUpdateSink;
use crate::target::{ServiceName, Target};

use debug_ignore::DebugIgnore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

/// The last thing delivered to the sink.
#[derive(Debug)]
enum Reported {
    Addresses(Arc<[ResolvedAddress]>),
    // Errors are compared by message: their identity does not survive the
    // trip through a backend client.
    Error(String),
}

// What the worker should do after a poll.
enum Outcome {
    // Poll again right away.
    Continue,
    // Poll again after the delay, unless a trigger arrives first.
    Retry(Duration),
    Closed,
}

/// Owns the state which persists across poll cycles.
///
/// Only the worker task touches this; the [Watcher] handle shares nothing
/// with it except the trigger and the terminate channel.
struct WatcherWorker {
    service: ServiceName,
    tags: Arc<[String]>,
    health_filter: HealthFilterMode,

    port: SharedQueryPort,
    sink: SharedUpdateSink,
    policy: Policy,
    backoff: Backoff,

    // Pending re-resolution request. Holds at most one permit, so triggers
    // which arrive before the worker gets to them collapse into one.
    trigger: Arc<Notify>,

    token: ContinuationToken,
    reported: Option<Reported>,

    // Consecutive failed queries.
    retries: usize,

    // Delay chosen after the most recent failure. Set only while the last
    // query failed.
    retry_delay: Option<Duration>,
}

impl WatcherWorker {
    fn new(
        target: Target,
        port: SharedQueryPort,
        sink: SharedUpdateSink,
        policy: Policy,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            service: target.service,
            tags: target.tags.into(),
            health_filter: target.health_filter,
            port,
            sink,
            backoff: Backoff::new(policy.backoff.clone()),
            policy,
            trigger,
            token: ContinuationToken::INITIAL,
            reported: None,
            retries: 0,
            retry_delay: None,
        }
    }

    async fn run(mut self, mut terminate_rx: oneshot::Receiver<()>) {
        let trigger = self.trigger.clone();
        loop {
            // Blocking queries may stay open for minutes. A trigger abandons
            // the outstanding one in favor of a fresh, non-blocking query.
            let outcome = tokio::select! {
                _ = &mut terminate_rx => return,
                _ = trigger.notified() => {
                    event!(
                        Level::DEBUG,
                        service = %self.service,
                        "Resolution requested, restarting query"
                    );
                    self.token = ContinuationToken::INITIAL;
                    continue;
                },
                outcome = self.poll() => outcome,
            };

            match outcome {
                Outcome::Continue => (),
                Outcome::Retry(delay) => {
                    tokio::select! {
                        _ = &mut terminate_rx => return,
                        _ = trigger.notified() => (),
                        _ = tokio::time::sleep(delay) => (),
                    }
                }
                Outcome::Closed => return,
            }
        }
    }

    fn request(&self) -> QueryRequest {
        QueryRequest {
            service: self.service.clone(),
            tags: self.tags.clone(),
            healthy_only: self.health_filter.healthy_only(),
            token: self.token,
            wait_time: self.retry_delay,
        }
    }

    // Runs a single poll cycle: one query, and whatever reporting its result
    // calls for.
    #[instrument(
        level = "trace",
        skip(self),
        fields(service = %self.service, token = self.token.0),
        name = "WatcherWorker::poll"
    )]
    async fn poll(&mut self) -> Outcome {
        let request = self.request();
        let started_at = Instant::now();

        #[cfg(feature = "probes")]
        probes::query__start!(|| (self.service.as_str(), request.token.0));
        event!(
            Level::TRACE,
            tags = ?request.tags,
            healthy_only = request.healthy_only,
            wait_time = ?request.wait_time,
            "Querying discovery backend"
        );

        let response = match self.port.query(&request).await {
            Ok(response) => response,
            Err(QueryError::Cancelled) => {
                event!(Level::DEBUG, service = %self.service, "Query cancelled, stopping");
                return Outcome::Closed;
            }
            Err(err) => return self.query_failed(err),
        };

        #[cfg(feature = "probes")]
        probes::query__done!(|| (
            self.service.as_str(),
            response.token.0,
            response.instances.len() as u64
        ));

        self.retries = 0;
        self.retry_delay = None;

        if response.token < request.token {
            event!(
                Level::INFO,
                service = %self.service,
                previous = request.token.0,
                returned = response.token.0,
                "Backend returned an older continuation token, restarting blocking queries"
            );
            #[cfg(feature = "probes")]
            probes::token__reset!(|| (self.service.as_str(), request.token.0, response.token.0));
            self.token = ContinuationToken::INITIAL;
            return Outcome::Continue;
        }
        self.token = response.token;

        let addresses = resolve(response.instances, self.health_filter);
        event!(
            Level::DEBUG,
            service = %self.service,
            ?addresses,
            "Resolved service"
        );

        if !self.report_addresses(addresses)
            && self.token == request.token
            && started_at.elapsed() < self.policy.fast_response_threshold
        {
            // Blocking queries should take a while to answer. An identical
            // answer this quick means the backend is not blocking at all.
            event!(
                Level::WARN,
                service = %self.service,
                token = self.token.0,
                "Backend responded too fast with unchanged data, delaying next query"
            );
            tokio::time::sleep(self.policy.fast_response_delay).await;
        }

        Outcome::Continue
    }

    fn query_failed(&mut self, err: QueryError) -> Outcome {
        let delay = self.backoff.delay(self.retries);
        self.retries = self.retries.saturating_add(1);
        self.retry_delay = Some(delay);
        // The backoff already waited out the delay, so the retry must not
        // block on top of it.
        self.token = ContinuationToken::INITIAL;

        event!(
            Level::INFO,
            service = %self.service,
            retries = self.retries,
            ?delay,
            %err,
            "Resolving service failed, retrying"
        );
        #[cfg(feature = "probes")]
        probes::query__failed!(|| (self.service.as_str(), err.to_string()));

        self.report_error(err);
        Outcome::Retry(delay)
    }

    // Delivers `addresses` unless they were also the last thing delivered.
    //
    // Returns true if the sink was called.
    fn report_addresses(&mut self, addresses: Vec<ResolvedAddress>) -> bool {
        if let Some(Reported::Addresses(last)) = &self.reported {
            if **last == *addresses {
                return false;
            }
        }

        let addresses: Arc<[ResolvedAddress]> = addresses.into();
        self.reported = Some(Reported::Addresses(addresses.clone()));

        #[cfg(feature = "probes")]
        probes::report__addresses!(|| (self.service.as_str(), addresses.len() as u64));
        if let Err(err) = self.sink.report_addresses(addresses) {
            // The sink asks for re-resolution itself if it needs the update
            // again.
            event!(
                Level::DEBUG,
                service = %self.service,
                %err,
                "Ignoring error returned by update sink"
            );
        }
        true
    }

    // Delivers `err` unless an error with the same message was the last thing
    // delivered.
    //
    // Returns true if the sink was called.
    fn report_error(&mut self, err: QueryError) -> bool {
        let message = err.to_string();
        if let Some(Reported::Error(last)) = &self.reported {
            if *last == message {
                return false;
            }
        }

        #[cfg(feature = "probes")]
        probes::report__error!(|| (self.service.as_str(), message.as_str()));
        self.sink.report_error(&err);
        self.reported = Some(Reported::Error(message));
        true
    }
}

/// Filters `instances` and returns their addresses in canonical order.
fn resolve(instances: Vec<ServiceInstance>, mode: HealthFilterMode) -> Vec<ResolvedAddress> {
    let mut addresses: Vec<_> = health::filter(instances, mode)
        .iter()
        .map(ServiceInstance::resolved_address)
        .collect();
    addresses.sort();
    addresses
}

/// Error returned when the USDT probes could not be registered.
///
/// The watcher runs regardless. Similar to `std::sync::PoisonError`, this
/// contains the watcher itself, for applications which don't care about
/// probe registration.
pub struct RegistrationError(Watcher);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl std::error::Error for RegistrationError {}

impl RegistrationError {
    /// Consume the error and get access to the contained watcher.
    pub fn into_inner(self) -> Watcher {
        self.0
    }
}

/// Keeps an [crate::sink::UpdateSink] informed about the addresses of a
/// service.
///
/// A background task issues blocking queries through a
/// [crate::query::QueryPort] until [Watcher::close] is called. Dropping the
/// watcher without closing it aborts the task.
#[derive(Debug)]
pub struct Watcher {
    service: ServiceName,
    trigger: DebugIgnore<Arc<Notify>>,
    handle: Option<JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl Watcher {
    /// Starts watching `target`.
    ///
    /// The first query is issued immediately, without a continuation token,
    /// so the sink hears about the current addresses as soon as the backend
    /// answers.
    ///
    /// Must be called within a tokio runtime.
    #[instrument(skip_all, fields(service = %target.service), name = "Watcher::start")]
    pub fn start(
        target: Target,
        port: SharedQueryPort,
        sink: SharedUpdateSink,
        policy: Policy,
    ) -> Result<Self, RegistrationError> {
        let service = target.service.clone();
        let trigger = Arc::new(Notify::new());
        let worker = WatcherWorker::new(target, port, sink, policy, trigger.clone());
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = tokio::task::spawn(async move {
            worker.run(terminate_rx).await;
        });

        let self_ = Self {
            service,
            trigger: DebugIgnore(trigger),
            handle: Some(handle),
            terminate_tx: Some(terminate_tx),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Returns the name of the service being watched.
    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// Asks the watcher to query the backend again as soon as possible.
    ///
    /// Never blocks. Requests made before the watcher gets to them collapse
    /// into a single query.
    pub fn trigger_resolution(&self) {
        self.trigger.notify_one();
    }

    /// Stops the watcher, returning once its background task has exited.
    ///
    /// No calls are made into the sink after this returns. Calling this more
    /// than once is harmless.
    pub async fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Some(terminate_tx) = self.terminate_tx.take() {
            // The worker may have exited on its own already.
            let _send_result = terminate_tx.send(());
        }

        match handle.await {
            Ok(()) => (),
            Err(err) if err.is_cancelled() => (),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => panic!("Unexpected join error from watcher task: {err}"),
        }
    }

    /// Returns true once [Self::close] has completed.
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
    }
}
