//! Utilities to help with testing the watcher

use crate::instance::{ResolvedAddress, ServiceInstance};
use crate::query::{ContinuationToken, QueryError, QueryPort, QueryRequest, QueryResponse};
use crate::sink::{DeliveryError, UpdateSink};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// A test-only query port which answers from a script.
///
/// Queries issued while the script is empty block until a response is
/// pushed, like a blocking query against a backend whose data never changes.
pub struct ScriptedPort {
    script: Mutex<VecDeque<Result<QueryResponse, QueryError>>>,
    requests: Mutex<Vec<(Instant, QueryRequest)>>,
    pushed: Notify,
}

impl ScriptedPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            pushed: Notify::new(),
        })
    }

    pub fn push_instances(&self, instances: Vec<ServiceInstance>, token: u64) {
        self.push(Ok(QueryResponse {
            instances,
            token: ContinuationToken(token),
        }));
    }

    pub fn push_error(&self, err: QueryError) {
        self.push(Err(err));
    }

    fn push(&self, response: Result<QueryResponse, QueryError>) {
        self.script.lock().unwrap().push_back(response);
        self.pushed.notify_waiters();
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    /// The instants at which requests were received.
    pub fn request_times(&self) -> Vec<Instant> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn tokens(&self) -> Vec<u64> {
        self.requests().iter().map(|r| r.token.0).collect()
    }
}

#[async_trait]
impl QueryPort for ScriptedPort {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        self.requests
            .lock()
            .unwrap()
            .push((Instant::now(), request.clone()));

        loop {
            // Register interest before checking, so a concurrent push is not
            // missed.
            let pushed = self.pushed.notified();
            let next = self.script.lock().unwrap().pop_front();
            if let Some(response) = next {
                return response;
            }
            pushed.await;
        }
    }
}

/// A test-only query port behaving like a blocking backend whose data never
/// changes.
///
/// Queries carrying the current index block for their wait time, or for
/// `hold` if they have none. Other queries are answered right away.
pub struct BlockingPort {
    instances: Vec<ServiceInstance>,
    index: ContinuationToken,
    hold: Duration,
    failures: Mutex<Vec<(usize, QueryError)>>,
    requests: Mutex<Vec<(Instant, QueryRequest)>>,
}

impl BlockingPort {
    pub fn new(instances: Vec<ServiceInstance>, index: u64, hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            instances,
            index: ContinuationToken(index),
            hold,
            failures: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Makes the `call`-th query (counting from 1) fail with `err`.
    pub fn fail_call(&self, call: usize, err: QueryError) {
        self.failures.lock().unwrap().push((call, err));
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn tokens(&self) -> Vec<u64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.token.0)
            .collect()
    }
}

#[async_trait]
impl QueryPort for BlockingPort {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((Instant::now(), request.clone()));
            requests.len()
        };

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            failures
                .iter()
                .position(|(at, _)| *at == call)
                .map(|i| failures.remove(i).1)
        };
        if let Some(err) = failure {
            return Err(err);
        }

        if request.token >= self.index {
            tokio::time::sleep(request.wait_time.unwrap_or(self.hold)).await;
        }
        Ok(QueryResponse {
            instances: self.instances.clone(),
            token: self.index,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Addresses(Vec<String>),
    Error(String),
}

impl SinkEvent {
    pub fn addresses(addrs: &[&str]) -> Self {
        SinkEvent::Addresses(addrs.iter().map(|a| a.to_string()).collect())
    }
}

/// A test-only sink recording every call made to it.
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    reject: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
        })
    }

    /// Makes every future address delivery fail, after recording it.
    pub fn reject_updates(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl UpdateSink for RecordingSink {
    fn report_addresses(&self, addresses: Arc<[ResolvedAddress]>) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(SinkEvent::Addresses(
            addresses.iter().map(|a| a.to_string()).collect(),
        ));
        if self.reject.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("test sink rejects updates".to_string()));
        }
        Ok(())
    }

    fn report_error(&self, error: &QueryError) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Error(error.to_string()));
    }
}

/// Lets background tasks run until they are blocked.
///
/// Intended for tests with paused time: the clock only jumps ahead once every
/// task is idle, so no real time passes.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
