// src/transport/mock.rs
// In-process loopback broker. Queues live in memory, sessions are transacted
// the way a real broker's are, and every resource it hands out is counted so
// tests can check that nothing leaks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use super::errors::{TransportError, TransportResult};
use super::frame::Frame;
use super::{BrokerAddress, EndpointId, TransportConnection, TransportConnector, TransportSession};
use crate::properties::{ConnectionOptions, DestinationOptions};

/// Snapshot of the broker's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockStats {
    pub library_initializations: usize,
    pub library_shutdowns: usize,
    pub connect_attempts: usize,
    pub open_connections: usize,
    pub open_sessions: usize,
    pub open_producers: usize,
    pub open_consumers: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Every call made through the transport traits.
    pub transport_calls: usize,
}

/// Failures the broker will inject on request.
#[derive(Debug, Default)]
pub struct Faults {
    pub fail_library_init: bool,
    /// Connect attempts that fail as unreachable before one succeeds.
    pub unreachable_attempts: u32,
    pub unreachable_hosts: Vec<String>,
    pub fail_start: bool,
    pub fail_session_creation: bool,
    pub invalid_destinations: Vec<String>,
    pub reject_sends: bool,
    pub fail_rollback: bool,
    /// Producer and consumer closes fail and leave the endpoint open.
    pub fail_endpoint_close: bool,
    /// The connection goes away but reports a failed close handshake.
    pub fail_connection_close: bool,
}

struct BrokerInner {
    id: Uuid,
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    arrivals: Notify,
    stats: Mutex<MockStats>,
    faults: Mutex<Faults>,
}

/// Shared handle to one in-memory broker. Clones see the same queues.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                id: Uuid::new_v4(),
                queues: Mutex::new(HashMap::new()),
                arrivals: Notify::new(),
                stats: Mutex::new(MockStats::default()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    pub fn stats(&self) -> MockStats {
        *lock(&self.inner.stats)
    }

    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        lock(&self.inner.faults)
    }

    /// Committed messages waiting on `destination`.
    pub fn depth(&self, destination: &str) -> usize {
        lock(&self.inner.queues)
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    /// Places raw bytes on a queue as if another client had committed them.
    pub fn inject_raw(&self, destination: &str, bytes: Vec<u8>) {
        self.enqueue(destination, bytes);
        self.inner.arrivals.notify_waiters();
    }

    fn record<F: FnOnce(&mut MockStats)>(&self, update: F) {
        let mut stats = lock(&self.inner.stats);
        stats.transport_calls += 1;
        update(&mut stats);
    }

    fn enqueue(&self, destination: &str, bytes: Vec<u8>) {
        lock(&self.inner.queues)
            .entry(destination.to_string())
            .or_default()
            .push_back(bytes);
    }

    fn dequeue(&self, destination: &str) -> Option<Vec<u8>> {
        lock(&self.inner.queues).get_mut(destination)?.pop_front()
    }

    fn requeue_front(&self, destination: &str, bytes: Vec<u8>) {
        lock(&self.inner.queues)
            .entry(destination.to_string())
            .or_default()
            .push_front(bytes);
    }
}

// The broker's locks are never held across an await or a panic point that
// could leave state half-written, so a poisoned lock is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl TransportConnector for MockConnector {
    fn library_key(&self) -> String {
        format!("mock#{}", self.broker.inner.id)
    }

    fn initialize_library(&self) -> TransportResult<()> {
        if self.broker.faults().fail_library_init {
            self.broker.record(|_| {});
            return Err(TransportError::LibraryInit("mock library refused to load".to_string()));
        }
        self.broker.record(|stats| stats.library_initializations += 1);
        Ok(())
    }

    fn shutdown_library(&self) {
        self.broker.record(|stats| stats.library_shutdowns += 1);
    }

    async fn connect(
        &self,
        address: &BrokerAddress,
        _options: &ConnectionOptions,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        self.broker.record(|stats| stats.connect_attempts += 1);

        {
            let mut faults = self.broker.faults();
            if faults.unreachable_hosts.iter().any(|host| host == address.host()) {
                return Err(TransportError::Unreachable(format!("{} refused connection", address)));
            }
            if faults.unreachable_attempts > 0 {
                faults.unreachable_attempts -= 1;
                return Err(TransportError::Unreachable(format!("{} is not answering", address)));
            }
        }

        self.broker.record(|stats| stats.open_connections += 1);
        debug!(broker = %address, "Mock connection opened");
        Ok(Box::new(MockConnection {
            broker: self.broker.clone(),
            started: false,
            closed: false,
        }))
    }
}

pub struct MockConnection {
    broker: MockBroker,
    started: bool,
    closed: bool,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn start(&mut self) -> TransportResult<()> {
        self.broker.record(|_| {});
        if self.broker.faults().fail_start {
            return Err(TransportError::Rejected("broker refused to start delivery".to_string()));
        }
        self.started = true;
        Ok(())
    }

    async fn create_session(&mut self, transacted: bool) -> TransportResult<Box<dyn TransportSession>> {
        self.broker.record(|_| {});
        if self.closed {
            return Err(TransportError::Closed("connection is closed".to_string()));
        }
        if self.broker.faults().fail_session_creation {
            return Err(TransportError::Rejected("session limit reached".to_string()));
        }

        self.broker.record(|stats| stats.open_sessions += 1);
        Ok(Box::new(MockSession {
            broker: self.broker.clone(),
            transacted,
            next_endpoint: 0,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            pending_sends: Vec::new(),
            unacknowledged: Vec::new(),
            closed: false,
        }))
    }

    async fn stop(&mut self) -> TransportResult<()> {
        self.broker.record(|_| {});
        self.started = false;
        Ok(())
    }

    async fn close(&mut self, timeout: Duration) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.broker.record(|stats| stats.open_connections -= 1);
        if self.broker.faults().fail_connection_close {
            return Err(TransportError::Other(format!(
                "close handshake not answered within {:?}",
                timeout
            )));
        }
        debug!("Mock connection closed");
        Ok(())
    }
}

pub struct MockSession {
    broker: MockBroker,
    transacted: bool,
    next_endpoint: u64,
    producers: HashMap<EndpointId, String>,
    consumers: HashMap<EndpointId, String>,
    pending_sends: Vec<(String, Vec<u8>)>,
    unacknowledged: Vec<(String, Vec<u8>)>,
    closed: bool,
}

impl MockSession {
    fn allocate(&mut self) -> EndpointId {
        self.next_endpoint += 1;
        EndpointId(self.next_endpoint)
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed("session is closed".to_string()));
        }
        Ok(())
    }

    fn check_destination(&self, destination: &str) -> TransportResult<()> {
        if self
            .broker
            .faults()
            .invalid_destinations
            .iter()
            .any(|name| name == destination)
        {
            return Err(TransportError::InvalidDestination(format!(
                "broker does not accept '{}'",
                destination
            )));
        }
        Ok(())
    }

    fn check_endpoint_close(&self) -> TransportResult<()> {
        if self.broker.faults().fail_endpoint_close {
            return Err(TransportError::Rejected("broker refused to detach the endpoint".to_string()));
        }
        Ok(())
    }

    fn discard_pending(&mut self) {
        self.pending_sends.clear();
        for (destination, bytes) in self.unacknowledged.drain(..).rev() {
            self.broker.requeue_front(&destination, bytes);
        }
        self.broker.inner.arrivals.notify_waiters();
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn create_producer(
        &mut self,
        destination: &str,
        _options: &DestinationOptions,
    ) -> TransportResult<EndpointId> {
        self.broker.record(|_| {});
        self.ensure_open()?;
        self.check_destination(destination)?;

        let id = self.allocate();
        self.producers.insert(id, destination.to_string());
        self.broker.record(|stats| stats.open_producers += 1);
        Ok(id)
    }

    async fn create_consumer(
        &mut self,
        destination: &str,
        options: &DestinationOptions,
    ) -> TransportResult<EndpointId> {
        self.broker.record(|_| {});
        self.ensure_open()?;
        self.check_destination(destination)?;

        let id = self.allocate();
        self.consumers.insert(id, destination.to_string());
        self.broker.record(|stats| stats.open_consumers += 1);
        trace!(destination, prefetch = options.prefetch_count, "Mock consumer attached");
        Ok(id)
    }

    async fn send(&mut self, producer: EndpointId, frame: Frame) -> TransportResult<()> {
        self.broker.record(|_| {});
        self.ensure_open()?;
        let destination = self
            .producers
            .get(&producer)
            .cloned()
            .ok_or_else(|| TransportError::Closed(format!("producer {:?} is closed", producer)))?;
        if self.broker.faults().reject_sends {
            return Err(TransportError::Rejected(format!("'{}' refused the message", destination)));
        }

        let bytes = frame.encode()?;
        if self.transacted {
            self.pending_sends.push((destination, bytes));
        } else {
            self.broker.inject_raw(&destination, bytes);
        }
        Ok(())
    }

    async fn receive(&mut self, consumer: EndpointId) -> TransportResult<Frame> {
        self.broker.record(|_| {});
        self.ensure_open()?;
        let destination = self
            .consumers
            .get(&consumer)
            .cloned()
            .ok_or_else(|| TransportError::Closed(format!("consumer {:?} is closed", consumer)))?;

        loop {
            // Registered before the queue is checked so a commit in between is not missed
            let arrival = self.broker.inner.arrivals.notified();

            if let Some(bytes) = self.broker.dequeue(&destination) {
                // Held until commit even when it does not decode, so a
                // rollback puts it back
                let frame = Frame::decode(&bytes);
                if self.transacted {
                    self.unacknowledged.push((destination, bytes));
                }
                return frame;
            }

            arrival.await;
        }
    }

    async fn commit(&mut self) -> TransportResult<()> {
        self.broker.record(|stats| stats.commits += 1);
        self.ensure_open()?;
        for (destination, bytes) in self.pending_sends.drain(..) {
            self.broker.enqueue(&destination, bytes);
        }
        self.unacknowledged.clear();
        self.broker.inner.arrivals.notify_waiters();
        Ok(())
    }

    async fn rollback(&mut self) -> TransportResult<()> {
        self.broker.record(|stats| stats.rollbacks += 1);
        self.ensure_open()?;
        if self.broker.faults().fail_rollback {
            return Err(TransportError::Rejected("broker refused the rollback".to_string()));
        }
        self.discard_pending();
        Ok(())
    }

    async fn close_producer(&mut self, producer: EndpointId) -> TransportResult<()> {
        self.broker.record(|_| {});
        self.check_endpoint_close()?;
        if self.producers.remove(&producer).is_some() {
            self.broker.record(|stats| stats.open_producers -= 1);
        }
        Ok(())
    }

    async fn close_consumer(&mut self, consumer: EndpointId) -> TransportResult<()> {
        self.broker.record(|_| {});
        self.check_endpoint_close()?;
        if self.consumers.remove(&consumer).is_some() {
            self.broker.record(|stats| stats.open_consumers -= 1);
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.broker.record(|_| {});
        if self.closed {
            return Ok(());
        }
        self.discard_pending();

        let producers = self.producers.drain().count();
        let consumers = self.consumers.drain().count();
        self.closed = true;
        self.broker.record(|stats| {
            stats.open_producers -= producers;
            stats.open_consumers -= consumers;
            stats.open_sessions -= 1;
        });
        Ok(())
    }
}
