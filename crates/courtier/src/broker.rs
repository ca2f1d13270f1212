//! The broker: a process-wide multiplexer routing work items between many
//! producer ports and many consumers.
//!
//! Consumers pull raw items with [`Broker::get`], which walks the enrolled
//! ports round-robin, and hand results back with [`Broker::put`], which
//! routes by fingerprint. The broker never owns items in flight; the only
//! cross-port shared state is the routing index mapping each checked-out
//! fingerprint to its originating port. A background sweeper purges routing
//! entries whose items never came back (crashed consumers, dead clients).

use crate::buffer::{BoundedBuffer, PushTimeout};
use crate::consumer::Consumer;
use crate::item::{Fingerprint, WorkItem};
use crate::metrics::BrokerMetrics;
use crate::port::{BufferPort, PortId};
use crossbeam_utils::Backoff;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Error types for broker operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// No item became available before the deadline. Expected control flow;
    /// consumer loops simply try again.
    #[error("no item became available before the deadline")]
    Timeout,
    /// The broker has been shut down; all subsequent operations fail.
    #[error("broker has been shut down")]
    ShutDown,
}

/// Error returned by [`Broker::put`]. Both variants hand the item back so the
/// caller decides whether to retry or abandon.
pub enum PutError<T> {
    /// The destination buffer stayed full for the whole deadline. The routing
    /// entry is kept; the caller may retry.
    Timeout(WorkItem<T>),
    /// The broker has been shut down.
    ShutDown(WorkItem<T>),
}

impl<T> fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(_) => f.write_str("PutError::Timeout(..)"),
            Self::ShutDown(_) => f.write_str("PutError::ShutDown(..)"),
        }
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(_) => f.write_str("destination buffer stayed full for the whole deadline"),
            Self::ShutDown(_) => f.write_str("broker has been shut down"),
        }
    }
}

impl<T> std::error::Error for PutError<T> {}

/// Broker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// How often the stale sweeper wakes up.
    pub stale_sweep_interval: Duration,
    /// Age at which a routing entry is considered lost and purged.
    pub stale_threshold: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stale_sweep_interval: Duration::from_millis(1000),
            stale_threshold: Duration::from_millis(60_000),
        }
    }
}

#[derive(Clone, Copy)]
struct Route {
    port_id: PortId,
    checked_out_at: Instant,
}

struct PortEntry<T> {
    port_id: PortId,
    raw: Weak<BoundedBuffer<WorkItem<T>>>,
    processed: Weak<BoundedBuffer<WorkItem<T>>>,
}

struct BrokerInner<T> {
    /// Enrolled ports, held weakly: a dropped port is pruned, not dangled.
    ports: RwLock<Vec<PortEntry<T>>>,
    /// Round-robin start offset for `get`.
    cursor: AtomicUsize,
    /// fingerprint -> originating port, for items currently in flight.
    routing: Mutex<HashMap<Fingerprint, Route>>,
    consumers: Mutex<Vec<Box<dyn Consumer<T>>>>,
    metrics: BrokerMetrics,
    stop: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    config: BrokerConfig,
}

impl<T> BrokerInner<T> {
    fn routing_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, Route>> {
        self.routing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep_stale(&self) {
        let threshold = self.config.stale_threshold;
        let now = Instant::now();
        let mut purged = Vec::new();
        {
            let mut routing = self.routing_lock();
            routing.retain(|fingerprint, route| {
                if now.duration_since(route.checked_out_at) >= threshold {
                    purged.push((*fingerprint, route.port_id));
                    false
                } else {
                    true
                }
            });
        }
        for (fingerprint, port_id) in purged {
            self.metrics.record_stale();
            warn!(%fingerprint, port_id, "purged stale routing entry; item considered lost");
        }
    }

    fn prune_ports(&self) {
        self.ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.raw.upgrade().is_some());
    }
}

fn sweeper_loop<T>(inner: Weak<BrokerInner<T>>, interval: Duration) {
    // Sleep in short slices so shutdown does not have to ride out a full
    // sweep interval.
    let tick = Duration::from_millis(50).min(interval);
    let mut since_sweep = Duration::ZERO;
    loop {
        thread::sleep(tick);
        let Some(inner) = inner.upgrade() else { break };
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        since_sweep += tick;
        if since_sweep >= interval {
            since_sweep = Duration::ZERO;
            inner.sweep_stale();
            inner.prune_ports();
        }
    }
}

/// A cheap, cloneable handle to one broker instance.
///
/// Usually obtained through [`global`] (one broker per payload type per
/// process), but free-standing instances are fully supported and what the
/// test-suite uses.
pub struct Broker<T> {
    inner: Arc<BrokerInner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Broker<T> {
    /// Creates a broker and starts its stale sweeper.
    pub fn new(config: BrokerConfig) -> Self {
        let inner = Arc::new(BrokerInner {
            ports: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            routing: Mutex::new(HashMap::new()),
            consumers: Mutex::new(Vec::new()),
            metrics: BrokerMetrics::default(),
            stop: AtomicBool::new(false),
            sweeper: Mutex::new(None),
            config,
        });

        let weak = Arc::downgrade(&inner);
        let interval = config.stale_sweep_interval;
        let handle = thread::Builder::new()
            .name("courtier-sweeper".into())
            .spawn(move || sweeper_loop(weak, interval))
            .expect("failed to spawn stale sweeper thread");
        *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self { inner }
    }

    /// Creates a broker with default tuning.
    pub fn with_defaults() -> Self {
        Self::new(BrokerConfig::default())
    }

    /// Adds a port to the active set; its raw-out buffer becomes eligible
    /// for matching. Dead entries from previous sessions are pruned on the
    /// way.
    pub fn enroll_port(&self, port: &BufferPort<T>) -> Result<(), BrokerError> {
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(BrokerError::ShutDown);
        }
        let mut ports = self
            .inner
            .ports
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        ports.retain(|entry| entry.raw.upgrade().is_some());
        ports.push(PortEntry {
            port_id: port.id(),
            raw: Arc::downgrade(&port.raw_handle()),
            processed: Arc::downgrade(&port.processed_handle()),
        });
        debug!(port_id = port.id(), "port enrolled");
        Ok(())
    }

    /// Takes ownership of a consumer and starts it.
    pub fn enroll_consumer(&self, mut consumer: Box<dyn Consumer<T>>) -> Result<(), BrokerError> {
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(BrokerError::ShutDown);
        }
        consumer.async_start_processing();
        debug!(name = consumer.name(), "consumer enrolled");
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(consumer);
        Ok(())
    }

    /// Whether any consumer has been enrolled.
    pub fn has_consumers(&self) -> bool {
        !self
            .inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Whether the first enrolled consumer requires external client
    /// processes.
    pub fn needs_client(&self) -> bool {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .is_some_and(|c| c.needs_client())
    }

    /// Pulls the next raw item across all enrolled ports, round-robin.
    ///
    /// The checked-out item's fingerprint is recorded in the routing index so
    /// [`put`](Self::put) can find its way home.
    pub fn get(&self, timeout: Duration) -> Result<WorkItem<T>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if self.inner.stop.load(Ordering::Acquire) {
                return Err(BrokerError::ShutDown);
            }
            if let Some(item) = self.try_pop_any() {
                return Ok(item);
            }
            if Instant::now() >= deadline {
                return Err(BrokerError::Timeout);
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    fn try_pop_any(&self) -> Option<WorkItem<T>> {
        let ports = self
            .inner
            .ports
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let n = ports.len();
        if n == 0 {
            return None;
        }
        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for k in 0..n {
            let entry = &ports[(start + k) % n];
            let Some(raw) = entry.raw.upgrade() else {
                continue;
            };
            // Zero deadline: skip empty raw-out queues quickly.
            let Ok(item) = raw.pop_back_timeout(Duration::ZERO) else {
                continue;
            };
            match item.fingerprint() {
                Some(fingerprint) => {
                    self.inner.routing_lock().insert(
                        fingerprint,
                        Route {
                            port_id: entry.port_id,
                            checked_out_at: Instant::now(),
                        },
                    );
                }
                None => {
                    // Submitting an unstamped item violates the producer
                    // contract; the item can still be processed but will
                    // never find its way back.
                    warn!(port_id = entry.port_id, "checked out an unstamped work item");
                }
            }
            self.inner.metrics.record_dispatched();
            return Some(item);
        }
        None
    }

    /// Returns a processed item to the port it came from.
    ///
    /// Unroutable items — unknown fingerprint (already delivered or swept) or
    /// a port that went away — are dropped and counted; that is not an error
    /// for the caller. A full destination buffer hands the item back as
    /// [`PutError::Timeout`] so the worker loop can retry while it is alive.
    pub fn put(&self, item: WorkItem<T>, timeout: Duration) -> Result<(), PutError<T>> {
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(PutError::ShutDown(item));
        }
        let Some(fingerprint) = item.fingerprint() else {
            self.inner.metrics.record_orphaned();
            warn!("dropping returned item without a fingerprint");
            return Ok(());
        };

        let route = self.inner.routing_lock().get(&fingerprint).copied();
        let Some(route) = route else {
            // Already delivered once (resubmission race) or swept as stale.
            self.inner.metrics.record_duplicate();
            debug!(%fingerprint, "dropping unroutable return");
            return Ok(());
        };

        let processed = {
            let ports = self
                .inner
                .ports
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            ports
                .iter()
                .find(|entry| entry.port_id == route.port_id)
                .and_then(|entry| entry.processed.upgrade())
        };
        let Some(processed) = processed else {
            // The producer gave up on this session.
            self.inner.routing_lock().remove(&fingerprint);
            self.inner.metrics.record_orphaned();
            warn!(%fingerprint, port_id = route.port_id, "destination port gone; dropping item");
            return Ok(());
        };

        match processed.push_front_timeout(item, timeout) {
            Ok(()) => {
                self.inner.routing_lock().remove(&fingerprint);
                self.inner.metrics.record_returned();
                Ok(())
            }
            Err(PushTimeout(item)) => Err(PutError::Timeout(item)),
        }
    }

    /// Explicitly abandons an item a consumer will not return, releasing its
    /// routing entry immediately instead of waiting for the sweeper.
    pub fn discard(&self, item: WorkItem<T>) {
        if let Some(fingerprint) = item.fingerprint() {
            self.inner.routing_lock().remove(&fingerprint);
        }
        self.inner.metrics.record_abandoned();
    }

    /// Number of items currently checked out to consumers.
    pub fn in_flight(&self) -> usize {
        self.inner.routing_lock().len()
    }

    /// Traffic and loss counters.
    pub fn metrics(&self) -> &BrokerMetrics {
        &self.inner.metrics
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    /// Shuts the broker down: consumers are stopped and joined, the sweeper
    /// exits, ports are released. Idempotent; subsequent operations return
    /// [`BrokerError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut consumers = self
                .inner
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for consumer in consumers.iter_mut() {
                consumer.shutdown();
            }
            consumers.clear();
        }
        if let Some(handle) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        self.inner.routing_lock().clear();
        self.inner
            .ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("broker shut down");
    }
}

// ---------------------------------------------------------------------------
// Process-wide instances, one per payload type.
// ---------------------------------------------------------------------------

type Registry = Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>;

static GLOBAL_BROKERS: OnceLock<Registry> = OnceLock::new();

/// The process-wide broker for payload type `T`, constructed with default
/// tuning on first access.
pub fn global<T: Send + 'static>() -> Broker<T> {
    init_global(BrokerConfig::default())
}

/// The process-wide broker for payload type `T`, constructed with `config`
/// if this is the first access. A later call cannot re-tune an existing
/// instance; the original one is returned.
pub fn init_global<T: Send + 'static>(config: BrokerConfig) -> Broker<T> {
    let registry = GLOBAL_BROKERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap_or_else(PoisonError::into_inner);
    map.entry(TypeId::of::<T>())
        .or_insert_with(|| Box::new(Broker::<T>::new(config)))
        .downcast_ref::<Broker<T>>()
        .expect("broker registry entry has the wrong type")
        .clone()
}

/// Tears down the process-wide broker for payload type `T`: it is shut down
/// and removed from the registry. A later [`global`] call constructs a fresh
/// instance.
pub fn teardown_global<T: Send + 'static>() {
    let Some(registry) = GLOBAL_BROKERS.get() else {
        return;
    };
    let removed = registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&TypeId::of::<T>());
    if let Some(entry) = removed {
        if let Ok(broker) = entry.downcast::<Broker<T>>() {
            broker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Command;

    fn stamped(value: u64, position: u32) -> WorkItem<u64> {
        let mut item = WorkItem::new(value, Command::Noop);
        item.stamp(Fingerprint {
            producer: 1,
            submission: u64::from(position),
            generation: 0,
            position,
        });
        item
    }

    #[test]
    fn get_times_out_without_ports() {
        let broker = Broker::<u64>::with_defaults();
        assert_eq!(
            broker.get(Duration::from_millis(20)).unwrap_err(),
            BrokerError::Timeout
        );
        broker.shutdown();
    }

    #[test]
    fn checked_out_items_are_tracked_in_flight() {
        let broker = Broker::<u64>::with_defaults();
        let port = BufferPort::new();
        broker.enroll_port(&port).unwrap();

        port.submit(stamped(7, 0));
        let item = broker.get(Duration::from_millis(200)).unwrap();
        assert_eq!(broker.in_flight(), 1);

        broker.put(item, Duration::from_millis(200)).unwrap();
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(
            *port
                .receive_timeout(Duration::from_millis(100))
                .unwrap()
                .payload(),
            7
        );
        broker.shutdown();
    }

    #[test]
    fn dropped_port_turns_returns_into_orphans() {
        let broker = Broker::<u64>::with_defaults();
        let port = BufferPort::new();
        broker.enroll_port(&port).unwrap();

        port.submit(stamped(1, 0));
        let item = broker.get(Duration::from_millis(200)).unwrap();
        drop(port);

        broker.put(item, Duration::from_millis(50)).unwrap();
        assert_eq!(broker.metrics().orphaned_drops(), 1);
        assert_eq!(broker.in_flight(), 0);
        broker.shutdown();
    }

    #[test]
    fn operations_fail_after_shutdown() {
        let broker = Broker::<u64>::with_defaults();
        broker.shutdown();
        assert_eq!(
            broker.get(Duration::from_millis(1)).unwrap_err(),
            BrokerError::ShutDown
        );
        let port = BufferPort::new();
        assert_eq!(broker.enroll_port(&port), Err(BrokerError::ShutDown));
    }

    #[test]
    fn global_registry_hands_out_one_instance_per_type() {
        let a = global::<u64>();
        let b = global::<u64>();
        let port = BufferPort::new();
        a.enroll_port(&port).unwrap();
        port.submit(stamped(3, 0));
        // visible through the other handle
        assert!(b.get(Duration::from_millis(200)).is_ok());
        teardown_global::<u64>();
        assert!(a.is_shut_down());
    }
}
