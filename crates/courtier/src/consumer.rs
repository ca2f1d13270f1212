//! Execution backends pulling work from the broker.
//!
//! A consumer owns its worker threads. Every worker runs the same loop: pull
//! a raw item with a short deadline, run `process()`, return the item. A
//! failing payload is logged and returned unevaluated; nothing escapes the
//! worker loop.

use crate::broker::{Broker, BrokerError, PutError};
use crate::item::Processable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline used by the worker loop for both `get` and `put`, so a stop
/// request is observed promptly.
const LOOP_TIMEOUT: Duration = Duration::from_millis(200);

/// The (possibly estimated) number of concurrent processing units of a
/// consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyEstimate {
    /// 0 means "unknown".
    pub units: usize,
    pub exact: bool,
}

/// Capability contract of an execution backend.
pub trait Consumer<T>: Send {
    /// Spawns the internal workers and begins pulling from the broker.
    fn async_start_processing(&mut self);

    /// Requests a stop and blocks until all internal workers have joined.
    /// Any in-flight item is either returned or explicitly abandoned.
    fn shutdown(&mut self);

    /// True iff every accepted item will either be returned or explicitly
    /// reported lost.
    fn capable_of_full_return(&self) -> bool;

    /// Concurrency hint used by producers to size generations.
    fn concurrency_estimate(&self) -> ConcurrencyEstimate;

    /// A unique identifier for this consumer, used in logs.
    fn name(&self) -> &str;

    /// A short identifier, used for CLI selection.
    fn mnemonic(&self) -> &str;

    /// True iff this consumer requires external client processes.
    fn needs_client(&self) -> bool {
        false
    }
}

/// The shared worker loop: get, process, put, until stopped.
pub(crate) fn worker_loop<T: Processable>(broker: &Broker<T>, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let mut item = match broker.get(LOOP_TIMEOUT) {
            Ok(item) => item,
            Err(BrokerError::Timeout) => continue,
            Err(BrokerError::ShutDown) => break,
        };

        if let Err(e) = item.process() {
            warn!(fingerprint = ?item.fingerprint(), error = %e,
                "payload processing failed; returning item unevaluated");
        }

        // Items can get lost here: if we are asked to stop while the
        // destination stays full, the item is abandoned.
        let mut pending = item;
        loop {
            match broker.put(pending, LOOP_TIMEOUT) {
                Ok(()) => break,
                Err(PutError::Timeout(item)) => {
                    if stop.load(Ordering::Acquire) {
                        broker.discard(item);
                        break;
                    }
                    pending = item;
                }
                Err(PutError::ShutDown(item)) => {
                    drop(item);
                    return;
                }
            }
        }
    }
}

/// A consumer processing items one at a time in a single worker thread.
pub struct SerialConsumer<T> {
    broker: Broker<T>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Processable> SerialConsumer<T> {
    pub fn new(broker: Broker<T>) -> Self {
        Self {
            broker,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl<T: Processable> Consumer<T> for SerialConsumer<T> {
    fn async_start_processing(&mut self) {
        let broker = self.broker.clone();
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("courtier-serial".into())
            .spawn(move || worker_loop(&broker, &stop))
            .expect("failed to spawn serial worker thread");
        self.worker = Some(handle);
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        debug!("serial consumer shut down");
    }

    fn capable_of_full_return(&self) -> bool {
        true
    }

    fn concurrency_estimate(&self) -> ConcurrencyEstimate {
        ConcurrencyEstimate {
            units: 1,
            exact: true,
        }
    }

    fn name(&self) -> &str {
        "SerialConsumer"
    }

    fn mnemonic(&self) -> &str {
        "sc"
    }
}

/// A consumer running the worker loop on N threads.
pub struct ThreadedConsumer<T> {
    broker: Broker<T>,
    n_threads: usize,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Processable> ThreadedConsumer<T> {
    /// Creates a consumer with one worker per available hardware thread.
    pub fn new(broker: Broker<T>) -> Self {
        let n_threads = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::with_threads(broker, n_threads)
    }

    /// Creates a consumer with an explicit worker count (minimum 1).
    pub fn with_threads(broker: Broker<T>, n_threads: usize) -> Self {
        Self {
            broker,
            n_threads: n_threads.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }
}

impl<T: Processable> Consumer<T> for ThreadedConsumer<T> {
    fn async_start_processing(&mut self) {
        for i in 0..self.n_threads {
            let broker = self.broker.clone();
            let stop = Arc::clone(&self.stop);
            let handle = thread::Builder::new()
                .name(format!("courtier-worker-{i}"))
                .spawn(move || worker_loop(&broker, &stop))
                .expect("failed to spawn worker thread");
            self.workers.push(handle);
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!(workers = self.n_threads, "threaded consumer shut down");
    }

    fn capable_of_full_return(&self) -> bool {
        true
    }

    fn concurrency_estimate(&self) -> ConcurrencyEstimate {
        ConcurrencyEstimate {
            units: self.n_threads,
            exact: true,
        }
    }

    fn name(&self) -> &str {
        "ThreadedConsumer"
    }

    fn mnemonic(&self) -> &str {
        "tc"
    }
}
