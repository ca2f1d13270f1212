//! Collector scenarios: completeness under load, repair of lost returns and
//! cancellation.

use courtier::{
    Broker, BrokerError, Command, CollectorConfig, ConcurrencyEstimate, Consumer,
    GenerationCollector, Processable, ProcessingError, PutError, ThreadedConsumer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Counter {
    hits: u32,
}

impl Processable for Counter {
    fn process(&mut self, _command: Command) -> Result<(), ProcessingError> {
        self.hits += 1;
        Ok(())
    }
}

/// Ten thousand items through four workers: every slot comes back exactly
/// once, processed exactly once.
#[test]
fn threaded_race_is_exactly_once() {
    const ITEMS: usize = 10_000;

    let broker = Broker::with_defaults();
    broker
        .enroll_consumer(Box::new(ThreadedConsumer::with_threads(broker.clone(), 4)))
        .unwrap();

    let config = CollectorConfig {
        first_item_timeout: Some(Duration::from_secs(10)),
        wait_factor: 5,
        ..CollectorConfig::default()
    };
    let mut collector = GenerationCollector::new(&broker, config).unwrap();

    let start = Instant::now();
    let payloads = vec![Counter { hits: 0 }; ITEMS];
    let generation = collector
        .run_generation(0, Command::Evaluate, payloads)
        .unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "deadlock suspicion: took {:?}",
        start.elapsed()
    );

    assert_eq!(generation.slots.len(), ITEMS);
    assert_eq!(generation.stats.synthetic, 0);
    let total_hits: u32 = generation.slots.iter().map(|s| s.payload.hits).sum();
    assert_eq!(total_hits, ITEMS as u32);
    for (index, slot) in generation.slots.iter().enumerate() {
        assert_eq!(slot.position as usize, index, "position-ordered result");
        assert!(slot.evaluated);
        assert!(!slot.synthetic);
    }
    broker.shutdown();
}

/// A consumer that deliberately never returns items whose position is a
/// multiple of 20 (5% of every generation), abandoning them instead.
struct LossyConsumer {
    broker: Broker<Counter>,
    workers: usize,
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl LossyConsumer {
    fn new(broker: Broker<Counter>, workers: usize) -> Self {
        Self {
            broker,
            workers,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }
}

impl Consumer<Counter> for LossyConsumer {
    fn async_start_processing(&mut self) {
        for _ in 0..self.workers {
            let broker = self.broker.clone();
            let stop = Arc::clone(&self.stop);
            self.handles.push(thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let mut item = match broker.get(Duration::from_millis(100)) {
                        Ok(item) => item,
                        Err(BrokerError::Timeout) => continue,
                        Err(BrokerError::ShutDown) => break,
                    };
                    let _ = item.process();
                    let position = item.fingerprint().map_or(0, |f| f.position);
                    if position % 20 == 0 {
                        broker.discard(item);
                        continue;
                    }
                    let mut pending = item;
                    loop {
                        match broker.put(pending, Duration::from_millis(100)) {
                            Ok(()) => break,
                            Err(PutError::Timeout(item)) => pending = item,
                            Err(PutError::ShutDown(_)) => return,
                        }
                    }
                }
            }));
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn capable_of_full_return(&self) -> bool {
        false
    }

    fn concurrency_estimate(&self) -> ConcurrencyEstimate {
        ConcurrencyEstimate {
            units: self.workers,
            exact: true,
        }
    }

    fn name(&self) -> &str {
        "LossyConsumer"
    }

    fn mnemonic(&self) -> &str {
        "lc"
    }
}

/// One thousand items with 5% of returns lost: the collector still hands
/// back one thousand slots, the gaps repaired and marked synthetic.
#[test]
fn partial_return_is_repaired_with_synthetic_slots() {
    const ITEMS: usize = 1_000;
    const LOST: usize = ITEMS / 20;

    let broker = Broker::with_defaults();
    broker
        .enroll_consumer(Box::new(LossyConsumer::new(broker.clone(), 4)))
        .unwrap();

    let config = CollectorConfig {
        first_item_timeout: Some(Duration::from_secs(5)),
        wait_factor: 2,
        max_resubmissions: 1,
        ..CollectorConfig::default()
    };
    let mut collector = GenerationCollector::new(&broker, config).unwrap();

    let start = Instant::now();
    let payloads = vec![Counter { hits: 0 }; ITEMS];
    let generation = collector
        .run_generation(0, Command::Evaluate, payloads)
        .unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_secs(20), "took {elapsed:?}");
    assert_eq!(generation.slots.len(), ITEMS);
    let synthetic = generation.slots.iter().filter(|s| s.synthetic).count();
    assert_eq!(synthetic, LOST);
    assert_eq!(generation.stats.synthetic, LOST);
    assert_eq!(generation.stats.received_current, ITEMS - LOST);
    assert!(generation.stats.resubmitted >= LOST);
    broker.shutdown();
}

#[derive(Debug, Clone)]
struct Sleeper;

impl Processable for Sleeper {
    fn process(&mut self, _command: Command) -> Result<(), ProcessingError> {
        thread::sleep(Duration::from_secs(1));
        Ok(())
    }
}

/// Cancelling mid-wait returns an empty generation promptly, and shutdown
/// leaves no dangling threads.
#[test]
fn cancellation_returns_promptly() {
    let broker = Broker::with_defaults();
    broker
        .enroll_consumer(Box::new(ThreadedConsumer::with_threads(broker.clone(), 4)))
        .unwrap();

    let config = CollectorConfig {
        first_item_timeout: None,
        poll_interval: Duration::from_millis(100),
        ..CollectorConfig::default()
    };
    let mut collector = GenerationCollector::new(&broker, config).unwrap();
    let cancel = collector.cancel_handle();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        cancel.cancel();
    });

    let start = Instant::now();
    let generation = collector
        .run_generation(0, Command::Evaluate, vec![Sleeper; 100])
        .unwrap();
    let elapsed = start.elapsed();
    canceller.join().unwrap();

    assert!(generation.cancelled);
    assert!(generation.slots.is_empty());
    assert!(
        elapsed < Duration::from_millis(1500),
        "cancellation took {elapsed:?}"
    );

    let shutdown_start = Instant::now();
    broker.shutdown();
    assert!(
        shutdown_start.elapsed() < Duration::from_secs(5),
        "shutdown dragged: {:?}",
        shutdown_start.elapsed()
    );
}

/// A late return from a cancelled generation shows up as stale in the next
/// one instead of polluting its slots.
#[test]
fn late_returns_surface_as_stale_items() {
    let broker = Broker::with_defaults();
    broker
        .enroll_consumer(Box::new(ThreadedConsumer::with_threads(broker.clone(), 2)))
        .unwrap();

    let config = CollectorConfig {
        first_item_timeout: None,
        poll_interval: Duration::from_millis(50),
        ..CollectorConfig::default()
    };
    let mut collector = GenerationCollector::new(&broker, config).unwrap();
    let cancel = collector.cancel_handle();

    // Cancel generation 0 while its items are still being processed.
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
    });
    let generation = collector
        .run_generation(0, Command::Evaluate, vec![Sleeper; 2])
        .unwrap();
    canceller.join().unwrap();
    assert!(generation.cancelled);

    // Generation 1 completes normally; the stragglers from generation 0
    // arrive as stale.
    let generation = collector
        .run_generation(1, Command::Evaluate, vec![Sleeper; 2])
        .unwrap();
    assert!(!generation.cancelled);
    assert_eq!(generation.slots.len(), 2);
    assert!(generation
        .stale
        .iter()
        .all(|item| item.fingerprint().unwrap().generation == 0));
    broker.shutdown();
}
