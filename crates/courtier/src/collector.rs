//! The producer-side barrier: ships one generation of work items through the
//! broker and reassembles the results.
//!
//! The collector measures the time until the first current-generation item
//! returns and then waits `wait_factor` times that long for the rest. Late
//! arrivals from earlier generations are kept separately and never count
//! toward completion. Missing slots are repaired by resubmission and, as a
//! last resort, by cloning a surviving result.

use crate::broker::{Broker, BrokerError};
use crate::buffer::{PopTimeout, DEFAULT_BUFFER_CAPACITY};
use crate::item::{Command, Fingerprint, WorkItem};
use crate::port::{BufferPort, PortId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

static NEXT_PRODUCER_ID: AtomicU64 = AtomicU64::new(1);

/// Error types for the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CollectorError {
    /// Not a single current-generation item returned within the configured
    /// deadline. Fatal: the deployment has no working consumer.
    #[error("no current-generation item returned within {timeout:?} (generation {generation})")]
    FirstReturnTimeout { generation: u32, timeout: Duration },
    /// The broker rejected the collector's port at enrollment.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Collector tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    /// Deadline for the first current-generation return. `None` means no
    /// timeout and is only sound when the deployment guarantees at least one
    /// worker.
    pub first_item_timeout: Option<Duration>,
    /// Multiplier on the first-return latency for the overall generation
    /// deadline. 0 disables the overall deadline.
    pub wait_factor: u32,
    /// Resubmission rounds before missing slots are repaired by cloning.
    pub max_resubmissions: usize,
    /// Deadline of each individual pop on the processed-in buffer; bounds the
    /// latency of cancellation checks.
    pub poll_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            first_item_timeout: None,
            wait_factor: 2,
            max_resubmissions: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Cloneable handle for cancelling the generation currently being collected.
///
/// The flag is observed at every wait tick; the collector then stops
/// accepting returns, abandons outstanding fingerprints to the broker's
/// stale sweeper and returns an empty, cancelled generation. The flag is
/// cleared when the next generation starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One reassembled slot of a generation.
#[derive(Debug, Clone)]
pub struct GenerationSlot<T> {
    pub payload: T,
    /// The slot index the driver uses to place the result.
    pub position: u32,
    /// True iff the payload was actually processed without error.
    pub evaluated: bool,
    /// True iff this slot was filled by repair instead of a real return.
    pub synthetic: bool,
}

/// Wait statistics of one collected generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationStats {
    /// Current-generation items actually returned.
    pub received_current: usize,
    /// Late arrivals from earlier generations.
    pub received_stale: usize,
    /// Slots resubmitted during repair.
    pub resubmitted: usize,
    /// Slots filled by cloning.
    pub synthetic: usize,
    /// Current-generation returns for an already-filled position.
    pub duplicates_dropped: usize,
    /// Unclamped latency of the first current-generation return.
    pub first_return_latency: Option<Duration>,
    /// Total wall-clock time spent collecting.
    pub elapsed: Duration,
}

/// A fully reassembled generation, handed back to the algorithm driver.
#[derive(Debug)]
pub struct Generation<T> {
    /// The generation number the items were submitted under.
    pub number: u32,
    /// Exactly as many slots as were submitted, ordered by position — unless
    /// the generation was cancelled, in which case this is empty.
    pub slots: Vec<GenerationSlot<T>>,
    /// Late arrivals from earlier generations, in arrival order.
    pub stale: Vec<WorkItem<T>>,
    /// True iff collection was cancelled.
    pub cancelled: bool,
    pub stats: GenerationStats,
}

/// Bookkeeping for the returns of one generation.
struct Intake<T> {
    generation: u32,
    slots: BTreeMap<u32, GenerationSlot<T>>,
    stale: Vec<WorkItem<T>>,
    received_current: usize,
    duplicates_dropped: usize,
}

impl<T> Intake<T> {
    fn new(generation: u32) -> Self {
        Self {
            generation,
            slots: BTreeMap::new(),
            stale: Vec::new(),
            received_current: 0,
            duplicates_dropped: 0,
        }
    }

    /// Sorts one arrival. Returns `true` iff it filled a new
    /// current-generation slot.
    fn accept(&mut self, item: WorkItem<T>) -> bool {
        let Some(fingerprint) = item.fingerprint() else {
            // Unstamped items cannot be attributed to a slot.
            self.duplicates_dropped += 1;
            return false;
        };
        if fingerprint.generation != self.generation {
            self.stale.push(item);
            return false;
        }
        if self.slots.contains_key(&fingerprint.position) {
            // A resubmission raced the original evaluation.
            self.duplicates_dropped += 1;
            return false;
        }
        let evaluated = item.is_evaluated();
        self.slots.insert(
            fingerprint.position,
            GenerationSlot {
                payload: item.into_payload(),
                position: fingerprint.position,
                evaluated,
                synthetic: false,
            },
        );
        self.received_current += 1;
        true
    }

    fn missing_positions(&self, expected: usize) -> Vec<u32> {
        (0..expected as u32)
            .filter(|position| !self.slots.contains_key(position))
            .collect()
    }
}

enum DrainExit {
    Complete,
    Deadline,
    Cancelled,
}

/// Ships generations of work items through the broker for one producer
/// session.
///
/// Owns the session's [`BufferPort`] and the producer identity; fingerprints
/// are stamped here, exactly once per submission.
pub struct GenerationCollector<T> {
    port: BufferPort<T>,
    producer_id: u64,
    next_submission: u64,
    config: CollectorConfig,
    cancel: CancelFlag,
}

impl<T: Send + 'static> GenerationCollector<T> {
    /// Creates a collector with a default-capacity port and enrolls it.
    pub fn new(broker: &Broker<T>, config: CollectorConfig) -> Result<Self, CollectorError> {
        Self::with_capacity(broker, config, DEFAULT_BUFFER_CAPACITY)
    }

    /// Creates a collector with a custom port capacity and enrolls it.
    pub fn with_capacity(
        broker: &Broker<T>,
        config: CollectorConfig,
        capacity: usize,
    ) -> Result<Self, CollectorError> {
        let port = BufferPort::with_capacity(capacity);
        broker.enroll_port(&port)?;
        Ok(Self {
            port,
            producer_id: NEXT_PRODUCER_ID.fetch_add(1, Ordering::Relaxed),
            next_submission: 0,
            config,
            cancel: CancelFlag::default(),
        })
    }

    /// The id of the session's buffer port.
    pub fn port_id(&self) -> PortId {
        self.port.id()
    }

    /// The globally unique producer id stamped into every fingerprint.
    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    /// A handle for cancelling the generation currently being collected.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn submit(&mut self, payload: T, command: Command, generation: u32, position: u32) {
        self.next_submission += 1;
        let mut item = WorkItem::new(payload, command);
        item.stamp(Fingerprint {
            producer: self.producer_id,
            submission: self.next_submission,
            generation,
            position,
        });
        // Blocks naturally while the outbound buffer is full.
        self.port.submit(item);
    }

    fn drain_until(&self, intake: &mut Intake<T>, expected: usize, deadline: Option<Instant>) -> DrainExit {
        loop {
            if intake.slots.len() >= expected {
                return DrainExit::Complete;
            }
            if self.cancel.is_cancelled() {
                return DrainExit::Cancelled;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return DrainExit::Deadline;
                }
            }
            match self.port.receive_timeout(self.config.poll_interval) {
                Ok(item) => {
                    intake.accept(item);
                }
                Err(PopTimeout) => {}
            }
        }
    }

    fn cancelled_generation(&self, number: u32, intake: Intake<T>, t0: Instant) -> Generation<T> {
        warn!(generation = number, "generation cancelled; abandoning outstanding items");
        let received_stale = intake.stale.len();
        Generation {
            number,
            slots: Vec::new(),
            stale: intake.stale,
            cancelled: true,
            stats: GenerationStats {
                received_current: intake.received_current,
                received_stale,
                elapsed: t0.elapsed(),
                ..GenerationStats::default()
            },
        }
    }

    /// Ships `payloads` as one generation and blocks until the generation is
    /// complete, the adaptive deadline has passed and repair is done, or the
    /// session is cancelled.
    ///
    /// The result always holds exactly `payloads.len()` position-ordered
    /// slots (unless cancelled); slots that had to be repaired are marked
    /// synthetic.
    pub fn run_generation(
        &mut self,
        generation: u32,
        command: Command,
        payloads: Vec<T>,
    ) -> Result<Generation<T>, CollectorError>
    where
        T: Clone,
    {
        self.cancel.clear();
        let expected = payloads.len();
        let t0 = Instant::now();
        let mut intake = Intake::new(generation);

        if expected == 0 {
            return Ok(Generation {
                number: generation,
                slots: Vec::new(),
                stale: Vec::new(),
                cancelled: false,
                stats: GenerationStats::default(),
            });
        }

        // Keep a pristine copy of every payload for resubmission and
        // worst-case repair.
        let mut originals: HashMap<u32, T> = HashMap::with_capacity(expected);
        for (position, payload) in payloads.into_iter().enumerate() {
            let position = position as u32;
            originals.insert(position, payload.clone());
            self.submit(payload, command, generation, position);
        }

        // Wait for the first current-generation return; stale arrivals are
        // collected but do not end the wait.
        let first_latency_raw = loop {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled_generation(generation, intake, t0));
            }
            match self.port.receive_timeout(self.config.poll_interval) {
                Ok(item) => {
                    if intake.accept(item) {
                        break t0.elapsed();
                    }
                }
                Err(PopTimeout) => {}
            }
            if let Some(limit) = self.config.first_item_timeout {
                if t0.elapsed() >= limit {
                    return Err(CollectorError::FirstReturnTimeout {
                        generation,
                        timeout: limit,
                    });
                }
            }
        };
        // The adaptive deadline is computed from a floor of one second so a
        // very fast first return does not starve the rest of the generation.
        let first_latency = first_latency_raw.max(Duration::from_secs(1));

        let overall_deadline =
            (self.config.wait_factor > 0).then(|| t0 + first_latency * self.config.wait_factor);
        match self.drain_until(&mut intake, expected, overall_deadline) {
            DrainExit::Cancelled => {
                return Ok(self.cancelled_generation(generation, intake, t0));
            }
            DrainExit::Complete => {}
            DrainExit::Deadline => {
                warn!(
                    generation,
                    received_current = intake.received_current,
                    received_stale = intake.stale.len(),
                    expected,
                    "overall deadline reached with missing returns"
                );
            }
        }

        // Repair phase one: resubmit missing slots under fresh submission
        // ids, re-running the adaptive wait each round.
        let mut resubmitted = 0usize;
        let mut round = 0usize;
        while intake.slots.len() < expected && round < self.config.max_resubmissions {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled_generation(generation, intake, t0));
            }
            round += 1;
            let missing = intake.missing_positions(expected);
            debug!(generation, round, missing = missing.len(), "resubmitting missing slots");
            for position in &missing {
                let Some(payload) = originals.get(position).cloned() else {
                    continue;
                };
                self.submit(payload, command, generation, *position);
                resubmitted += 1;
            }
            let factor = self.config.wait_factor.max(1);
            let round_deadline = Instant::now() + first_latency * factor;
            if let DrainExit::Cancelled =
                self.drain_until(&mut intake, expected, Some(round_deadline))
            {
                return Ok(self.cancelled_generation(generation, intake, t0));
            }
        }

        // Repair phase two: fill what is still missing with clones of the
        // earliest evaluated survivor, falling back to the submitted payload.
        let mut synthetic = 0usize;
        if intake.slots.len() < expected {
            let source: Option<T> = intake
                .slots
                .values()
                .find(|slot| slot.evaluated)
                .map(|slot| slot.payload.clone());
            for position in intake.missing_positions(expected) {
                let (payload, evaluated) = match &source {
                    Some(payload) => (payload.clone(), true),
                    None => {
                        let Some(payload) = originals.get(&position).cloned() else {
                            continue;
                        };
                        (payload, false)
                    }
                };
                intake.slots.insert(
                    position,
                    GenerationSlot {
                        payload,
                        position,
                        evaluated,
                        synthetic: true,
                    },
                );
                synthetic += 1;
            }
            warn!(generation, synthetic, "filled missing slots with clones");
        }

        let received_stale = intake.stale.len();
        Ok(Generation {
            number: generation,
            slots: intake.slots.into_values().collect(),
            stale: intake.stale,
            cancelled: false,
            stats: GenerationStats {
                received_current: intake.received_current,
                received_stale,
                resubmitted,
                synthetic,
                duplicates_dropped: intake.duplicates_dropped,
                first_return_latency: Some(first_latency_raw),
                elapsed: t0.elapsed(),
            },
        })
    }
}
