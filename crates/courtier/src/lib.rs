//! Courtier - Work Distribution for Population-Based Optimization
//!
//! This crate decouples optimization algorithms (producers of candidate
//! solutions) from heterogeneous execution backends (serial, multi-threaded,
//! networked) while preserving per-generation barrier semantics. It
//! tolerates partial worker failure, lost submissions, late arrivals from
//! prior generations and client disconnects, and bounds memory through
//! capacity-limited blocking queues.
//!
//! # Architecture
//!
//! - [`BoundedBuffer`] is the single blocking primitive for every hop.
//! - A producer session owns a [`BufferPort`]: one raw-out and one
//!   processed-in buffer, enrolled with the [`Broker`].
//! - The [`Broker`] matches raw items to pulling [`Consumer`]s round-robin
//!   and routes results back to the originating port by [`Fingerprint`].
//! - The [`GenerationCollector`] ships a whole generation, waits with an
//!   adaptive deadline and repairs gaps by resubmission or cloning.
//!
//! # Example
//!
//! ```no_run
//! use courtier::{
//!     Broker, Command, CollectorConfig, GenerationCollector, Processable,
//!     ProcessingError, SerialConsumer,
//! };
//!
//! #[derive(Clone)]
//! struct Candidate(f64);
//!
//! impl Processable for Candidate {
//!     fn process(&mut self, _command: Command) -> Result<(), ProcessingError> {
//!         self.0 *= 2.0;
//!         Ok(())
//!     }
//! }
//!
//! let broker = Broker::with_defaults();
//! broker
//!     .enroll_consumer(Box::new(SerialConsumer::new(broker.clone())))
//!     .unwrap();
//!
//! let mut collector = GenerationCollector::new(&broker, CollectorConfig::default()).unwrap();
//! let generation = collector
//!     .run_generation(0, Command::Evaluate, vec![Candidate(1.0), Candidate(2.0)])
//!     .unwrap();
//! assert_eq!(generation.slots.len(), 2);
//! broker.shutdown();
//! ```

pub mod barrier;
pub mod broker;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod consumer;
pub mod item;
pub mod metrics;
pub mod port;
pub mod random;
pub mod serialization;

pub use barrier::Barrier;
pub use broker::{global, init_global, teardown_global, Broker, BrokerConfig, BrokerError, PutError};
pub use buffer::{BoundedBuffer, PopTimeout, PushTimeout, DEFAULT_BUFFER_CAPACITY};
pub use collector::{
    CancelFlag, CollectorConfig, CollectorError, Generation, GenerationCollector, GenerationSlot,
    GenerationStats,
};
pub use config::{Config, ConfigError};
pub use consumer::{ConcurrencyEstimate, Consumer, SerialConsumer, ThreadedConsumer};
pub use item::{Command, Fingerprint, Processable, ProcessingError, WorkItem};
pub use metrics::BrokerMetrics;
pub use port::{BufferPort, PortId};
pub use random::{
    global_factory, init_global_factory, terminate_global_factory, with_thread_source,
    RandomFactory, RandomFactoryConfig, RandomSource,
};
pub use serialization::{from_bytes, to_bytes, SerializationError, SerializationMode};
