//! The process-wide random-number factory.
//!
//! Producer threads fill a bounded buffer with fixed-size packages of
//! uniform doubles; the algorithm layer pops packages and draws numbers from
//! them. This keeps random-number generation off the optimization hot path
//! and exercises the same buffer primitive as the broker. The factory is
//! created lazily on first use and torn down explicitly on application exit.

use crate::buffer::{BoundedBuffer, PopTimeout, PushTimeout};
use rand::Rng;
use std::cell::RefCell;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Numbers per package.
pub const DEFAULT_PACKAGE_SIZE: usize = 1000;

/// Packages buffered ahead of consumption.
pub const DEFAULT_PACKAGE_BUFFER: usize = 100;

/// Tuning for the factory.
#[derive(Debug, Clone, Copy)]
pub struct RandomFactoryConfig {
    /// Number of filler threads.
    pub producer_threads: u16,
    /// Uniform doubles per package.
    pub package_size: usize,
    /// Capacity of the package buffer.
    pub buffer_capacity: usize,
}

impl Default for RandomFactoryConfig {
    fn default() -> Self {
        Self {
            producer_threads: 10,
            package_size: DEFAULT_PACKAGE_SIZE,
            buffer_capacity: DEFAULT_PACKAGE_BUFFER,
        }
    }
}

/// A service producing packages of uniform doubles in `[0, 1)`.
pub struct RandomFactory {
    buffer: Arc<BoundedBuffer<Vec<f64>>>,
    stop: Arc<AtomicBool>,
    producers: Mutex<Vec<JoinHandle<()>>>,
}

impl RandomFactory {
    /// Starts the filler threads.
    pub fn new(config: RandomFactoryConfig) -> Self {
        let buffer = Arc::new(BoundedBuffer::with_capacity(config.buffer_capacity.max(1)));
        let stop = Arc::new(AtomicBool::new(false));
        let package_size = config.package_size.max(1);

        let mut producers = Vec::new();
        for i in 0..config.producer_threads.max(1) {
            let buffer = Arc::clone(&buffer);
            let stop = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("random-filler-{i}"))
                .spawn(move || fill_loop(&buffer, &stop, package_size))
                .expect("failed to spawn random filler thread");
            producers.push(handle);
        }

        Self {
            buffer,
            stop,
            producers: Mutex::new(producers),
        }
    }

    /// Pops the next package, giving up after `timeout`.
    pub fn take_package(&self, timeout: Duration) -> Result<Vec<f64>, PopTimeout> {
        self.buffer.pop_back_timeout(timeout)
    }

    /// Stops and joins the filler threads. Packages already buffered remain
    /// available. Idempotent.
    pub fn terminate(&self) {
        self.stop.store(true, Ordering::Release);
        let mut producers = self
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in producers.drain(..) {
            let _ = handle.join();
        }
        debug!("random-number factory terminated");
    }

    /// Whether [`terminate`](Self::terminate) has run.
    pub fn is_terminated(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

fn fill_loop(buffer: &BoundedBuffer<Vec<f64>>, stop: &AtomicBool, package_size: usize) {
    let mut rng = rand::thread_rng();
    while !stop.load(Ordering::Acquire) {
        let package: Vec<f64> = (0..package_size).map(|_| rng.gen::<f64>()).collect();
        let mut pending = package;
        loop {
            match buffer.push_front_timeout(pending, Duration::from_millis(100)) {
                Ok(()) => break,
                Err(PushTimeout(package)) => {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    pending = package;
                }
            }
        }
    }
}

static GLOBAL_FACTORY: OnceLock<RandomFactory> = OnceLock::new();

/// The process-wide factory, constructed with default tuning on first use.
pub fn global_factory() -> &'static RandomFactory {
    GLOBAL_FACTORY.get_or_init(|| RandomFactory::new(RandomFactoryConfig::default()))
}

/// Like [`global_factory`], but with explicit tuning if this is the first
/// access. Later calls cannot re-tune the running instance.
pub fn init_global_factory(config: RandomFactoryConfig) -> &'static RandomFactory {
    GLOBAL_FACTORY.get_or_init(|| RandomFactory::new(config))
}

/// Stops the process-wide factory's filler threads, if it was ever started.
pub fn terminate_global_factory() {
    if let Some(factory) = GLOBAL_FACTORY.get() {
        factory.terminate();
    }
}

/// A consumer-side cursor over factory packages.
///
/// Draws uniforms from the current package and refills from the global
/// factory when it runs dry. If the factory is unavailable (terminated or
/// starved), numbers are generated locally so callers never stall.
pub struct RandomSource {
    package: Vec<f64>,
    cursor: usize,
}

impl RandomSource {
    pub fn new() -> Self {
        Self {
            package: Vec::new(),
            cursor: 0,
        }
    }

    /// The next uniform double in `[0, 1)`.
    pub fn next_uniform(&mut self) -> f64 {
        if self.cursor >= self.package.len() {
            self.refill();
        }
        let value = self.package[self.cursor];
        self.cursor += 1;
        value
    }

    /// A normally distributed double via the Box-Muller transform.
    pub fn next_normal(&mut self, mean: f64, sigma: f64) -> f64 {
        let u1 = 1.0 - self.next_uniform();
        let u2 = self.next_uniform();
        mean + sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    fn refill(&mut self) {
        self.cursor = 0;
        match global_factory().take_package(Duration::from_millis(500)) {
            Ok(package) => self.package = package,
            Err(PopTimeout) => {
                debug!("random factory starved; generating a package locally");
                let mut rng = rand::thread_rng();
                self.package = (0..DEFAULT_PACKAGE_SIZE).map(|_| rng.gen::<f64>()).collect();
            }
        }
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static THREAD_SOURCE: RefCell<RandomSource> = RefCell::new(RandomSource::new());
}

/// Runs `f` with this thread's [`RandomSource`].
pub fn with_thread_source<R>(f: impl FnOnce(&mut RandomSource) -> R) -> R {
    THREAD_SOURCE.with(|source| f(&mut source.borrow_mut()))
}
