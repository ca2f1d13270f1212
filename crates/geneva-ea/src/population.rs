//! A (μ+λ) evolution strategy over any [`Individual`].
//!
//! Per iteration the strategy clones its parents into λ children, has them
//! mutated and evaluated by one of three execution modes, then keeps the
//! best μ of parents and children. The strategy never mutates an item
//! between submission and receipt, places results by position, tolerates
//! synthetic slot-fills (warn and continue) and advances its generation
//! counter monotonically — the full contract the substrate asks of a
//! driver.

use crate::individual::Individual;
use courtier::{Barrier, CollectorError, Command, GenerationCollector, WorkItem};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("initial population is empty")]
    EmptyPopulation,
    #[error("generation {0} came back empty")]
    EmptyGeneration(u32),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error("cannot write checkpoint {path}: {source}")]
    Checkpoint {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Strategy parameters.
#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    /// μ: surviving parents per generation.
    pub parents: usize,
    /// λ: children produced per generation.
    pub children: usize,
    /// Iterations to run.
    pub generations: u32,
    /// Write a checkpoint every k generations; `None` disables them.
    pub checkpoint_every: Option<u32>,
    /// Prefix for checkpoint file names.
    pub checkpoint_prefix: Option<PathBuf>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            parents: 2,
            children: 8,
            generations: 20,
            checkpoint_every: None,
            checkpoint_prefix: None,
        }
    }
}

/// How one generation of children is evaluated.
pub enum Executor<I: Individual> {
    /// In-place on the calling thread.
    Serial,
    /// A pool of scoped worker threads, fenced by a barrier per generation.
    Threaded { workers: usize },
    /// Through the broker, via the session's collector.
    Brokered { collector: GenerationCollector<I> },
}

/// Summary handed back by [`EvolutionStrategy::optimize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizeReport {
    pub generations_run: u32,
    pub best_fitness: Option<f64>,
    /// Synthetic slot-fills accepted across the whole run.
    pub synthetic_total: usize,
}

/// The driver: owns the parent population and the generation counter.
pub struct EvolutionStrategy<I: Individual> {
    parents: Vec<I>,
    config: EvolutionConfig,
    generation: u32,
    synthetic_total: usize,
}

impl<I: Individual + Serialize> EvolutionStrategy<I> {
    /// Seeds the strategy. The initial individuals become the first parent
    /// set; they do not need to be evaluated yet.
    pub fn new(initial: Vec<I>, config: EvolutionConfig) -> Result<Self, DriverError> {
        if initial.is_empty() {
            return Err(DriverError::EmptyPopulation);
        }
        Ok(Self {
            parents: initial,
            config,
            generation: 0,
            synthetic_total: 0,
        })
    }

    /// The best individual found so far (after at least one iteration).
    pub fn best(&self) -> &I {
        &self.parents[0]
    }

    /// The current iteration counter.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Runs the configured number of iterations.
    pub fn optimize(&mut self, executor: &mut Executor<I>) -> Result<OptimizeReport, DriverError> {
        for _ in 0..self.config.generations {
            self.step(executor)?;
        }
        Ok(OptimizeReport {
            generations_run: self.generation,
            best_fitness: self.best().fitness(),
            synthetic_total: self.synthetic_total,
        })
    }

    /// Runs one iteration: spawn children, evaluate, select, checkpoint.
    pub fn step(&mut self, executor: &mut Executor<I>) -> Result<(), DriverError> {
        let children = self.spawn_children();
        let evaluated = match executor {
            Executor::Serial => serial_eval(children),
            Executor::Threaded { workers } => threaded_eval(children, *workers),
            Executor::Brokered { collector } => {
                let generation =
                    collector.run_generation(self.generation, Command::MutateAndEvaluate, children)?;
                if generation.cancelled || generation.slots.is_empty() {
                    return Err(DriverError::EmptyGeneration(self.generation));
                }
                if generation.stats.synthetic > 0 {
                    // Synthetic fills keep the population at full strength;
                    // worth a warning, not an abort.
                    warn!(
                        generation = self.generation,
                        synthetic = generation.stats.synthetic,
                        "continuing with repaired slots"
                    );
                    self.synthetic_total += generation.stats.synthetic;
                }
                if generation.stats.received_stale > 0 {
                    debug!(
                        generation = self.generation,
                        stale = generation.stats.received_stale,
                        "discarding late arrivals from earlier generations"
                    );
                }
                generation.slots.into_iter().map(|slot| slot.payload).collect()
            }
        };

        self.select(evaluated);
        info!(
            generation = self.generation,
            best = self.best().fitness().unwrap_or(f64::NAN),
            "iteration finished"
        );

        if let (Some(every), Some(_)) = (self.config.checkpoint_every, &self.config.checkpoint_prefix)
        {
            if every > 0 && self.generation % every == 0 {
                self.write_checkpoint()?;
            }
        }
        self.generation += 1;
        Ok(())
    }

    /// Clones parents round-robin into the λ children of the next
    /// generation.
    fn spawn_children(&self) -> Vec<I> {
        (0..self.config.children)
            .map(|i| self.parents[i % self.parents.len()].clone())
            .collect()
    }

    /// (μ+λ) truncation: parents compete with their children; the best μ by
    /// raw fitness survive, best first. Unevaluated stragglers sort last.
    fn select(&mut self, children: Vec<I>) {
        let mut pool = std::mem::take(&mut self.parents);
        pool.extend(children);
        pool.sort_by(|a, b| compare_fitness(a.fitness(), b.fitness()));
        pool.truncate(self.config.parents.max(1));
        self.parents = pool;
    }

    /// Writes the best individual to a file named by generation and fitness.
    fn write_checkpoint(&self) -> Result<(), DriverError> {
        let Some(prefix) = &self.config.checkpoint_prefix else {
            return Ok(());
        };
        let best = self.best();
        let fitness = best.fitness().unwrap_or(f64::NAN);
        let path = format!(
            "{}-g{:05}-f{:.6}.json",
            prefix.display(),
            self.generation,
            fitness
        );
        let file = File::create(&path).map_err(|source| DriverError::Checkpoint {
            path: path.clone(),
            source,
        })?;
        serde_json::to_writer_pretty(file, best).map_err(|source| DriverError::Checkpoint {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, source),
        })?;
        debug!(path, "checkpoint written");
        Ok(())
    }
}

fn compare_fitness(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn serial_eval<I: Individual>(children: Vec<I>) -> Vec<I> {
    children
        .into_iter()
        .map(|child| {
            let mut item = WorkItem::new(child, Command::MutateAndEvaluate);
            if let Err(e) = item.process() {
                warn!(error = %e, "child failed to evaluate");
            }
            item.into_payload()
        })
        .collect()
}

/// Evaluates children on a scoped thread pool. All workers meet at a barrier
/// before their results are merged, so one generation is fully fenced from
/// the next.
fn threaded_eval<I: Individual>(children: Vec<I>, workers: usize) -> Vec<I> {
    if children.is_empty() {
        return Vec::new();
    }
    let workers = workers.max(1).min(children.len());
    let chunk_size = children.len().div_ceil(workers);

    let mut chunks: Vec<Vec<I>> = Vec::with_capacity(workers);
    let mut iter = children.into_iter();
    loop {
        let chunk: Vec<I> = iter.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    let barrier = Barrier::new(chunks.len() as u32);
    thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let barrier = &barrier;
                scope.spawn(move || {
                    let done: Vec<I> = serial_eval(chunk);
                    if barrier.wait() {
                        debug!("evaluation fence released");
                    }
                    done
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("evaluation worker panicked"))
            .collect()
    })
}
