//! Command-line driver for population-based function optimization.
//!
//! ```bash
//! # serial smoke run
//! geneva-opt -e 0
//!
//! # brokered run with a threaded consumer
//! geneva-opt -e 2 -c tc --generations 100
//!
//! # server half of a networked run, then remote workers
//! geneva-opt -e 2 -c nc --addr 0.0.0.0:10000
//! geneva-opt --client --addr server:10000
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use courtier::{
    init_global, init_global_factory, teardown_global, terminate_global_factory, Config,
    GenerationCollector, RandomFactoryConfig, SerialConsumer, ThreadedConsumer,
};
use courtier_net::{run_client, ClientConfig, NetConsumerConfig, NetworkedConsumer};
use geneva_ea::{EvolutionConfig, EvolutionStrategy, Executor, Individual, SphereIndividual};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "geneva-opt",
    version,
    about = "Population-based function optimization over the courtier work-distribution substrate"
)]
struct Cli {
    /// Pipeline of optimization algorithms, by mnemonic
    #[arg(short = 'a', value_delimiter = ',', default_value = "ea")]
    algorithms: Vec<String>,

    /// Execution mode: 0=serial, 1=threaded, 2=brokered
    #[arg(short = 'e', default_value_t = 0)]
    execution_mode: u8,

    /// Run as a remote worker instead of an optimizer
    #[arg(long)]
    client: bool,

    /// Consumer mnemonic, required with -e 2: sc, tc or nc
    #[arg(short = 'c')]
    consumer: Option<String>,

    /// Configuration file (key=value)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen (server) or connect (client) address for the networked pair
    #[arg(long, default_value = "127.0.0.1:10000")]
    addr: String,

    /// Optimization iterations
    #[arg(long, default_value_t = 50)]
    generations: u32,

    /// Problem dimension of the demo individual
    #[arg(long, default_value_t = 16)]
    dimension: usize,

    /// Checkpoint file prefix; checkpoints are disabled when absent
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();
    match run(&Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if cli.client {
        let stats = run_client::<SphereIndividual>(&ClientConfig {
            addr: cli.addr.clone(),
            mnemonic: "nc".into(),
            serialization: config.serialization,
        })?;
        info!(
            processed = stats.processed,
            failed = stats.failed,
            "client session finished"
        );
        return Ok(());
    }

    for mnemonic in &cli.algorithms {
        if mnemonic != "ea" {
            bail!("unknown algorithm mnemonic {mnemonic:?} (registered: ea)");
        }
    }

    init_global_factory(RandomFactoryConfig {
        producer_threads: config.n_producer_threads,
        ..RandomFactoryConfig::default()
    });

    let initial: Vec<SphereIndividual> = (0..2)
        .map(|_| SphereIndividual::random(cli.dimension, -10.0, 10.0, 0.5))
        .collect();
    let mut strategy = EvolutionStrategy::new(
        initial,
        EvolutionConfig {
            generations: cli.generations,
            checkpoint_every: cli.checkpoint.as_ref().map(|_| 10),
            checkpoint_prefix: cli.checkpoint.clone(),
            ..EvolutionConfig::default()
        },
    )?;

    match cli.execution_mode {
        0 => {
            strategy.optimize(&mut Executor::Serial)?;
        }
        1 => {
            let workers = thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
            strategy.optimize(&mut Executor::Threaded { workers })?;
        }
        2 => {
            let Some(mnemonic) = &cli.consumer else {
                bail!("brokered mode requires -c <consumer mnemonic>");
            };
            let broker = init_global::<SphereIndividual>(config.broker());
            match mnemonic.as_str() {
                "sc" => broker.enroll_consumer(Box::new(SerialConsumer::new(broker.clone())))?,
                "tc" => broker.enroll_consumer(Box::new(ThreadedConsumer::new(broker.clone())))?,
                "nc" => {
                    let consumer = NetworkedConsumer::new(
                        broker.clone(),
                        NetConsumerConfig {
                            bind_addr: cli.addr.parse().context("invalid --addr")?,
                            serialization: config.serialization,
                            ..NetConsumerConfig::default()
                        },
                    )?;
                    info!(addr = %consumer.local_addr(), "waiting for remote workers");
                    broker.enroll_consumer(Box::new(consumer))?;
                }
                other => bail!("unknown consumer mnemonic {other:?} (registered: sc, tc, nc)"),
            }

            let collector =
                GenerationCollector::with_capacity(&broker, config.collector(), config.buffer_capacity)?;
            let result = strategy.optimize(&mut Executor::Brokered { collector });
            teardown_global::<SphereIndividual>();
            result?;
        }
        other => bail!("unknown execution mode {other} (0=serial, 1=threaded, 2=brokered)"),
    }

    info!(
        generations = strategy.generation(),
        fitness = strategy.best().fitness().unwrap_or(f64::NAN),
        "optimization finished"
    );
    terminate_global_factory();
    Ok(())
}
