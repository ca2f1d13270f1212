//! End-to-end optimization runs through every execution mode.

use courtier::{Broker, CollectorConfig, GenerationCollector, ThreadedConsumer};
use geneva_ea::{EvolutionConfig, EvolutionStrategy, Executor, Individual, SphereIndividual};
use std::time::Duration;

fn seed(parents: usize, dimension: usize) -> Vec<SphereIndividual> {
    (0..parents)
        .map(|_| SphereIndividual::from_parameters(vec![8.0; dimension], -10.0, 10.0, 0.5))
        .collect()
}

fn starting_fitness(dimension: usize) -> f64 {
    8.0 * 8.0 * dimension as f64
}

#[test]
fn serial_mode_improves_fitness() {
    let mut strategy = EvolutionStrategy::new(
        seed(2, 8),
        EvolutionConfig {
            generations: 30,
            ..EvolutionConfig::default()
        },
    )
    .unwrap();

    let report = strategy.optimize(&mut Executor::Serial).unwrap();
    assert_eq!(report.generations_run, 30);
    let best = report.best_fitness.unwrap();
    assert!(
        best < starting_fitness(8),
        "no improvement over the seed: {best}"
    );
}

#[test]
fn threaded_mode_matches_the_contract() {
    let mut strategy = EvolutionStrategy::new(
        seed(2, 8),
        EvolutionConfig {
            generations: 15,
            children: 12,
            ..EvolutionConfig::default()
        },
    )
    .unwrap();

    let report = strategy
        .optimize(&mut Executor::Threaded { workers: 4 })
        .unwrap();
    assert_eq!(report.generations_run, 15);
    assert!(report.best_fitness.unwrap() < starting_fitness(8));
}

#[test]
fn brokered_mode_improves_fitness() {
    let broker = Broker::with_defaults();
    broker
        .enroll_consumer(Box::new(ThreadedConsumer::with_threads(broker.clone(), 4)))
        .unwrap();

    let collector = GenerationCollector::new(
        &broker,
        CollectorConfig {
            first_item_timeout: Some(Duration::from_secs(10)),
            ..CollectorConfig::default()
        },
    )
    .unwrap();

    let mut strategy = EvolutionStrategy::new(
        seed(2, 8),
        EvolutionConfig {
            generations: 15,
            ..EvolutionConfig::default()
        },
    )
    .unwrap();
    let report = strategy
        .optimize(&mut Executor::Brokered { collector })
        .unwrap();

    assert_eq!(report.generations_run, 15);
    assert_eq!(report.synthetic_total, 0, "full-return consumer lost items");
    assert!(report.best_fitness.unwrap() < starting_fitness(8));
    broker.shutdown();
}

#[test]
fn checkpoints_embed_generation_and_fitness() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("best");

    let mut strategy = EvolutionStrategy::new(
        seed(2, 4),
        EvolutionConfig {
            generations: 10,
            checkpoint_every: Some(5),
            checkpoint_prefix: Some(prefix),
            ..EvolutionConfig::default()
        },
    )
    .unwrap();
    strategy.optimize(&mut Executor::Serial).unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(!names.is_empty());
    for name in &names {
        assert!(
            name.starts_with("best-g") && name.contains("-f") && name.ends_with(".json"),
            "unexpected checkpoint name {name}"
        );
    }

    // a checkpoint deserializes back into a usable individual
    let path = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
    let text = std::fs::read_to_string(path.path()).unwrap();
    let restored: SphereIndividual = serde_json::from_str(&text).unwrap();
    assert!(restored.fitness().is_some());
}
