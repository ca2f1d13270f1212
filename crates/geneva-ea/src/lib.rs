//! Evolution-Strategy Driver for the Courtier Substrate
//!
//! A small but complete algorithm layer on top of `courtier`: a (μ+λ)
//! evolution strategy, a demo individual (bounded parameter vector, sphere
//! objective, Gaussian mutation fed by the random-number factory) and the
//! `geneva-opt` binary wiring the three execution modes together — serial,
//! threaded (barrier-fenced pool) and brokered (port + collector through
//! any enrolled consumer, including the networked one).

pub mod individual;
pub mod population;

pub use individual::{Individual, SphereIndividual};
pub use population::{
    DriverError, EvolutionConfig, EvolutionStrategy, Executor, OptimizeReport,
};
