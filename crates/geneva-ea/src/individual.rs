//! The demo individual: a bounded parameter vector scored by the sphere
//! function.
//!
//! Small enough to evaluate in microseconds, which makes it useful for
//! exercising every execution mode, but structured like a real individual:
//! bounded parameters, a mutation step width and a cached fitness that is
//! invalidated whenever the parameters change.

use courtier::{with_thread_source, Command, Processable, ProcessingError};
use serde::{Deserialize, Serialize};

/// What the evolution strategy needs from a candidate solution, on top of
/// the substrate's capability set.
pub trait Individual: Processable + Clone {
    /// The cached raw fitness, if the individual has been evaluated. Lower
    /// is better.
    fn fitness(&self) -> Option<f64>;
}

/// A parameter vector minimizing the sum of squares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SphereIndividual {
    parameters: Vec<f64>,
    /// Gaussian mutation step width.
    sigma: f64,
    lower: f64,
    upper: f64,
    fitness: Option<f64>,
}

impl SphereIndividual {
    /// Creates an individual with uniformly drawn parameters.
    ///
    /// # Panics
    ///
    /// Panics if the bounds are inverted or the dimension is 0.
    pub fn random(dimension: usize, lower: f64, upper: f64, sigma: f64) -> Self {
        assert!(dimension > 0, "dimension cannot be 0");
        assert!(lower < upper, "lower bound must be below upper bound");
        let parameters = with_thread_source(|source| {
            (0..dimension)
                .map(|_| lower + source.next_uniform() * (upper - lower))
                .collect()
        });
        Self {
            parameters,
            sigma,
            lower,
            upper,
            fitness: None,
        }
    }

    /// Creates an individual from explicit parameters (used in tests and
    /// when resuming from a checkpoint).
    pub fn from_parameters(parameters: Vec<f64>, lower: f64, upper: f64, sigma: f64) -> Self {
        assert!(!parameters.is_empty(), "dimension cannot be 0");
        assert!(lower < upper, "lower bound must be below upper bound");
        Self {
            parameters,
            sigma,
            lower,
            upper,
            fitness: None,
        }
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    fn evaluate(&mut self) {
        self.fitness = Some(self.parameters.iter().map(|x| x * x).sum());
    }

    fn mutate(&mut self) {
        with_thread_source(|source| {
            for parameter in &mut self.parameters {
                let mutated = *parameter + source.next_normal(0.0, self.sigma);
                *parameter = mutated.clamp(self.lower, self.upper);
            }
        });
        self.fitness = None;
    }
}

impl Processable for SphereIndividual {
    fn process(&mut self, command: Command) -> Result<(), ProcessingError> {
        match command {
            Command::Evaluate => self.evaluate(),
            Command::MutateAndEvaluate => {
                self.mutate();
                self.evaluate();
            }
            Command::Noop => {}
        }
        Ok(())
    }
}

impl Individual for SphereIndividual {
    fn fitness(&self) -> Option<f64> {
        self.fitness
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_is_the_sum_of_squares() {
        let mut individual =
            SphereIndividual::from_parameters(vec![1.0, 2.0, -2.0], -10.0, 10.0, 0.5);
        assert_eq!(individual.fitness(), None);
        individual.process(Command::Evaluate).unwrap();
        assert_eq!(individual.fitness(), Some(9.0));
    }

    #[test]
    fn mutation_respects_bounds_and_invalidates_fitness() {
        let mut individual = SphereIndividual::from_parameters(vec![0.9; 8], -1.0, 1.0, 10.0);
        individual.process(Command::Evaluate).unwrap();
        individual.process(Command::MutateAndEvaluate).unwrap();
        assert!(individual
            .parameters()
            .iter()
            .all(|p| (-1.0..=1.0).contains(p)));
        assert!(individual.fitness().is_some());
    }

    #[test]
    fn random_individuals_start_inside_the_bounds() {
        let individual = SphereIndividual::random(32, -5.0, 5.0, 0.5);
        assert_eq!(individual.parameters().len(), 32);
        assert!(individual
            .parameters()
            .iter()
            .all(|p| (-5.0..5.0).contains(p)));
    }
}
