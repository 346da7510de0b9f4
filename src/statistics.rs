//! Particle statistics and the temperature sweep.
//!
//! Occupation factors are evaluated per calculation: a calculation is one
//! (temperature, chemical potential) pair, and a sweep holds the ordered
//! list of calculations a run resolves simultaneously. Bosonic populations
//! ignore the chemical potential.

use serde::Deserialize;

/// The exchange statistics of a state
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Particle {
    /// Bose-Einstein statistics (phonons)
    Boson,
    /// Fermi-Dirac statistics (electrons)
    Fermion,
}

impl Particle {
    /// The equilibrium occupation of a state at `energy`.
    ///
    /// `temperature` is in energy units; `chemical_potential` is ignored for
    /// bosons.
    pub fn population(&self, energy: f64, temperature: f64, chemical_potential: f64) -> f64 {
        match self {
            Particle::Boson => {
                let x = energy / temperature;
                1.0 / x.exp_m1()
            }
            Particle::Fermion => {
                let x = (energy - chemical_potential) / temperature;
                1.0 / (x.exp() + 1.0)
            }
        }
    }
}

/// One (temperature, chemical potential) pair
#[derive(Copy, Clone, Debug, Deserialize)]
pub struct Calculation {
    /// Temperature in energy units
    pub temperature: f64,
    /// Chemical potential in energy units; zero for bosonic runs
    #[serde(default)]
    pub chemical_potential: f64,
}

/// The ordered list of calculations resolved in one run
#[derive(Clone, Debug)]
pub struct StatisticsSweep {
    calculations: Vec<Calculation>,
}

impl StatisticsSweep {
    /// A sweep over explicit calculations
    pub fn from_calculations(calculations: Vec<Calculation>) -> Self {
        Self { calculations }
    }

    /// A bosonic sweep over temperatures, chemical potential zero
    pub fn for_temperatures(temperatures: &[f64]) -> Self {
        Self {
            calculations: temperatures
                .iter()
                .map(|&temperature| Calculation {
                    temperature,
                    chemical_potential: 0.0,
                })
                .collect(),
        }
    }

    /// Number of calculations in the sweep
    pub fn num_calculations(&self) -> usize {
        self.calculations.len()
    }

    /// The `index`-th calculation
    pub fn calculation(&self, index: usize) -> Calculation {
        self.calculations[index]
    }

    /// Iterates over the calculations in order
    pub fn iter(&self) -> impl Iterator<Item = Calculation> + '_ {
        self.calculations.iter().copied()
    }
}

#[cfg(test)]
mod test {
    use super::{Particle, StatisticsSweep};
    use approx::assert_relative_eq;

    #[test]
    fn bose_population_matches_reference() {
        // n(e) = 1 / (exp(e/T) - 1); at e = T ln 2 the population is 1
        let temperature = 0.01;
        let energy = temperature * 2.0_f64.ln();
        assert_relative_eq!(
            Particle::Boson.population(energy, temperature, 0.0),
            1.0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn fermi_population_is_half_at_the_chemical_potential() {
        assert_relative_eq!(
            Particle::Fermion.population(0.25, 0.01, 0.25),
            0.5,
            max_relative = 1e-12
        );
    }

    #[test]
    fn fermi_population_saturates() {
        let n = Particle::Fermion.population(-1.0, 0.01, 0.0);
        assert!(n > 0.999_999);
        let n = Particle::Fermion.population(1.0, 0.01, 0.0);
        assert!(n < 1e-6);
    }

    #[test]
    fn temperature_sweep_orders_calculations() {
        let sweep = StatisticsSweep::for_temperatures(&[0.001, 0.002]);
        assert_eq!(sweep.num_calculations(), 2);
        assert_relative_eq!(sweep.calculation(1).temperature, 0.002);
        assert_relative_eq!(sweep.calculation(0).chemical_potential, 0.0);
    }
}
