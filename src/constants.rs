// Copyright 2026 the elphscatter developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Constants
//!
//! Defines physical constants used in the calculation. All internal
//! quantities are in Hartree atomic units.

/// e^2 / (4 pi eps_0) in atomic units
pub const CHARGE_SQUARE: f64 = 2.0;
/// 4 pi
pub const FOUR_PI: f64 = 4.0 * std::f64::consts::PI;
/// Boltzmann constant in Ry / K
pub const BOLTZMANN_RY: f64 = 6.333_623_618_270_2e-6;
/// Default memory budget for the coupling interpolation, in bytes
pub const DEFAULT_MEMORY_BUDGET: u64 = 16_000_000_000;
/// Energies below this threshold are treated as numerically zero
pub const ENERGY_CUTOFF: f64 = 1.0e-8;
/// Wavevectors with a norm below this threshold are treated as the zone center
pub const WAVEVECTOR_CUTOFF: f64 = 1.0e-8;
