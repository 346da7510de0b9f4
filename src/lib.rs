// Copyright 2026 the elphscatter developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Elphscatter computes scattering rates between quantum excitations on dense
//! wavevector meshes and assembles them into a transport operator.
//!
//! # Overview
//! The coupling between electronic states and lattice vibrations is tabulated
//! on a real-space lattice in a Wannier representation. To evaluate a
//! scattering rate between two Bloch states the coupling must be interpolated
//! to arbitrary reciprocal-space points: a discrete Fourier transform over
//! each of the two lattice-vector sets, a rotation by the Bloch eigenvectors
//! on each index, and (in polar crystals) a long-range electrostatic
//! correction. The interpolated squared amplitudes are then combined with
//! energy-conservation weights and thermal occupation factors into one of
//! three operator representations: the full pairwise rate matrix, the action
//! of the unmaterialized matrix on a population vector, or the per-state
//! linewidths alone.
//!
//! The coupling tensor is far too large for a single address space on
//! production meshes. Cooperating processes are therefore organized into
//! pools, each pool jointly holding one partition of the tensor, and the
//! working set of the interpolation is bounded by an explicit byte budget
//! which fixes how many destination points may be processed per batch.
//!
//! # Usage
//! The crate is a library: readers of coupling tables, configuration parsing
//! and the harmonic Hamiltonians are external collaborators. A calculation
//! threads a [`parallel::ProcessGroup`] through the constructors of the
//! [`interaction::ElPhInteraction`] engine and the
//! [`scattering::ScatteringRatesBuilder`], then requests one of the three
//! output shapes through [`scattering::Request`].

#![warn(missing_docs)]
#![allow(clippy::type_complexity)]

/// The per-point band-structure container and the re-diagonalization seam
pub mod bandstructure;

/// Physical constants
mod constants;

/// Crystal structure and dielectric input data
pub mod crystal;

/// Energy-conservation (delta function) weights
pub mod delta;

/// Error handling
pub mod error;

/// Wannier interpolation of the electron-phonon coupling
pub mod interaction;

/// Memory-budgeted batching of the interpolation loop
pub mod memory;

/// Process pools, work partitioning and collective communication
pub mod parallel;

/// Assembly of pairwise rates into the scattering operator
pub mod scattering;

/// Particle statistics and the temperature sweep
pub mod statistics;

pub use constants::*;

/// Deterministic test fixtures shared by the in-crate unit tests
#[cfg(test)]
mod fixtures;
