//! # Ptycho Core
//!
//! The numerical backbone of the ptycho workspace. This crate implements the
//! Difference-Map (DM) algorithm for ptychographic phase retrieval: from
//! diffraction patterns recorded while a probe scans overlapping regions of a
//! sample, it jointly reconstructs the complex object and probe.
//!
//! ## Architecture
//!
//! Reconstruction methods implement the [`solver::PhaseRetrievalEngine`]
//! trait, which runs one outer iteration on caller-owned state. The DM
//! implementation is [`solver::dm::DifferenceMap`]. Propagation, view
//! extraction, measured data and the probe constraint are consumed through
//! traits so that alternative optics or data sources can be plugged in.
//!
//! ## Modules
//!
//! - [`types`]: Reconstruction state, DM parameters and fixed constants.
//! - [`solver`]: Engine trait and the Difference-Map implementation.
//! - [`propagation`]: Far-field and near-field FFT propagation.
//! - [`views`]: Gather/scatter of probe-sized object views.
//! - [`measurement`]: Measured modulus, Fourier error metric and history.
//! - [`constraints`]: Modulus projection and probe support.
//! - [`synthetic`]: Deterministic simulated experiments.

pub mod constraints;
pub mod measurement;
pub mod propagation;
pub mod solver;
pub mod synthetic;
pub mod types;
pub mod views;
