//! # Ptycho Compute
//!
//! Compute backend abstraction for the ptycho workspace. This crate provides
//! a [`ComputeBackend`](backend::ComputeBackend) trait that isolates the
//! reconstruction code from device-specific residency and elementwise-map
//! primitives.
//!
//! ## Available backends
//!
//! | Backend | Feature flag | Status |
//! |---------|-------------|--------|
//! | CPU (Rayon) | `cpu` (default) | Implemented |

pub mod backend;

#[cfg(feature = "cpu")]
pub mod cpu;

pub use backend::{BackendType, ComputeBackend, ComputeError, DeviceInfo, MapFn, ZipFn};

#[cfg(feature = "cpu")]
pub use cpu::CpuBackend;
