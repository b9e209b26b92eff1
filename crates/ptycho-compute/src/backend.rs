//! Compute backend trait and device abstraction.
//!
//! The [`ComputeBackend`] trait abstracts over the execution environment
//! (host CPU, accelerator) so that the reconstruction code in `ptycho-core`
//! remains device-agnostic. It covers the two primitive families the
//! reconstruction needs from a device: moving arrays in and out of device
//! memory, and elementwise maps over device-resident arrays.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};
use num_complex::Complex64;
use thiserror::Error;

/// Errors originating from compute backends.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Out of memory: requested {requested} bytes, available {available}")]
    OutOfMemory { requested: usize, available: usize },
}

/// Describes the capabilities of a compute backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend_type: BackendType,
    pub memory_bytes: Option<usize>,
    pub compute_units: Option<usize>,
}

/// The type of compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Cpu,
    Gpu,
}

/// Elementwise unary kernel over complex samples.
pub type MapFn = dyn Fn(Complex64) -> Complex64 + Send + Sync;

/// Elementwise binary kernel `f(target, operand)`.
pub type ZipFn = dyn Fn(Complex64, Complex64) -> Complex64 + Send + Sync;

/// Abstraction over compute backends.
///
/// Residency transfers take the array by value: after `to_device` the caller
/// holds the device-resident copy and must hand it back through `to_host`
/// before the host copy is used again. Backends that share memory with the
/// host return the same allocation and only account for it.
pub trait ComputeBackend: Send + Sync {
    /// Return information about the device.
    fn device_info(&self) -> DeviceInfo;

    /// Move an array into device memory.
    fn to_device(&self, host: ArrayD<Complex64>) -> Result<ArrayD<Complex64>, ComputeError>;

    /// Move an array back into host memory, releasing its device allocation.
    fn to_host(&self, device: ArrayD<Complex64>) -> Result<ArrayD<Complex64>, ComputeError>;

    /// Bytes currently held in device memory through `to_device`.
    fn resident_bytes(&self) -> usize;

    /// Apply `f` to every element of `target` in place.
    fn map_inplace(&self, target: ArrayViewMutD<'_, Complex64>, f: &MapFn);

    /// Replace every element `t` of `target` with `f(t, o)`, where `o` is the
    /// element of `operand` at the same index.
    fn zip_map_inplace(
        &self,
        target: ArrayViewMutD<'_, Complex64>,
        operand: ArrayViewD<'_, Complex64>,
        f: &ZipFn,
    ) -> Result<(), ComputeError>;
}

/// Number of bytes occupied by `len` complex samples.
pub fn complex_bytes(len: usize) -> usize {
    len * std::mem::size_of::<Complex64>()
}
