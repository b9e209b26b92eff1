//! CPU compute backend using Rayon for shared-memory parallelism.

use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use num_complex::Complex64;

use crate::backend::{
    complex_bytes, BackendType, ComputeBackend, ComputeError, DeviceInfo, MapFn, ZipFn,
};

/// CPU backend that parallelises elementwise work across threads via Rayon.
///
/// Device memory is host memory, so residency transfers hand back the same
/// allocation. An optional memory budget caps the bytes that may be resident
/// at once, which lets callers exercise out-of-memory handling.
pub struct CpuBackend {
    num_threads: usize,
    memory_budget: Option<usize>,
    resident: AtomicUsize,
}

impl CpuBackend {
    /// Create a new CPU backend using all available threads.
    pub fn new() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
            memory_budget: None,
            resident: AtomicUsize::new(0),
        }
    }

    /// Create a CPU backend with a specified thread count.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Self::new()
        }
    }

    /// Create a CPU backend that refuses residency beyond `bytes`.
    pub fn with_memory_budget(bytes: usize) -> Self {
        Self {
            memory_budget: Some(bytes),
            ..Self::new()
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("CPU ({} threads)", self.num_threads),
            backend_type: BackendType::Cpu,
            memory_bytes: self.memory_budget,
            compute_units: Some(self.num_threads),
        }
    }

    fn to_device(&self, host: ArrayD<Complex64>) -> Result<ArrayD<Complex64>, ComputeError> {
        let requested = complex_bytes(host.len());
        let resident = self.resident.fetch_add(requested, Ordering::SeqCst);
        if let Some(budget) = self.memory_budget {
            if resident + requested > budget {
                self.resident.fetch_sub(requested, Ordering::SeqCst);
                log::warn!(
                    "Residency transfer of {} bytes exceeds CPU budget ({} of {} bytes in use)",
                    requested,
                    resident,
                    budget
                );
                return Err(ComputeError::OutOfMemory {
                    requested,
                    available: budget.saturating_sub(resident),
                });
            }
        }
        Ok(host)
    }

    fn to_host(&self, device: ArrayD<Complex64>) -> Result<ArrayD<Complex64>, ComputeError> {
        let released = complex_bytes(device.len());
        let _ = self
            .resident
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
                Some(r.saturating_sub(released))
            });
        Ok(device)
    }

    fn resident_bytes(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }

    fn map_inplace(&self, mut target: ArrayViewMutD<'_, Complex64>, f: &MapFn) {
        target.par_map_inplace(|z| *z = f(*z));
    }

    fn zip_map_inplace(
        &self,
        target: ArrayViewMutD<'_, Complex64>,
        operand: ArrayViewD<'_, Complex64>,
        f: &ZipFn,
    ) -> Result<(), ComputeError> {
        if target.shape() != operand.shape() {
            return Err(ComputeError::DeviceError(format!(
                "Shape mismatch in elementwise map: {:?} vs {:?}",
                target.shape(),
                operand.shape()
            )));
        }
        Zip::from(target)
            .and(operand)
            .par_for_each(|t, &o| *t = f(*t, o));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_residency_accounting_round_trip() {
        let backend = CpuBackend::new();
        let host = Array2::<Complex64>::zeros((4, 4)).into_dyn();
        let device = backend.to_device(host).unwrap();
        assert_eq!(backend.resident_bytes(), complex_bytes(16));
        let _host = backend.to_host(device).unwrap();
        assert_eq!(backend.resident_bytes(), 0);
    }

    #[test]
    fn test_memory_budget_rejects_large_transfer() {
        let backend = CpuBackend::with_memory_budget(complex_bytes(8));
        let host = Array2::<Complex64>::zeros((4, 4)).into_dyn();
        match backend.to_device(host) {
            Err(ComputeError::OutOfMemory { requested, available }) => {
                assert_eq!(requested, complex_bytes(16));
                assert_eq!(available, complex_bytes(8));
            }
            other => panic!("expected OutOfMemory, got {:?}", other.map(|a| a.len())),
        }
        assert_eq!(backend.resident_bytes(), 0);
    }

    #[test]
    fn test_zip_map_applies_kernel() {
        let backend = CpuBackend::with_threads(2);
        let mut a = Array2::from_elem((3, 3), Complex64::new(2.0, 0.0));
        let b = Array2::from_elem((3, 3), Complex64::new(0.0, 1.0));
        backend
            .zip_map_inplace(a.view_mut().into_dyn(), b.view().into_dyn(), &|t, o| t + o)
            .unwrap();
        assert!(a.iter().all(|&z| z == Complex64::new(2.0, 1.0)));
    }

    #[test]
    fn test_zip_map_shape_mismatch_is_error() {
        let backend = CpuBackend::new();
        let mut a = Array2::<Complex64>::zeros((2, 3));
        let b = Array2::<Complex64>::zeros((3, 2));
        let result =
            backend.zip_map_inplace(a.view_mut().into_dyn(), b.view().into_dyn(), &|t, _| t);
        assert!(matches!(result, Err(ComputeError::DeviceError(_))));
    }
}
