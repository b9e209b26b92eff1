//! Propagation between the sample and detector planes.
//!
//! Fields are stacks of frames shaped (height, width, n). Every transform
//! here is unitary, so the backward operator is both the inverse and the
//! adjoint of the forward one, which is what the Difference Map assumes when
//! it back-propagates constrained fields.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayViewMut2, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};

use crate::types::{ModeDescriptor, PropagationModel};

/// Forward and backward optical propagation for a single mode.
pub trait Propagator: Send + Sync {
    /// Propagate exit waves to the detector plane.
    fn forward(&self, field: &Array3<Complex64>, mode: &ModeDescriptor) -> Array3<Complex64>;

    /// Propagate detector-plane fields back to the sample plane.
    fn backward(&self, field: &Array3<Complex64>, mode: &ModeDescriptor) -> Array3<Complex64>;
}

/// FFT-based propagator supporting far-field and near-field geometries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FourierPropagator;

impl FourierPropagator {
    pub fn new() -> Self {
        Self
    }

    /// Apply an orthonormal 2-D DFT to every frame of `field`.
    fn transform(field: &Array3<Complex64>, direction: FftDirection) -> Array3<Complex64> {
        let (ny, nx, _) = field.dim();
        let mut planner = FftPlanner::<f64>::new();
        let row_fft = planner.plan_fft(nx, direction);
        let col_fft = planner.plan_fft(ny, direction);
        let norm = 1.0 / ((ny * nx) as f64).sqrt();

        let mut out = field.to_owned();
        out.axis_iter_mut(Axis(2))
            .into_par_iter()
            .for_each(|mut frame| {
                fft_lanes(&mut frame, Axis(1), row_fft.as_ref());
                fft_lanes(&mut frame, Axis(0), col_fft.as_ref());
                frame.mapv_inplace(|z| z * norm);
            });
        out
    }

    /// Multiply every frame by a (height, width) kernel.
    fn modulate(field: &mut Array3<Complex64>, kernel: &Array2<Complex64>) {
        field
            .axis_iter_mut(Axis(2))
            .into_par_iter()
            .for_each(|mut frame| frame *= kernel);
    }

    fn near_field(
        field: &Array3<Complex64>,
        fresnel_factor: f64,
        conjugate: bool,
    ) -> Array3<Complex64> {
        let (ny, nx, _) = field.dim();
        let mut kernel = fresnel_transfer_function(ny, nx, fresnel_factor);
        if conjugate {
            kernel.mapv_inplace(|h| h.conj());
        }
        let mut spectrum = Self::transform(field, FftDirection::Forward);
        Self::modulate(&mut spectrum, &kernel);
        Self::transform(&spectrum, FftDirection::Inverse)
    }
}

impl Propagator for FourierPropagator {
    fn forward(&self, field: &Array3<Complex64>, mode: &ModeDescriptor) -> Array3<Complex64> {
        match mode.propagation {
            PropagationModel::FarField => Self::transform(field, FftDirection::Forward),
            PropagationModel::NearField { fresnel_factor } => {
                Self::near_field(field, fresnel_factor, false)
            }
        }
    }

    fn backward(&self, field: &Array3<Complex64>, mode: &ModeDescriptor) -> Array3<Complex64> {
        match mode.propagation {
            PropagationModel::FarField => Self::transform(field, FftDirection::Inverse),
            PropagationModel::NearField { fresnel_factor } => {
                Self::near_field(field, fresnel_factor, true)
            }
        }
    }
}

/// Run `fft` in place along every lane of `frame` parallel to `axis`.
fn fft_lanes(frame: &mut ArrayViewMut2<'_, Complex64>, axis: Axis, fft: &dyn Fft<f64>) {
    let mut buffer = Vec::with_capacity(frame.len_of(axis));
    for mut lane in frame.lanes_mut(axis) {
        buffer.clear();
        buffer.extend(lane.iter().copied());
        fft.process(&mut buffer);
        lane.iter_mut().zip(&buffer).for_each(|(dst, src)| *dst = *src);
    }
}

/// Spatial frequency of DFT bin `k` out of `n`, in cycles per pixel.
fn frequency(k: usize, n: usize) -> f64 {
    if k < n.div_ceil(2) {
        k as f64 / n as f64
    } else {
        (k as f64 - n as f64) / n as f64
    }
}

/// Angular-spectrum Fresnel transfer function
/// $H(q_y, q_x) = \exp\left(-i\pi F (q_x^2 + q_y^2)\right)$ with $F = \lambda z / \Delta x^2$.
pub fn fresnel_transfer_function(ny: usize, nx: usize, fresnel_factor: f64) -> Array2<Complex64> {
    Array2::from_shape_fn((ny, nx), |(ky, kx)| {
        let qy = frequency(ky, ny);
        let qx = frequency(kx, nx);
        let phase = -std::f64::consts::PI * fresnel_factor * (qx * qx + qy * qy);
        Complex64::from_polar(1.0, phase)
    })
}
