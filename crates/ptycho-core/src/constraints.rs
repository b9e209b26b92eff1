//! Fourier-modulus projection and the probe support constraint.
//!
//! The modulus projection replaces the predicted detector amplitude with the
//! measured one while keeping the phase. A per-pixel relaxation weight `r`
//! softens it:
//!
//! $$\hat\Psi' = \hat\Psi \left[(1 - r)\frac{M}{A} + r\right]$$
//!
//! so `r = 0` is full replacement and `r = 1` leaves the prediction as is.

use ndarray::{Array3, Zip};
use num_complex::Complex64;

use crate::types::{ModeDescriptor, ProbeSupport};

/// Guards the amplitude ratio where the prediction vanishes.
const AMPLITUDE_FLOOR: f64 = 1e-12;

/// Effective relaxation weight of the modulus projection.
#[derive(Debug, Clone, PartialEq)]
pub enum RelaxationMask {
    /// One weight for every detector pixel.
    Uniform(f64),
    /// Per-pixel weights shaped like the block's modulus stack.
    PerPixel(Array3<f64>),
}

impl RelaxationMask {
    /// Combine the validity mask (1 = valid) with `pfft_relaxation`.
    ///
    /// Valid pixels get `pfft_relaxation`; invalid pixels move towards the
    /// unconstrained level 1 by `mask_relaxation`. Without a mask every pixel
    /// gets `pfft_relaxation`.
    pub fn build(mask: Option<&Array3<f64>>, pfft_relaxation: f64, mask_relaxation: f64) -> Self {
        match mask {
            None => RelaxationMask::Uniform(pfft_relaxation),
            Some(valid) => RelaxationMask::PerPixel(valid.mapv(|v| {
                pfft_relaxation + (1.0 - pfft_relaxation) * mask_relaxation * (1.0 - v)
            })),
        }
    }

    /// Weight at `[row, col, position]`.
    pub fn weight(&self, index: [usize; 3]) -> f64 {
        match self {
            RelaxationMask::Uniform(r) => *r,
            RelaxationMask::PerPixel(w) => w[index],
        }
    }
}

/// Replaces predicted Fourier amplitudes with measured ones.
pub trait ModulusProjector: Send + Sync {
    /// Project every mode's detector field onto the measured modulus.
    ///
    /// `predicted` is the incoherent amplitude summed over `fields`.
    fn project(
        &self,
        modulus: &Array3<f64>,
        predicted: &Array3<f64>,
        fields: Vec<Array3<Complex64>>,
        relaxation: &RelaxationMask,
    ) -> Vec<Array3<Complex64>>;
}

/// Relaxed amplitude-replacement projector.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmplitudeProjector;

impl ModulusProjector for AmplitudeProjector {
    fn project(
        &self,
        modulus: &Array3<f64>,
        predicted: &Array3<f64>,
        fields: Vec<Array3<Complex64>>,
        relaxation: &RelaxationMask,
    ) -> Vec<Array3<Complex64>> {
        let factor = |m: f64, a: f64, r: f64| (1.0 - r) * m / (a + AMPLITUDE_FLOOR) + r;
        fields
            .into_iter()
            .map(|mut field| {
                match relaxation {
                    RelaxationMask::Uniform(r) => Zip::from(&mut field)
                        .and(modulus)
                        .and(predicted)
                        .for_each(|z, &m, &a| *z *= factor(m, a, *r)),
                    RelaxationMask::PerPixel(w) => Zip::from(&mut field)
                        .and(modulus)
                        .and(predicted)
                        .and(w)
                        .for_each(|z, &m, &a, &r| *z *= factor(m, a, r)),
                }
                field
            })
            .collect()
    }
}

/// Incoherent detector amplitude $A = \sqrt{\sum_\ell |\hat\Psi_\ell|^2}$.
pub fn reciprocal_amplitude(fields: &[Array3<Complex64>]) -> Array3<f64> {
    let mut intensity = Array3::<f64>::zeros(fields[0].dim());
    for field in fields {
        Zip::from(&mut intensity)
            .and(field)
            .for_each(|i, z| *i += z.norm_sqr());
    }
    intensity.mapv_inplace(f64::sqrt);
    intensity
}

/// Real-space constraint applied to the freshly updated first probe mode.
pub trait ProbeConstraint: Send + Sync {
    fn apply(&self, probe: Array3<Complex64>, mode: &ModeDescriptor) -> Array3<Complex64>;
}

/// Zeroes the probe outside the support named by the mode descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupportConstraint;

impl ProbeConstraint for SupportConstraint {
    fn apply(&self, mut probe: Array3<Complex64>, mode: &ModeDescriptor) -> Array3<Complex64> {
        let Some(support) = mode.support else {
            return probe;
        };
        let (ny, nx, _) = probe.dim();
        let cy = (ny as f64 - 1.0) / 2.0;
        let cx = (nx as f64 - 1.0) / 2.0;
        match support {
            ProbeSupport::Circular { radius } => {
                let r2 = radius * radius;
                probe.indexed_iter_mut().for_each(|((y, x, _), z)| {
                    let dy = y as f64 - cy;
                    let dx = x as f64 - cx;
                    if dy * dy + dx * dx > r2 {
                        *z = Complex64::new(0.0, 0.0);
                    }
                });
            }
        }
        probe
    }
}
