//! Windowed-sinc low-pass FIR design

use std::f64::consts::PI;

/// Normalised sinc, `sin(pi x) / (pi x)`, with its limit of 1 at zero
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Hamming window value for tap `n` of `len`
fn hamming(n: usize, len: usize) -> f64 {
    if len <= 1 {
        return 1.0;
    }
    0.54 - 0.46 * (2.0 * PI * n as f64 / (len - 1) as f64).cos()
}

/// Fixed low-pass filter shared by all channels of a resampler
#[derive(Debug, Clone)]
pub struct FirFilter {
    coeffs: Vec<f32>,
}

impl FirFilter {
    /// Design a `taps`-long low-pass with `cutoff` given as a fraction of
    /// Nyquist (0.45 = 45% of fs/2). Coefficients are scaled to unity DC gain.
    pub fn low_pass(taps: usize, cutoff: f64) -> Self {
        debug_assert!(taps > 0, "filter needs at least one tap");
        debug_assert!(cutoff > 0.0 && cutoff < 1.0, "cutoff must be inside (0, 1)");

        // Cutoff in cycles per sample
        let fc = cutoff * 0.5;
        let center = (taps - 1) as f64 / 2.0;

        let raw: Vec<f64> = (0..taps)
            .map(|n| {
                let lag = n as f64 - center;
                // 2fc * sinc(2fc * lag); at lag 0 this is exactly 2fc
                let ideal = if lag == 0.0 {
                    2.0 * fc
                } else {
                    2.0 * fc * sinc(2.0 * fc * lag)
                };
                ideal * hamming(n, taps)
            })
            .collect();

        let sum: f64 = raw.iter().sum();
        let coeffs = raw.iter().map(|c| (c / sum) as f32).collect();

        Self { coeffs }
    }

    pub fn coeffs(&self) -> &[f32] {
        &self.coeffs
    }

    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }

    /// Group delay in samples (linear phase)
    pub fn group_delay(&self) -> f64 {
        (self.coeffs.len() - 1) as f64 / 2.0
    }

    /// Apply to a window of samples, oldest first, `window.len() == len()`
    #[inline]
    pub fn apply(&self, window: &[f32]) -> f32 {
        debug_assert_eq!(window.len(), self.coeffs.len());
        let taps = self.coeffs.len();
        window
            .iter()
            .enumerate()
            .map(|(j, x)| x * self.coeffs[taps - 1 - j])
            .sum()
    }
}
