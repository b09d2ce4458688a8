//! Windowing functions applied to analysis/synthesis blocks in the time
//! stretcher.

use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Hann,
    Hamming,
    Blackman,
}

/// A precomputed window of length `len`, ready to be multiplied element-wise
/// into a block.
#[derive(Debug, Clone)]
pub struct Window {
    coefficients: Vec<f32>,
}

impl Window {
    pub fn new(kind: WindowType, len: usize) -> Self {
        let coefficients = match kind {
            WindowType::Hann => Self::hann(len),
            WindowType::Hamming => Self::hamming(len),
            WindowType::Blackman => Self::blackman(len),
        };
        Self { coefficients }
    }

    fn hann(len: usize) -> Vec<f32> {
        if len <= 1 {
            return vec![1.0; len];
        }
        (0..len)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (len - 1) as f32).cos())
            .collect()
    }

    fn hamming(len: usize) -> Vec<f32> {
        if len <= 1 {
            return vec![1.0; len];
        }
        (0..len)
            .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / (len - 1) as f32).cos())
            .collect()
    }

    fn blackman(len: usize) -> Vec<f32> {
        if len <= 1 {
            return vec![1.0; len];
        }
        (0..len)
            .map(|i| {
                let x = 2.0 * PI * i as f32 / (len - 1) as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Multiplies `block` in place by the window coefficients.
    pub fn apply(&self, block: &mut [f32]) {
        debug_assert_eq!(block.len(), self.coefficients.len());
        for (sample, coeff) in block.iter_mut().zip(self.coefficients.iter()) {
            *sample *= coeff;
        }
    }

    /// Sum of all coefficients, used to derive overlap-add normalization
    /// constants analytically instead of hard-coding a magic divisor.
    pub fn sum(&self) -> f32 {
        self.coefficients.iter().sum()
    }

    pub fn coefficients(&self) -> &[f32] {
        &self.coefficients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hann_window_is_zero_at_edges_and_one_at_center() {
        let w = Window::new(WindowType::Hann, 9);
        assert_relative_eq!(w.coefficients()[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(w.coefficients()[8], 0.0, epsilon = 1e-6);
        assert_relative_eq!(w.coefficients()[4], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn apply_scales_every_sample() {
        let w = Window::new(WindowType::Hann, 4);
        let mut block = vec![1.0f32; 4];
        w.apply(&mut block);
        for (sample, coeff) in block.iter().zip(w.coefficients().iter()) {
            assert_relative_eq!(*sample, *coeff, epsilon = 1e-6);
        }
    }
}
