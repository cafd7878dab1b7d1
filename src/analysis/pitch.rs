// PitchEstimator - FFT-accelerated YIN fundamental frequency estimation
//
// Algorithm (per frame of N samples, integration window W = N / 2):
// 1. Autocorrelation r(τ) = Σ_{j<W} x_j·x_{j+τ} via one forward FFT of the
//    frame, one of its first half, and an inverse FFT of their product
// 2. Difference d(τ) = E(0) + E(τ) - 2·r(τ) where E(τ) = Σ_{j<W} x_{j+τ}²
// 3. Cumulative mean normalized difference d'(τ) = d(τ)·τ / Σ_{k≤τ} d(k)
// 4. First τ with d'(τ) < threshold, walked down to its local minimum
// 5. Parabolic interpolation around τ; probability = 1 - d'(τ)
//
// The FFT size equals the frame size: j + τ < 2W = N, so the circular
// correlation never wraps.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Raw estimator output for one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz; 0 when no period was found
    pub frequency_hz: f32,
    /// Confidence in [0, 1]
    pub probability: f32,
}

impl PitchEstimate {
    pub const NONE: PitchEstimate = PitchEstimate {
        frequency_hz: 0.0,
        probability: 0.0,
    };
}

/// Highest fundamental the estimator searches for
const MAX_FREQUENCY_HZ: f32 = 4200.0;

/// Streaming YIN estimator with pre-planned FFTs and reusable scratch buffers
pub struct PitchEstimator {
    sample_rate: u32,
    frame_size: usize,
    threshold: f32,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    frame_spectrum: Vec<Complex<f32>>,
    half_spectrum: Vec<Complex<f32>>,
    cmnd: Vec<f32>,
}

impl PitchEstimator {
    /// Create an estimator for frames of `frame_size` samples
    ///
    /// # Arguments
    /// * `sample_rate` - Sample rate of the frames in Hz
    /// * `frame_size` - Samples per frame (4096 for the tuner)
    /// * `threshold` - YIN absolute threshold, typically 0.10-0.20
    pub fn new(sample_rate: u32, frame_size: usize, threshold: f32) -> Self {
        let frame_size = frame_size.max(4);
        let mut planner = FftPlanner::new();
        Self {
            sample_rate,
            frame_size,
            threshold,
            forward: planner.plan_fft_forward(frame_size),
            inverse: planner.plan_fft_inverse(frame_size),
            frame_spectrum: vec![Complex::new(0.0, 0.0); frame_size],
            half_spectrum: vec![Complex::new(0.0, 0.0); frame_size],
            cmnd: vec![1.0; frame_size / 2],
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Estimate the fundamental of `frame`
    ///
    /// Frames shorter than the configured size are zero-padded; longer ones
    /// are truncated.
    pub fn estimate(&mut self, frame: &[f32]) -> PitchEstimate {
        let n = self.frame_size;
        let w = n / 2;
        let sample = |i: usize| frame.get(i).copied().unwrap_or(0.0);

        for i in 0..n {
            let x = sample(i);
            self.frame_spectrum[i] = Complex::new(x, 0.0);
            self.half_spectrum[i] = Complex::new(if i < w { x } else { 0.0 }, 0.0);
        }

        self.forward.process(&mut self.frame_spectrum);
        self.forward.process(&mut self.half_spectrum);

        // Cross-correlation spectrum, reusing the frame buffer
        for (full, half) in self
            .frame_spectrum
            .iter_mut()
            .zip(self.half_spectrum.iter())
        {
            *full *= half.conj();
        }
        self.inverse.process(&mut self.frame_spectrum);
        let scale = 1.0 / n as f32;

        let energy_head: f32 = (0..w).map(|j| sample(j) * sample(j)).sum();
        let mut energy_lag = energy_head;

        self.cmnd[0] = 1.0;
        let mut running_sum = 0.0f32;
        for tau in 1..w {
            energy_lag += sample(tau + w - 1) * sample(tau + w - 1) - sample(tau - 1) * sample(tau - 1);
            let r = self.frame_spectrum[tau].re * scale;
            let d = (energy_head + energy_lag - 2.0 * r).max(0.0);
            running_sum += d;
            self.cmnd[tau] = if running_sum > 0.0 {
                d * tau as f32 / running_sum
            } else {
                1.0
            };
        }

        let min_tau = ((self.sample_rate as f32 / MAX_FREQUENCY_HZ) as usize).max(2);
        let Some(tau) = self.absolute_threshold(min_tau, w) else {
            return PitchEstimate::NONE;
        };

        let refined = self.parabolic_interpolation(tau, w);
        if refined <= 0.0 {
            return PitchEstimate::NONE;
        }

        PitchEstimate {
            frequency_hz: self.sample_rate as f32 / refined,
            probability: (1.0 - self.cmnd[tau]).clamp(0.0, 1.0),
        }
    }

    /// First dip below the threshold, followed down to its local minimum
    fn absolute_threshold(&self, min_tau: usize, w: usize) -> Option<usize> {
        let mut tau = min_tau;
        while tau < w {
            if self.cmnd[tau] < self.threshold {
                while tau + 1 < w && self.cmnd[tau + 1] < self.cmnd[tau] {
                    tau += 1;
                }
                return Some(tau);
            }
            tau += 1;
        }
        None
    }

    fn parabolic_interpolation(&self, tau: usize, w: usize) -> f32 {
        if tau == 0 || tau + 1 >= w {
            return tau as f32;
        }
        let s0 = self.cmnd[tau - 1];
        let s1 = self.cmnd[tau];
        let s2 = self.cmnd[tau + 1];
        let denom = s0 - 2.0 * s1 + s2;
        if denom.abs() < 1e-12 {
            tau as f32
        } else {
            tau as f32 + 0.5 * (s0 - s2) / denom
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sine(frequency: f32, len: usize, sample_rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| 0.6 * (2.0 * std::f32::consts::PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_detects_concert_a() {
        let mut estimator = PitchEstimator::new(44_100, 4096, 0.20);
        let estimate = estimator.estimate(&sine(440.0, 4096, 44_100));
        assert!(
            (estimate.frequency_hz - 440.0).abs() < 1.0,
            "got {}",
            estimate.frequency_hz
        );
        assert!(estimate.probability > 0.85);
    }

    #[test]
    fn test_detects_low_e_string() {
        let mut estimator = PitchEstimator::new(44_100, 4096, 0.20);
        let estimate = estimator.estimate(&sine(82.41, 4096, 44_100));
        assert!(
            (estimate.frequency_hz - 82.41).abs() < 0.5,
            "got {}",
            estimate.frequency_hz
        );
        assert!(estimate.probability > 0.85);
    }

    #[test]
    fn test_harmonic_tone_reports_fundamental() {
        let sr = 44_100;
        let fundamental = 196.0;
        let frame: Vec<f32> = (0..4096)
            .map(|i| {
                let t = i as f32 / sr as f32;
                (1..=4)
                    .map(|h| {
                        (2.0 * std::f32::consts::PI * fundamental * h as f32 * t).sin()
                            / h as f32
                    })
                    .sum::<f32>()
                    * 0.3
            })
            .collect();

        let mut estimator = PitchEstimator::new(sr, 4096, 0.20);
        let estimate = estimator.estimate(&frame);
        assert!((estimate.frequency_hz - fundamental).abs() < 1.0);
    }

    #[test]
    fn test_silence_has_no_pitch() {
        let mut estimator = PitchEstimator::new(44_100, 4096, 0.20);
        let estimate = estimator.estimate(&vec![0.0; 4096]);
        assert_eq!(estimate, PitchEstimate::NONE);
    }

    #[test]
    fn test_noise_is_not_trusted() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise: Vec<f32> = (0..4096).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let mut estimator = PitchEstimator::new(44_100, 4096, 0.20);
        assert!(estimator.estimate(&noise).probability <= 0.85);
    }

    #[test]
    fn test_estimator_is_reusable() {
        let mut estimator = PitchEstimator::new(44_100, 4096, 0.20);
        let first = estimator.estimate(&sine(330.0, 4096, 44_100));
        estimator.estimate(&vec![0.0; 4096]);
        let again = estimator.estimate(&sine(330.0, 4096, 44_100));
        assert!((first.frequency_hz - again.frequency_hz).abs() < 1e-3);
    }
}
