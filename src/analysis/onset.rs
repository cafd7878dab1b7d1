// OnsetDetector - spectral flux-based onset detection
//
// This module implements offline onset detection over a whole recording
// using the spectral flux algorithm. It detects plucked/struck note onsets by
// analyzing changes in the frequency spectrum over time.
//
// Algorithm:
// 1. Compute 1024-point FFT with 50% overlap (hop = 512 samples)
// 2. Calculate Hann-windowed magnitude spectrum, normalized so a unit-variance
//    white noise frame has unit expected power per bin
// 3. Compute positive difference from previous frame: SF[k] = max(0, |X_t[k]| - |X_(t-1)[k]|)
// 4. Average across frequency bins: flux_t = mean(SF[k])
// 5. Peak pick: local maxima where flux_t > threshold
//
// Each onset is stamped at the centre of its analysis window and carries the
// flux value as its salience.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::OnsetDetectionConfig;

/// A detected note onset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Onset {
    pub time_seconds: f64,
    pub salience: f64,
}

/// OnsetDetector uses spectral flux algorithm to detect sound onsets
pub struct OnsetDetector {
    fft: Arc<dyn Fft<f32>>,
    sample_rate: u32,
    window_size: usize,
    hop_size: usize,
    threshold: f64,
    // Windowing function (Hann window)
    window: Vec<f32>,
    // 1 / sqrt(Σ w²)
    window_norm: f32,
}

impl OnsetDetector {
    /// Create a new OnsetDetector with the specified sample rate
    ///
    /// # Arguments
    /// * `sample_rate` - Audio sample rate in Hz (e.g., 44100)
    pub fn new(sample_rate: u32) -> Self {
        Self::with_config(sample_rate, &OnsetDetectionConfig::default())
    }

    /// Create a detector with explicit configuration parameters
    ///
    /// The peak threshold is clamped to [0.005, 0.4].
    pub fn with_config(sample_rate: u32, config: &OnsetDetectionConfig) -> Self {
        let window_size = config.window_size.max(2);
        let hop_size = config.hop_size.max(1);

        // Pre-compute Hann window to reduce spectral leakage
        let window: Vec<f32> = (0..window_size)
            .map(|i| {
                0.5 * (1.0
                    - ((2.0 * std::f32::consts::PI * i as f32) / (window_size as f32 - 1.0)).cos())
            })
            .collect();
        let energy: f32 = window.iter().map(|w| w * w).sum();

        Self {
            fft: FftPlanner::new().plan_fft_forward(window_size),
            sample_rate: sample_rate.max(1),
            window_size,
            hop_size,
            threshold: config.clamped_threshold(),
            window,
            window_norm: 1.0 / energy.sqrt(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Detect every onset in `audio`, in time order
    pub fn detect(&self, audio: &[f32]) -> Vec<Onset> {
        let flux = self.spectral_flux(audio);
        let half_window = self.window_size as f64 / 2.0;

        self.pick_peaks(&flux)
            .into_iter()
            .map(|frame| Onset {
                time_seconds: (frame as f64 * self.hop_size as f64 + half_window)
                    / self.sample_rate as f64,
                salience: flux[frame] as f64,
            })
            .collect()
    }

    /// Spectral flux for each overlapping window of `audio`
    pub fn spectral_flux(&self, audio: &[f32]) -> Vec<f32> {
        let bins = self.window_size / 2 + 1;
        let mut prev_spectrum = vec![0.0f32; bins];
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.window_size];
        let mut flux = Vec::new();

        let mut pos = 0;
        while pos + self.window_size <= audio.len() {
            let spectrum = self.compute_magnitude_spectrum(&audio[pos..pos + self.window_size], &mut buffer);
            flux.push(Self::compute_spectral_flux(&spectrum, &prev_spectrum));
            prev_spectrum = spectrum;
            pos += self.hop_size;
        }

        flux
    }

    /// Compute normalized magnitude spectrum using FFT
    ///
    /// # Returns
    /// Magnitude spectrum (size = window_size / 2 + 1)
    fn compute_magnitude_spectrum(&self, audio: &[f32], buffer: &mut [Complex<f32>]) -> Vec<f32> {
        for ((slot, sample), window_val) in buffer.iter_mut().zip(audio).zip(&self.window) {
            *slot = Complex::new(sample * window_val, 0.0);
        }

        self.fft.process(buffer);

        buffer[..self.window_size / 2 + 1]
            .iter()
            .map(|c| c.norm() * self.window_norm)
            .collect()
    }

    /// Mean positive spectral difference
    ///
    /// SF(t) = mean(max(0, |X(t)| - |X(t-1)|))
    fn compute_spectral_flux(spectrum: &[f32], prev_spectrum: &[f32]) -> f32 {
        if spectrum.is_empty() {
            return 0.0;
        }
        let total: f32 = spectrum
            .iter()
            .zip(prev_spectrum.iter())
            .map(|(curr, prev)| (curr - prev).max(0.0))
            .sum();
        total / spectrum.len() as f32
    }

    /// Indices of local maxima in `flux` that exceed the threshold
    ///
    /// The signal is treated as zero beyond both ends.
    fn pick_peaks(&self, flux: &[f32]) -> Vec<usize> {
        let threshold = self.threshold as f32;
        (0..flux.len())
            .filter(|&i| {
                let prev = if i > 0 { flux[i - 1] } else { 0.0 };
                let next = flux.get(i + 1).copied().unwrap_or(0.0);
                let curr = flux[i];
                curr > prev && curr >= next && curr > threshold
            })
            .collect()
    }
}
