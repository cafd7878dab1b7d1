//! Tone synthesis - reference tones and clicks
//!
//! Pure, deterministic generators. Every function returns a freshly allocated
//! mono buffer in [-1.0, 1.0]; callers pre-render once and reuse the result.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

/// Number of samples covering `duration_ms`
pub fn sample_count(duration_ms: f32, sample_rate: u32) -> usize {
    (sample_rate as f32 * duration_ms.max(0.0) / 1000.0) as usize
}

/// Plucked-string reference tone
///
/// An ADSR envelope over a harmonic series whose upper partials die away
/// faster than the fundamental, with a short burst of noise at the attack
/// standing in for the pick.
///
/// # Arguments
/// * `frequency` - Fundamental in Hz
/// * `duration_ms` - Total length including release
/// * `sample_rate` - Output sample rate in Hz
pub fn pluck_tone(frequency: f32, duration_ms: f32, sample_rate: u32) -> Vec<f32> {
    const HARMONICS: usize = 6;
    const ATTACK_S: f32 = 0.005;
    const DECAY_S: f32 = 0.12;
    const SUSTAIN: f32 = 0.55;
    const RELEASE_S: f32 = 0.15;
    const NOISE_S: f32 = 0.012;
    const PEAK: f32 = 0.8;

    let len = sample_count(duration_ms, sample_rate);
    let sr = sample_rate.max(1) as f32;
    let total_s = len as f32 / sr;
    let release_start = (total_s - RELEASE_S).max(ATTACK_S + DECAY_S);

    // Fixed seed keeps the function pure
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut samples: Vec<f32> = (0..len)
        .map(|i| {
            let t = i as f32 / sr;

            let envelope = if t < ATTACK_S {
                t / ATTACK_S
            } else if t < ATTACK_S + DECAY_S {
                1.0 - (1.0 - SUSTAIN) * (t - ATTACK_S) / DECAY_S
            } else if t < release_start {
                SUSTAIN
            } else {
                SUSTAIN * (1.0 - (t - release_start) / RELEASE_S).max(0.0)
            };

            let tone: f32 = (1..=HARMONICS)
                .map(|h| {
                    let h = h as f32;
                    let partial_decay = (-1.5 * h * t).exp();
                    (2.0 * PI * frequency * h * t).sin() * partial_decay / h
                })
                .sum();

            let noise = if t < NOISE_S {
                rng.gen_range(-1.0..1.0) * 0.3 * (1.0 - t / NOISE_S)
            } else {
                0.0
            };

            (tone + noise) * envelope
        })
        .collect();

    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 0.0 {
        let gain = PEAK / peak;
        for s in &mut samples {
            *s *= gain;
        }
    }
    samples
}

/// Calibration click: pure sine with linear fade in and out
pub fn calibration_click(frequency: f32, duration_ms: f32, sample_rate: u32) -> Vec<f32> {
    const AMPLITUDE: f32 = 0.8;

    let len = sample_count(duration_ms, sample_rate);
    let sr = sample_rate.max(1) as f32;
    let fade = (len / 10).max(1);

    (0..len)
        .map(|i| {
            let ramp = if i < fade {
                i as f32 / fade as f32
            } else if i >= len - fade {
                (len - 1 - i) as f32 / fade as f32
            } else {
                1.0
            };
            (2.0 * PI * frequency * i as f32 / sr).sin() * AMPLITUDE * ramp
        })
        .collect()
}

/// Metronome click: exponentially decaying sine
pub fn metronome_click(frequency: f32, duration_ms: f32, sample_rate: u32) -> Vec<f32> {
    const AMPLITUDE: f32 = 0.7;

    let len = sample_count(duration_ms, sample_rate);
    let sr = sample_rate.max(1) as f32;
    // About -43 dB by the end of the click
    let decay_rate = 5.0 / (duration_ms.max(1.0) / 1000.0);

    (0..len)
        .map(|i| {
            let t = i as f32 / sr;
            (2.0 * PI * frequency * t).sin() * (-decay_rate * t).exp() * AMPLITUDE
        })
        .collect()
}
