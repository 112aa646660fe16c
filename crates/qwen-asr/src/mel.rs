//! Log-mel spectrogram front-end.
//!
//! Matches the Qwen3-ASR (Whisper-style) feature extractor: periodic Hann
//! window of 400 samples, hop 160, 512-point real FFT, 128 Slaney-normalized
//! triangular mel filters over 0..8 kHz, `log10` with a 1e-10 floor, clip to
//! `max - 8` and map through `(x + 4) / 4`.

use std::sync::Arc;

use rustfft::{FftPlanner, num_complex::Complex};

use crate::constants::{HOP_LENGTH, MEL_BINS, N_FFT, N_FREQ, SAMPLE_RATE_HZ, WINDOW_SIZE};
use crate::error::{Error, Result};

#[inline]
fn hertz_to_mel(freq: f32) -> f32 {
    // Slaney-style mel scale.
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    // ln(6.4) / 27
    const LOGSTEP: f32 = 0.068_751_78;

    if freq < MIN_LOG_HZ {
        freq / F_SP
    } else {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

#[inline]
fn mel_to_hertz(mel: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_78;

    if mel < MIN_LOG_MEL {
        F_SP * mel
    } else {
        MIN_LOG_HZ * (LOGSTEP * (mel - MIN_LOG_MEL)).exp()
    }
}

/// Triangular Slaney-normalized filterbank, `[MEL_BINS * N_FREQ]` row-major.
fn build_mel_filters() -> Vec<f32> {
    let mut fft_freqs = vec![0.0f32; N_FREQ];
    for (f, v) in fft_freqs.iter_mut().enumerate() {
        *v = (f as f32) * (SAMPLE_RATE_HZ as f32) / (N_FFT as f32);
    }

    let mel_min = hertz_to_mel(0.0);
    let mel_max = hertz_to_mel((SAMPLE_RATE_HZ as f32) / 2.0);

    let mut filter_freqs = vec![0.0f32; MEL_BINS + 2];
    for (i, v) in filter_freqs.iter_mut().enumerate() {
        let mel = mel_min + (mel_max - mel_min) * (i as f32) / ((MEL_BINS + 1) as f32);
        *v = mel_to_hertz(mel);
    }

    let mut filters = vec![0.0f32; MEL_BINS * N_FREQ];
    for m in 0..MEL_BINS {
        let lower = filter_freqs[m];
        let center = filter_freqs[m + 1];
        let upper = filter_freqs[m + 2];
        let enorm = 2.0 / (upper - lower).max(1e-6);

        for f in 0..N_FREQ {
            let freq = fft_freqs[f];
            let val = if freq >= lower && freq <= center && center > lower {
                (freq - lower) / (center - lower)
            } else if freq > center && freq <= upper && upper > center {
                (upper - freq) / (upper - center)
            } else {
                0.0
            };
            filters[m * N_FREQ + f] = val * enorm;
        }
    }
    filters
}

fn build_hann_window() -> [f32; WINDOW_SIZE] {
    let mut w = [0.0f32; WINDOW_SIZE];
    for (i, wi) in w.iter_mut().enumerate() {
        // Periodic Hann: 0.5*(1-cos(2*pi*i/N))
        let angle = 2.0 * std::f32::consts::PI * (i as f32) / (WINDOW_SIZE as f32);
        *wi = 0.5 * (1.0 - angle.cos());
    }
    w
}

/// Mel front-end with a cached FFT plan, window, and filterbank.
pub struct MelFrontend {
    fft: Arc<dyn rustfft::Fft<f32>>,
    window: [f32; WINDOW_SIZE],
    filters: Vec<f32>, // [MEL_BINS * N_FREQ]
}

impl std::fmt::Debug for MelFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelFrontend")
            .field("n_fft", &N_FFT)
            .field("mel_bins", &MEL_BINS)
            .finish()
    }
}

impl Default for MelFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl MelFrontend {
    #[must_use]
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(N_FFT),
            window: build_hann_window(),
            filters: build_mel_filters(),
        }
    }

    /// Compute the log-mel spectrogram of a mono waveform.
    ///
    /// `sample_rate_hz` is the caller's declared rate; anything other than
    /// 16 kHz is rejected rather than silently mis-scaled. Returns
    /// `(mel, n_frames)` where `n_frames = ceil(len / hop)`, the tail frame
    /// zero-padded, and `mel[bin * n_frames + frame]`.
    pub fn compute(&self, samples: &[f32], sample_rate_hz: u32) -> Result<(Vec<f32>, usize)> {
        if sample_rate_hz != SAMPLE_RATE_HZ {
            return Err(Error::InvalidSampleRate(sample_rate_hz));
        }

        let n_frames = samples.len().div_ceil(HOP_LENGTH);
        if n_frames == 0 {
            return Ok((Vec::new(), 0));
        }

        let mut mel = Vec::new();
        mel.try_reserve_exact(MEL_BINS * n_frames)
            .map_err(|_| Error::OutOfMemory)?;
        mel.resize(MEL_BINS * n_frames, 0.0f32);
        let mut fft_buf = [Complex::new(0.0f32, 0.0f32); N_FFT];
        let mut power = [0.0f32; N_FREQ];

        for frame in 0..n_frames {
            let start = frame * HOP_LENGTH;
            for (i, slot) in fft_buf.iter_mut().enumerate() {
                // Window of 400 samples, zero-padded to the 512-point FFT.
                let s = if i < WINDOW_SIZE {
                    samples.get(start + i).copied().unwrap_or(0.0) * self.window[i]
                } else {
                    0.0
                };
                *slot = Complex::new(s, 0.0);
            }
            self.fft.process(&mut fft_buf);

            for (k, p) in power.iter_mut().enumerate() {
                let c = fft_buf[k];
                *p = c.re * c.re + c.im * c.im;
            }

            for m in 0..MEL_BINS {
                let filt = &self.filters[m * N_FREQ..(m + 1) * N_FREQ];
                let mut sum = 0.0f32;
                for (k, &f) in filt.iter().enumerate() {
                    sum += f * power[k];
                }
                mel[m * n_frames + frame] = sum.max(1e-10).log10();
            }
        }

        // Whisper normalization: clip to global max - 8, then (x + 4) / 4.
        let max_val = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min_val = max_val - 8.0;
        for v in &mut mel {
            *v = (v.max(min_val) + 4.0) / 4.0;
        }

        Ok((mel, n_frames))
    }
}

/// One-shot convenience over [`MelFrontend::compute`]; builds the window,
/// filterbank and FFT plan per call.
pub fn mel_spectrogram(samples: &[f32], sample_rate_hz: u32) -> Result<(Vec<f32>, usize)> {
    MelFrontend::new().compute(samples, sample_rate_hz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_is_ceil_of_hop_division() {
        let fe = MelFrontend::new();
        for &n in &[0usize, 1, 159, 160, 161, 400, 16_000] {
            let samples = vec![0.0f32; n];
            let (mel, frames) = fe.compute(&samples, SAMPLE_RATE_HZ).expect("mel");
            assert_eq!(frames, n.div_ceil(HOP_LENGTH), "n={n}");
            assert_eq!(mel.len(), frames * MEL_BINS, "n={n}");
            assert!(mel.iter().all(|v| v.is_finite()), "n={n}");
        }
    }

    #[test]
    fn rejects_non_16k_sample_rates() {
        let fe = MelFrontend::new();
        let samples = vec![0.0f32; 441];
        for &rate in &[8_000u32, 22_050, 44_100, 48_000] {
            match fe.compute(&samples, rate) {
                Err(Error::InvalidSampleRate(r)) => assert_eq!(r, rate),
                other => panic!("expected InvalidSampleRate for {rate}, got {other:?}"),
            }
        }
    }

    #[test]
    fn silence_maps_to_constant_floor() {
        let fe = MelFrontend::new();
        let (mel, frames) = fe
            .compute(&vec![0.0f32; 1600], SAMPLE_RATE_HZ)
            .expect("mel");
        assert_eq!(frames, 10);
        // All-zero input: every bin sits at log10(1e-10) = -10, so the
        // global max equals the floor and (x+4)/4 = -1.5 everywhere.
        for &v in &mel {
            assert!((v + 1.5).abs() < 1e-6, "got {v}");
        }
    }

    #[test]
    fn tone_concentrates_energy() {
        let fe = MelFrontend::new();
        let samples: Vec<f32> = (0..3200)
            .map(|i| {
                (2.0 * std::f32::consts::PI * 1000.0 * (i as f32) / (SAMPLE_RATE_HZ as f32)).sin()
            })
            .collect();
        let (mel, frames) = fe.compute(&samples, SAMPLE_RATE_HZ).expect("mel");

        // Pick an interior frame and check the loudest bin clearly beats the
        // quietest one.
        let frame = frames / 2;
        let column: Vec<f32> = (0..MEL_BINS).map(|m| mel[m * frames + frame]).collect();
        let max = column.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = column.iter().copied().fold(f32::INFINITY, f32::min);
        assert!(max - min > 0.5, "tone should not be flat: max={max} min={min}");
    }
}
