//! Audio front-end constants.

// Fixed by the Qwen3-ASR feature extractor.
pub const SAMPLE_RATE_HZ: u32 = 16_000;
pub const MEL_BINS: usize = 128;
pub const HOP_LENGTH: usize = 160; // 10ms @ 16kHz
pub const WINDOW_SIZE: usize = 400; // 25ms @ 16kHz
pub const N_FFT: usize = 512;
pub const N_FREQ: usize = N_FFT / 2 + 1; // 257
