//! Qwen3-ASR CPU inference engine.
//!
//! A from-scratch implementation of the Qwen3-ASR encoder-decoder speech
//! recognition pipeline: safetensors weight loading, byte-level BPE
//! tokenization, log-mel front-end, an audio encoder and a grouped-query
//! decoder with a KV cache, all on CPU `f32` kernels with runtime SIMD
//! dispatch and a rayon worker pool. Decoding is greedy and deterministic.
//!
//! ```no_run
//! use qwen_asr::Qwen3Asr;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut ctx = Qwen3Asr::load("models/qwen3-asr-0.6b")?;
//! ctx.set_force_language(Some("English"))?;
//! let samples: Vec<f32> = vec![0.0; 16_000]; // 1s of 16 kHz mono audio
//! let text = ctx.transcribe(&samples)?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod context;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod kernels;
pub mod kv;
pub mod mel;
pub mod model;
pub mod tokenizer;
pub mod weights;

pub use config::ModelConfig;
pub use context::{PerfCounters, Qwen3Asr, set_threads};
pub use error::Error;
pub use mel::mel_spectrogram;
pub use tokenizer::Tokenizer;
