//! Inference context and transcription pipeline.
//!
//! [`Qwen3Asr`] owns the configuration, all weight tensors, the tokenizer,
//! the KV caches and the performance counters. One transcription call runs
//! the serial pipeline: mel front-end, encoder, cross-attention projection,
//! decoder prefill, greedy generation, detokenization.

use std::path::Path;
use std::time::Instant;

use anyhow::Context as _;

use crate::config::ModelConfig;
use crate::constants::SAMPLE_RATE_HZ;
use crate::decoder;
use crate::encoder;
use crate::error::{Error, Result};
use crate::kernels::argmax;
use crate::kv::{CrossKv, KvCache};
use crate::mel::MelFrontend;
use crate::model::{ModelWeights, weights_path};
use crate::tokenizer::Tokenizer;
use crate::weights::WeightStore;

const DEFAULT_MAX_NEW_TOKENS: usize = 1024;

/// Stop after this many identical consecutive tokens; the model has
/// collapsed into a loop and will not recover under greedy decoding.
const REPETITION_LIMIT: usize = 10;

/// Per-call timing and token counters, reset at the start of every
/// [`Qwen3Asr::transcribe`] call.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfCounters {
    pub total_ms: f64,
    pub encode_ms: f64,
    pub decode_ms: f64,
    pub audio_ms: f64,
    pub text_tokens: usize,
}

pub struct Qwen3Asr {
    config: ModelConfig,
    weights: ModelWeights,
    tokenizer: Tokenizer,
    mel: MelFrontend,
    kv: KvCache,
    cross: CrossKv,
    force_language: Option<String>,
    prompt: Option<String>,
    verbose: bool,
    max_new_tokens: usize,
    perf: PerfCounters,
}

/// `[<|bos|>, <|system|>, prompt..., <|assistant|>, <|lang_xx|>?]`
fn build_prompt_ids(
    tokenizer: &Tokenizer,
    prompt: Option<&str>,
    language_id: Option<u32>,
) -> Vec<u32> {
    let mut ids = vec![tokenizer.bos_id(), tokenizer.system_id()];
    if let Some(text) = prompt {
        ids.extend(tokenizer.encode(text));
    }
    ids.push(tokenizer.assistant_id());
    if let Some(lang) = language_id {
        ids.push(lang);
    }
    ids
}

impl Qwen3Asr {
    /// Load a model directory (`config.json`, `vocab.json`, safetensors).
    pub fn load(model_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = model_dir.as_ref();
        let config = ModelConfig::from_path(dir.join("config.json")).context("load config.json")?;
        let tokenizer = Tokenizer::from_path(dir.join("vocab.json")).context("load vocab.json")?;

        let store = WeightStore::open(weights_path(dir)?, config.quant_group_size())?;
        let weights = ModelWeights::load(&store, &config)?;

        let text = &config.text_config;
        let kv = KvCache::new(
            text.num_hidden_layers,
            text.num_key_value_heads,
            text.head_dim,
            text.max_position_embeddings,
        );
        let cross = CrossKv::new(text.num_hidden_layers);

        Ok(Self {
            config,
            weights,
            tokenizer,
            mel: MelFrontend::new(),
            kv,
            cross,
            force_language: None,
            prompt: None,
            verbose: false,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            perf: PerfCounters::default(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn perf(&self) -> PerfCounters {
        self.perf
    }

    pub fn kv_cache_len(&self) -> usize {
        self.kv.len()
    }

    /// Write a per-call timing summary to stderr after each transcription.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Hard cap on generated tokens per call.
    pub fn set_max_new_tokens(&mut self, n: usize) {
        self.max_new_tokens = n.max(1);
    }

    /// Force the transcription language, or `None` to let the model pick.
    ///
    /// Rejects unsupported languages; the previous setting is kept.
    pub fn set_force_language(&mut self, language: Option<&str>) -> Result<()> {
        match language {
            None => {
                self.force_language = None;
                Ok(())
            }
            Some(lang) => {
                if self.tokenizer.language_id(lang).is_none() {
                    return Err(Error::UnsupportedLanguage(lang.to_string()));
                }
                self.force_language = Some(lang.to_string());
                Ok(())
            }
        }
    }

    /// Optional system prompt inserted into the decoder's system block.
    pub fn set_prompt(&mut self, prompt: Option<&str>) {
        self.prompt = prompt.map(str::to_string);
    }

    pub fn supported_languages_csv(&self) -> String {
        self.tokenizer.supported_languages_csv()
    }

    /// Compute the log-mel spectrogram of a mono waveform. Rejects any
    /// declared rate other than 16 kHz.
    pub fn mel_spectrogram(&self, samples: &[f32], sample_rate_hz: u32) -> Result<(Vec<f32>, usize)> {
        self.mel.compute(samples, sample_rate_hz)
    }

    /// Run only the audio encoder. Returns `(hidden, out_len)` with hidden
    /// states laid out `[out_len, d_model]`.
    pub fn encoder_forward(&self, mel: &[f32], n_frames: usize) -> Result<(Vec<f32>, usize)> {
        encoder::forward(&self.config.audio_config, &self.weights.encoder, mel, n_frames)
    }

    /// Transcribe a mono 16 kHz waveform to text.
    ///
    /// Resets the KV cache and the perf counters; the returned string holds
    /// only non-special generated tokens.
    pub fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
        let t_total = Instant::now();
        self.perf = PerfCounters::default();
        self.perf.audio_ms = samples.len() as f64 * 1000.0 / f64::from(SAMPLE_RATE_HZ);

        // Any cache state left by a previous (possibly failed) call is
        // invalid for this utterance.
        self.kv.reset();

        let t_encode = Instant::now();
        let (mel, n_frames) = self.mel.compute(samples, SAMPLE_RATE_HZ)?;
        let (hidden, enc_len) =
            encoder::forward(&self.config.audio_config, &self.weights.encoder, &mel, n_frames)?;
        self.perf.encode_ms = t_encode.elapsed().as_secs_f64() * 1000.0;

        let t_decode = Instant::now();
        let text = self.decode_utterance(&hidden, enc_len)?;
        self.perf.decode_ms = t_decode.elapsed().as_secs_f64() * 1000.0;
        self.perf.total_ms = t_total.elapsed().as_secs_f64() * 1000.0;

        if self.verbose {
            let rt = if self.perf.audio_ms > 0.0 {
                self.perf.total_ms / self.perf.audio_ms
            } else {
                0.0
            };
            eprintln!(
                "qwen-asr: encode={:7.1} ms  decode={:7.1} ms  total={:7.1} ms  tokens={}  rt={:.2}x",
                self.perf.encode_ms,
                self.perf.decode_ms,
                self.perf.total_ms,
                self.perf.text_tokens,
                rt
            );
        }
        Ok(text)
    }

    /// Prefill the prompt, generate greedily, detokenize.
    fn decode_utterance(&mut self, enc_hidden: &[f32], enc_len: usize) -> Result<String> {
        let text = &self.config.text_config;
        decoder::prepare_cross(
            text,
            &self.weights.decoder,
            enc_hidden,
            enc_len,
            self.config.audio_config.d_model,
            &mut self.cross,
        );

        let language_id = self
            .force_language
            .as_deref()
            .and_then(|lang| self.tokenizer.language_id(lang));
        let prompt_ids = build_prompt_ids(&self.tokenizer, self.prompt.as_deref(), language_id);
        if prompt_ids.len() >= self.kv.max_len() {
            return Err(Error::InvalidArgument(format!(
                "prompt of {} tokens leaves no room in a context of {}",
                prompt_ids.len(),
                self.kv.max_len()
            )));
        }

        // Prefill: the logits of the last prompt token seed generation.
        let mut logits = Vec::new();
        for &id in &prompt_ids {
            logits = decoder::forward_step(
                text,
                &self.weights.decoder,
                &mut self.kv,
                &self.cross,
                id,
            );
        }

        let mut generated: Vec<u32> = Vec::new();
        let mut repeat_run = 0usize;
        for _ in 0..self.max_new_tokens {
            let token = argmax(&logits) as u32;
            if token == self.tokenizer.eos_id() {
                break;
            }

            match generated.last() {
                Some(&last) if last == token => repeat_run += 1,
                _ => repeat_run = 1,
            }
            if repeat_run >= REPETITION_LIMIT {
                break;
            }

            // Special tokens (a leading language tag, role markers) stay in
            // the KV history but are stripped from the transcript.
            generated.push(token);

            if self.kv.is_full() {
                break;
            }
            logits = decoder::forward_step(
                text,
                &self.weights.decoder,
                &mut self.kv,
                &self.cross,
                token,
            );
        }

        self.perf.text_tokens = generated
            .iter()
            .filter(|&&id| !self.tokenizer.is_special(id))
            .count();
        Ok(self.tokenizer.decode(&generated))
    }
}

/// Size the process-wide worker pool; `0` selects one worker per CPU.
/// Reliable only before the first inference call.
pub fn set_threads(n: usize) {
    crate::kernels::set_threads(n);
}
