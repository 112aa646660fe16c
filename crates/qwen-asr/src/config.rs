//! Model configuration file (`config.json`) parsing.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::constants::MEL_BINS;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub audio_config: AudioConfig,
    pub text_config: TextConfig,
    #[serde(default)]
    pub quantization: Option<QuantizationConfig>,
}

/// Audio encoder hyperparameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_mel_bins")]
    pub num_mel_bins: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    /// Stride of each of the two convolution stem layers.
    #[serde(default = "default_conv_stride")]
    pub conv_stride: usize,
    /// Maximum post-stem sequence length the scratch buffers are sized for.
    pub max_source_positions: usize,
    #[serde(default = "default_encoder_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub rms_norm_eps: f32,
}

/// Text decoder hyperparameters (Qwen3 family).
#[derive(Debug, Clone, Deserialize)]
pub struct TextConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_decoder_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
}

/// Group-wise int8 quantization metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationConfig {
    #[serde(default = "default_group_size")]
    pub group_size: usize,
}

fn default_mel_bins() -> usize {
    MEL_BINS
}

fn default_conv_stride() -> usize {
    2
}

fn default_encoder_rope_theta() -> f32 {
    10_000.0
}

fn default_decoder_rope_theta() -> f32 {
    1_000_000.0
}

fn default_norm_eps() -> f32 {
    1e-6
}

fn default_group_size() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parse config.json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let json = std::fs::read_to_string(path_ref)
            .with_context(|| format!("read {}", path_ref.display()))?;
        Self::from_json_str(&json)
    }

    /// Total time downsampling of the convolution stem.
    pub fn encoder_stride(&self) -> usize {
        self.audio_config.conv_stride * self.audio_config.conv_stride
    }

    pub fn quant_group_size(&self) -> usize {
        self.quantization
            .as_ref()
            .map_or(default_group_size(), |q| q.group_size)
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio_config;
        let text = &self.text_config;

        anyhow::ensure!(
            audio.num_mel_bins == MEL_BINS,
            "num_mel_bins must be {MEL_BINS}, got {}",
            audio.num_mel_bins
        );
        anyhow::ensure!(audio.d_model > 0, "encoder d_model must be > 0");
        anyhow::ensure!(audio.encoder_layers > 0, "encoder_layers must be > 0");
        anyhow::ensure!(
            audio.encoder_attention_heads > 0
                && audio.d_model % audio.encoder_attention_heads == 0,
            "encoder heads must divide d_model"
        );
        anyhow::ensure!(
            audio.conv_stride > 0 && audio.conv_stride <= 3,
            "conv_stride must be in 1..=3 for the kernel-3 conv stem"
        );
        anyhow::ensure!(
            audio.max_source_positions > 0,
            "max_source_positions must be > 0"
        );

        anyhow::ensure!(text.hidden_size > 0, "decoder hidden_size must be > 0");
        anyhow::ensure!(text.num_hidden_layers > 0, "decoder layers must be > 0");
        anyhow::ensure!(
            text.num_attention_heads > 0 && text.num_key_value_heads > 0,
            "decoder head counts must be > 0"
        );
        anyhow::ensure!(
            text.num_attention_heads % text.num_key_value_heads == 0,
            "query heads must be divisible by KV head-groups"
        );
        anyhow::ensure!(
            text.num_attention_heads * text.head_dim == text.hidden_size,
            "num_attention_heads * head_dim must equal hidden_size"
        );
        anyhow::ensure!(text.vocab_size > 0, "vocab_size must be > 0");
        anyhow::ensure!(
            text.max_position_embeddings > 0,
            "max_position_embeddings must be > 0"
        );

        if let Some(q) = &self.quantization {
            anyhow::ensure!(q.group_size > 0, "quantization group_size must be > 0");
        }
        Ok(())
    }
}
