//! Model weight layout.
//!
//! Maps the Qwen3-ASR safetensors naming scheme onto typed per-component
//! weight structs, validating every tensor's shape against the declared
//! configuration. Loading fails loudly on a missing or mis-shaped tensor.

use std::path::{Path, PathBuf};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::weights::{WeightStore, tensor_with_shape};

#[derive(Debug)]
pub struct EncoderBlockWeights {
    pub attn_norm: Vec<f32>,
    pub wq: Vec<f32>,
    pub bq: Vec<f32>,
    pub wk: Vec<f32>,
    pub bk: Vec<f32>,
    pub wv: Vec<f32>,
    pub bv: Vec<f32>,
    pub wo: Vec<f32>,
    pub bo: Vec<f32>,
    pub mlp_norm: Vec<f32>,
    pub w_gate: Vec<f32>,
    pub w_up: Vec<f32>,
    pub w_down: Vec<f32>,
}

#[derive(Debug)]
pub struct EncoderWeights {
    pub conv1_weight: Vec<f32>, // [d_e, mel_bins, 3]
    pub conv1_bias: Vec<f32>,
    pub conv2_weight: Vec<f32>, // [d_e, d_e, 3]
    pub conv2_bias: Vec<f32>,
    pub blocks: Vec<EncoderBlockWeights>,
    pub final_norm: Vec<f32>,
}

#[derive(Debug)]
pub struct DecoderBlockWeights {
    pub self_attn_norm: Vec<f32>,
    pub wq: Vec<f32>, // [q_heads*head_dim, d_d]
    pub wk: Vec<f32>, // [kv_heads*head_dim, d_d]
    pub wv: Vec<f32>,
    pub wo: Vec<f32>, // [d_d, q_heads*head_dim]
    pub q_norm: Vec<f32>, // [head_dim]
    pub k_norm: Vec<f32>, // [head_dim]
    pub cross_attn_norm: Vec<f32>,
    pub cwq: Vec<f32>, // [q_heads*head_dim, d_d]
    pub cwk: Vec<f32>, // [kv_heads*head_dim, d_e]
    pub cwv: Vec<f32>,
    pub cwo: Vec<f32>,
    pub mlp_norm: Vec<f32>,
    pub w_gate: Vec<f32>,
    pub w_up: Vec<f32>,
    pub w_down: Vec<f32>,
}

#[derive(Debug)]
pub struct DecoderWeights {
    pub embed_tokens: Vec<f32>, // [vocab, d_d]
    pub blocks: Vec<DecoderBlockWeights>,
    pub final_norm: Vec<f32>,
    /// `None` when the vocabulary projection is tied to `embed_tokens`.
    pub lm_head: Option<Vec<f32>>,
}

#[derive(Debug)]
pub struct ModelWeights {
    pub encoder: EncoderWeights,
    pub decoder: DecoderWeights,
}

/// Resolve the safetensors file inside a model directory: `model.safetensors`
/// if present, otherwise a single `*.safetensors` file.
pub fn weights_path(dir: &Path) -> Result<PathBuf> {
    let canonical = dir.join("model.safetensors");
    if canonical.exists() {
        return Ok(canonical);
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(dir.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    candidates.sort();

    match candidates.len() {
        0 => Err(Error::FileNotFound(canonical)),
        1 => Ok(candidates.remove(0)),
        n => Err(Error::InvalidArgument(format!(
            "{n} safetensors files in {}; expected one",
            dir.display()
        ))),
    }
}

impl ModelWeights {
    pub fn load(store: &WeightStore, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            encoder: load_encoder(store, config)?,
            decoder: load_decoder(store, config)?,
        })
    }
}

fn load_encoder(store: &WeightStore, config: &ModelConfig) -> Result<EncoderWeights> {
    let audio = &config.audio_config;
    let d = audio.d_model;
    let mel = audio.num_mel_bins;
    let ffn = audio.encoder_ffn_dim;

    let mut blocks = Vec::with_capacity(audio.encoder_layers);
    for i in 0..audio.encoder_layers {
        let p = format!("encoder.blocks.{i}");
        blocks.push(EncoderBlockWeights {
            attn_norm: tensor_with_shape(store, &format!("{p}.attn_norm.weight"), &[d])?,
            wq: tensor_with_shape(store, &format!("{p}.attn.q_proj.weight"), &[d, d])?,
            bq: tensor_with_shape(store, &format!("{p}.attn.q_proj.bias"), &[d])?,
            wk: tensor_with_shape(store, &format!("{p}.attn.k_proj.weight"), &[d, d])?,
            bk: tensor_with_shape(store, &format!("{p}.attn.k_proj.bias"), &[d])?,
            wv: tensor_with_shape(store, &format!("{p}.attn.v_proj.weight"), &[d, d])?,
            bv: tensor_with_shape(store, &format!("{p}.attn.v_proj.bias"), &[d])?,
            wo: tensor_with_shape(store, &format!("{p}.attn.out_proj.weight"), &[d, d])?,
            bo: tensor_with_shape(store, &format!("{p}.attn.out_proj.bias"), &[d])?,
            mlp_norm: tensor_with_shape(store, &format!("{p}.mlp_norm.weight"), &[d])?,
            w_gate: tensor_with_shape(store, &format!("{p}.mlp.gate_proj.weight"), &[ffn, d])?,
            w_up: tensor_with_shape(store, &format!("{p}.mlp.up_proj.weight"), &[ffn, d])?,
            w_down: tensor_with_shape(store, &format!("{p}.mlp.down_proj.weight"), &[d, ffn])?,
        });
    }

    Ok(EncoderWeights {
        conv1_weight: tensor_with_shape(store, "encoder.conv1.weight", &[d, mel, 3])?,
        conv1_bias: tensor_with_shape(store, "encoder.conv1.bias", &[d])?,
        conv2_weight: tensor_with_shape(store, "encoder.conv2.weight", &[d, d, 3])?,
        conv2_bias: tensor_with_shape(store, "encoder.conv2.bias", &[d])?,
        blocks,
        final_norm: tensor_with_shape(store, "encoder.norm.weight", &[d])?,
    })
}

fn load_decoder(store: &WeightStore, config: &ModelConfig) -> Result<DecoderWeights> {
    let text = &config.text_config;
    let d_e = config.audio_config.d_model;
    let d = text.hidden_size;
    let hd = text.head_dim;
    let q_dim = text.num_attention_heads * hd;
    let kv_dim = text.num_key_value_heads * hd;
    let ffn = text.intermediate_size;
    let vocab = text.vocab_size;

    let mut blocks = Vec::with_capacity(text.num_hidden_layers);
    for i in 0..text.num_hidden_layers {
        let p = format!("decoder.blocks.{i}");
        blocks.push(DecoderBlockWeights {
            self_attn_norm: tensor_with_shape(store, &format!("{p}.self_attn_norm.weight"), &[d])?,
            wq: tensor_with_shape(store, &format!("{p}.self_attn.q_proj.weight"), &[q_dim, d])?,
            wk: tensor_with_shape(store, &format!("{p}.self_attn.k_proj.weight"), &[kv_dim, d])?,
            wv: tensor_with_shape(store, &format!("{p}.self_attn.v_proj.weight"), &[kv_dim, d])?,
            wo: tensor_with_shape(store, &format!("{p}.self_attn.o_proj.weight"), &[d, q_dim])?,
            q_norm: tensor_with_shape(store, &format!("{p}.self_attn.q_norm.weight"), &[hd])?,
            k_norm: tensor_with_shape(store, &format!("{p}.self_attn.k_norm.weight"), &[hd])?,
            cross_attn_norm: tensor_with_shape(
                store,
                &format!("{p}.cross_attn_norm.weight"),
                &[d],
            )?,
            cwq: tensor_with_shape(store, &format!("{p}.cross_attn.q_proj.weight"), &[q_dim, d])?,
            cwk: tensor_with_shape(
                store,
                &format!("{p}.cross_attn.k_proj.weight"),
                &[kv_dim, d_e],
            )?,
            cwv: tensor_with_shape(
                store,
                &format!("{p}.cross_attn.v_proj.weight"),
                &[kv_dim, d_e],
            )?,
            cwo: tensor_with_shape(store, &format!("{p}.cross_attn.o_proj.weight"), &[d, q_dim])?,
            mlp_norm: tensor_with_shape(store, &format!("{p}.mlp_norm.weight"), &[d])?,
            w_gate: tensor_with_shape(store, &format!("{p}.mlp.gate_proj.weight"), &[ffn, d])?,
            w_up: tensor_with_shape(store, &format!("{p}.mlp.up_proj.weight"), &[ffn, d])?,
            w_down: tensor_with_shape(store, &format!("{p}.mlp.down_proj.weight"), &[d, ffn])?,
        });
    }

    let lm_head = if text.tie_word_embeddings {
        None
    } else {
        Some(tensor_with_shape(store, "lm_head.weight", &[vocab, d])?)
    };

    Ok(DecoderWeights {
        embed_tokens: tensor_with_shape(store, "decoder.embed_tokens.weight", &[vocab, d])?,
        blocks,
        final_norm: tensor_with_shape(store, "decoder.norm.weight", &[d])?,
        lm_head,
    })
}

/// All tensor names required by a configuration, with shapes. Used by the
/// loader tests and handy for checkpoint tooling.
pub fn required_tensors(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let audio = &config.audio_config;
    let text = &config.text_config;
    let d_e = audio.d_model;
    let mel = audio.num_mel_bins;
    let ffn_e = audio.encoder_ffn_dim;
    let d = text.hidden_size;
    let hd = text.head_dim;
    let q_dim = text.num_attention_heads * hd;
    let kv_dim = text.num_key_value_heads * hd;
    let ffn_d = text.intermediate_size;

    let mut out: Vec<(String, Vec<usize>)> = vec![
        ("encoder.conv1.weight".into(), vec![d_e, mel, 3]),
        ("encoder.conv1.bias".into(), vec![d_e]),
        ("encoder.conv2.weight".into(), vec![d_e, d_e, 3]),
        ("encoder.conv2.bias".into(), vec![d_e]),
        ("encoder.norm.weight".into(), vec![d_e]),
        ("decoder.embed_tokens.weight".into(), vec![text.vocab_size, d]),
        ("decoder.norm.weight".into(), vec![d]),
    ];

    for i in 0..audio.encoder_layers {
        let p = format!("encoder.blocks.{i}");
        out.push((format!("{p}.attn_norm.weight"), vec![d_e]));
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            out.push((format!("{p}.attn.{proj}.weight"), vec![d_e, d_e]));
            out.push((format!("{p}.attn.{proj}.bias"), vec![d_e]));
        }
        out.push((format!("{p}.mlp_norm.weight"), vec![d_e]));
        out.push((format!("{p}.mlp.gate_proj.weight"), vec![ffn_e, d_e]));
        out.push((format!("{p}.mlp.up_proj.weight"), vec![ffn_e, d_e]));
        out.push((format!("{p}.mlp.down_proj.weight"), vec![d_e, ffn_e]));
    }

    for i in 0..text.num_hidden_layers {
        let p = format!("decoder.blocks.{i}");
        out.push((format!("{p}.self_attn_norm.weight"), vec![d]));
        out.push((format!("{p}.self_attn.q_proj.weight"), vec![q_dim, d]));
        out.push((format!("{p}.self_attn.k_proj.weight"), vec![kv_dim, d]));
        out.push((format!("{p}.self_attn.v_proj.weight"), vec![kv_dim, d]));
        out.push((format!("{p}.self_attn.o_proj.weight"), vec![d, q_dim]));
        out.push((format!("{p}.self_attn.q_norm.weight"), vec![hd]));
        out.push((format!("{p}.self_attn.k_norm.weight"), vec![hd]));
        out.push((format!("{p}.cross_attn_norm.weight"), vec![d]));
        out.push((format!("{p}.cross_attn.q_proj.weight"), vec![q_dim, d]));
        out.push((format!("{p}.cross_attn.k_proj.weight"), vec![kv_dim, d_e]));
        out.push((format!("{p}.cross_attn.v_proj.weight"), vec![kv_dim, d_e]));
        out.push((format!("{p}.cross_attn.o_proj.weight"), vec![d, q_dim]));
        out.push((format!("{p}.mlp_norm.weight"), vec![d]));
        out.push((format!("{p}.mlp.gate_proj.weight"), vec![ffn_d, d]));
        out.push((format!("{p}.mlp.up_proj.weight"), vec![ffn_d, d]));
        out.push((format!("{p}.mlp.down_proj.weight"), vec![d, ffn_d]));
    }

    if !text.tie_word_embeddings {
        out.push(("lm_head.weight".into(), vec![text.vocab_size, d]));
    }
    out
}
