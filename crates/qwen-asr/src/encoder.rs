//! Audio encoder: convolution stem + transformer stack.
//!
//! The stem runs two strided causal 1-D convolutions with GELU, taking the
//! `[mel_bins, n_frames]` spectrogram down to `ceil(n_frames / stride^2)`
//! positions at `d_model`. Each transformer block is pre-norm RMSNorm with
//! full (non-causal) multi-head attention, rotary embeddings on Q/K, and a
//! SwiGLU feed-forward. A final RMSNorm closes the stack.

use crate::config::AudioConfig;
use crate::error::{Error, Result};
use crate::kernels::{
    add_inplace, gelu_inplace, linear, matmul, rms_norm_rows, rope_inplace, silu_inplace,
    softmax_rows,
};
use crate::model::{EncoderBlockWeights, EncoderWeights};

/// Output length of one causal conv layer. With `kernel - stride` samples of
/// left padding the layer emits `ceil(length / stride)` positions.
pub fn conv_output_len(length: usize, stride: usize) -> usize {
    length.div_ceil(stride)
}

/// Causal 1-D convolution over column-major data.
///
/// - `input`: `[channels_in, length]` stored as `input[ic * length + t]`
/// - `output`: `[channels_out, out_length]`
/// - `weight`: `[channels_out, channels_in, kernel]` contiguous
#[allow(clippy::too_many_arguments)]
fn causal_conv1d_colmajor(
    output: &mut [f32],
    input: &[f32],
    weight: &[f32],
    bias: &[f32],
    channels_in: usize,
    channels_out: usize,
    length: usize,
    kernel: usize,
    stride: usize,
) {
    let out_length = conv_output_len(length, stride);
    if out_length == 0 {
        return;
    }

    debug_assert_eq!(output.len(), channels_out * out_length);
    debug_assert_eq!(input.len(), channels_in * length);
    debug_assert_eq!(weight.len(), channels_out * channels_in * kernel);
    debug_assert_eq!(bias.len(), channels_out);

    let left_pad = (kernel - stride) as isize;

    for oc in 0..channels_out {
        let b = bias[oc];
        let out_row = &mut output[oc * out_length..(oc + 1) * out_length];

        for (ol, out_elem) in out_row.iter_mut().enumerate() {
            let mut sum = b;
            let base = (ol * stride) as isize - left_pad;
            for ic in 0..channels_in {
                let in_row = &input[ic * length..(ic + 1) * length];
                let w_base = (oc * channels_in * kernel) + (ic * kernel);
                for k in 0..kernel {
                    let il = base + (k as isize);
                    if il >= 0 && (il as usize) < length {
                        sum += in_row[il as usize] * weight[w_base + k];
                    }
                }
            }
            *out_elem = sum;
        }
    }
}

/// Run the convolution stem. Input is the bin-major mel buffer; output is
/// row-major `[out_len, d_model]`.
fn conv_stem(
    audio: &AudioConfig,
    weights: &EncoderWeights,
    mel: &[f32],
    n_frames: usize,
) -> (Vec<f32>, usize) {
    let d = audio.d_model;
    let stride = audio.conv_stride;

    let len1 = conv_output_len(n_frames, stride);
    let mut conv1 = vec![0.0f32; d * len1];
    causal_conv1d_colmajor(
        &mut conv1,
        mel,
        &weights.conv1_weight,
        &weights.conv1_bias,
        audio.num_mel_bins,
        d,
        n_frames,
        3,
        stride,
    );
    gelu_inplace(&mut conv1);

    let len2 = conv_output_len(len1, stride);
    let mut conv2 = vec![0.0f32; d * len2];
    causal_conv1d_colmajor(
        &mut conv2,
        &conv1,
        &weights.conv2_weight,
        &weights.conv2_bias,
        d,
        d,
        len1,
        3,
        stride,
    );
    gelu_inplace(&mut conv2);

    // Transpose [d, len2] to row-major [len2, d] for the transformer stack.
    let mut out = vec![0.0f32; len2 * d];
    for t in 0..len2 {
        for c in 0..d {
            out[t * d + c] = conv2[c * len2 + t];
        }
    }
    (out, len2)
}

/// Full non-causal multi-head self-attention with rotary Q/K.
fn self_attention(
    audio: &AudioConfig,
    block: &EncoderBlockWeights,
    x_norm: &[f32],
    seq_len: usize,
) -> Vec<f32> {
    let d = audio.d_model;
    let n_heads = audio.encoder_attention_heads;
    let head_dim = d / n_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut q = linear(x_norm, seq_len, d, &block.wq, d, Some(&block.bq));
    let mut k = linear(x_norm, seq_len, d, &block.wk, d, Some(&block.bk));
    let v = linear(x_norm, seq_len, d, &block.wv, d, Some(&block.bv));

    for t in 0..seq_len {
        rope_inplace(&mut q[t * d..(t + 1) * d], n_heads, head_dim, t as f32, audio.rope_theta);
        rope_inplace(&mut k[t * d..(t + 1) * d], n_heads, head_dim, t as f32, audio.rope_theta);
    }

    let mut out = vec![0.0f32; seq_len * d];
    let mut q_h = vec![0.0f32; seq_len * head_dim];
    let mut k_h = vec![0.0f32; seq_len * head_dim];
    let mut v_h = vec![0.0f32; seq_len * head_dim];

    for h in 0..n_heads {
        let off = h * head_dim;
        for t in 0..seq_len {
            let row = t * d + off;
            q_h[t * head_dim..(t + 1) * head_dim].copy_from_slice(&q[row..row + head_dim]);
            k_h[t * head_dim..(t + 1) * head_dim].copy_from_slice(&k[row..row + head_dim]);
            v_h[t * head_dim..(t + 1) * head_dim].copy_from_slice(&v[row..row + head_dim]);
        }

        // scores[i, j] = q_i . k_j / sqrt(head_dim)
        let mut scores = linear(&q_h, seq_len, head_dim, &k_h, seq_len, None);
        for s in &mut scores {
            *s *= scale;
        }
        softmax_rows(&mut scores, seq_len);

        let ctx = matmul(&scores, &v_h, seq_len, seq_len, head_dim);
        for t in 0..seq_len {
            let row = t * d + off;
            out[row..row + head_dim].copy_from_slice(&ctx[t * head_dim..(t + 1) * head_dim]);
        }
    }

    linear(&out, seq_len, d, &block.wo, d, Some(&block.bo))
}

fn swiglu_ffn(
    x_norm: &[f32],
    seq_len: usize,
    dim: usize,
    ffn_dim: usize,
    w_gate: &[f32],
    w_up: &[f32],
    w_down: &[f32],
) -> Vec<f32> {
    let mut gate = linear(x_norm, seq_len, dim, w_gate, ffn_dim, None);
    let up = linear(x_norm, seq_len, dim, w_up, ffn_dim, None);
    silu_inplace(&mut gate);
    for (g, u) in gate.iter_mut().zip(up.iter().copied()) {
        *g *= u;
    }
    linear(&gate, seq_len, ffn_dim, w_down, dim, None)
}

/// Encode a mel spectrogram into hidden states `[out_len, d_model]`.
pub fn forward(
    audio: &AudioConfig,
    weights: &EncoderWeights,
    mel: &[f32],
    n_frames: usize,
) -> Result<(Vec<f32>, usize)> {
    if mel.len() != audio.num_mel_bins * n_frames {
        return Err(Error::InvalidArgument(format!(
            "mel buffer length {} does not match {} bins x {} frames",
            mel.len(),
            audio.num_mel_bins,
            n_frames
        )));
    }

    let (mut x, seq_len) = conv_stem(audio, weights, mel, n_frames);
    if seq_len > audio.max_source_positions {
        return Err(Error::AudioTooLong {
            frames: seq_len,
            max_frames: audio.max_source_positions,
        });
    }
    if seq_len == 0 {
        return Ok((x, 0));
    }

    let d = audio.d_model;
    let eps = audio.rms_norm_eps;
    let mut x_norm = vec![0.0f32; seq_len * d];

    for block in &weights.blocks {
        rms_norm_rows(&mut x_norm, &x, &block.attn_norm, d, eps);
        let attn = self_attention(audio, block, &x_norm, seq_len);
        add_inplace(&mut x, &attn);

        rms_norm_rows(&mut x_norm, &x, &block.mlp_norm, d, eps);
        let ffn = swiglu_ffn(
            &x_norm,
            seq_len,
            d,
            audio.encoder_ffn_dim,
            &block.w_gate,
            &block.w_up,
            &block.w_down,
        );
        add_inplace(&mut x, &ffn);
    }

    let mut out = vec![0.0f32; seq_len * d];
    rms_norm_rows(&mut out, &x, &weights.final_norm, d, eps);
    Ok((out, seq_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::EncoderBlockWeights;

    fn lcg(seed: &mut u32) -> f32 {
        *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        (((*seed >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0) * 0.05
    }

    fn tiny_audio_config() -> AudioConfig {
        ModelConfig::from_json_str(
            r#"
            {
              "audio_config": {
                "d_model": 8,
                "encoder_layers": 2,
                "encoder_attention_heads": 2,
                "encoder_ffn_dim": 16,
                "max_source_positions": 16
              },
              "text_config": {
                "hidden_size": 8,
                "num_hidden_layers": 1,
                "intermediate_size": 16,
                "num_attention_heads": 2,
                "num_key_value_heads": 1,
                "head_dim": 4,
                "vocab_size": 300,
                "max_position_embeddings": 64
              }
            }
            "#,
        )
        .expect("config")
        .audio_config
    }

    pub(crate) fn fake_encoder_weights(audio: &AudioConfig, seed: &mut u32) -> EncoderWeights {
        let d = audio.d_model;
        let mel = audio.num_mel_bins;
        let ffn = audio.encoder_ffn_dim;
        let mut vec_of = |n: usize| -> Vec<f32> { (0..n).map(|_| lcg(seed)).collect() };

        let blocks = (0..audio.encoder_layers)
            .map(|_| EncoderBlockWeights {
                attn_norm: vec![1.0; d],
                wq: vec_of(d * d),
                bq: vec_of(d),
                wk: vec_of(d * d),
                bk: vec_of(d),
                wv: vec_of(d * d),
                bv: vec_of(d),
                wo: vec_of(d * d),
                bo: vec_of(d),
                mlp_norm: vec![1.0; d],
                w_gate: vec_of(ffn * d),
                w_up: vec_of(ffn * d),
                w_down: vec_of(d * ffn),
            })
            .collect();

        EncoderWeights {
            conv1_weight: vec_of(d * mel * 3),
            conv1_bias: vec_of(d),
            conv2_weight: vec_of(d * d * 3),
            conv2_bias: vec_of(d),
            blocks,
            final_norm: vec![1.0; d],
        }
    }

    #[test]
    fn conv_output_len_is_ceil_division() {
        assert_eq!(conv_output_len(20, 2), 10);
        assert_eq!(conv_output_len(21, 2), 11);
        assert_eq!(conv_output_len(5, 1), 5);
        assert_eq!(conv_output_len(0, 2), 0);
    }

    #[test]
    fn downsamples_by_squared_stride_and_stays_finite() {
        let audio = tiny_audio_config();
        let mut seed = 5u32;
        let weights = fake_encoder_weights(&audio, &mut seed);

        let n_frames = 20usize;
        let mel: Vec<f32> = (0..audio.num_mel_bins * n_frames)
            .map(|_| lcg(&mut seed))
            .collect();

        let (hidden, out_len) = forward(&audio, &weights, &mel, n_frames).expect("encode");
        assert_eq!(out_len, n_frames.div_ceil(audio.conv_stride * audio.conv_stride));
        assert_eq!(hidden.len(), out_len * audio.d_model);
        assert!(hidden.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn forward_is_deterministic() {
        let audio = tiny_audio_config();
        let mut seed = 17u32;
        let weights = fake_encoder_weights(&audio, &mut seed);

        let n_frames = 12usize;
        let mel: Vec<f32> = (0..audio.num_mel_bins * n_frames)
            .map(|_| lcg(&mut seed))
            .collect();

        let (a, _) = forward(&audio, &weights, &mel, n_frames).expect("encode a");
        let (b, _) = forward(&audio, &weights, &mel, n_frames).expect("encode b");
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn rejects_audio_past_max_source_positions() {
        let mut audio = tiny_audio_config();
        audio.max_source_positions = 2;
        let mut seed = 3u32;
        let weights = fake_encoder_weights(&audio, &mut seed);

        let n_frames = 40usize;
        let mel = vec![0.0f32; audio.num_mel_bins * n_frames];
        match forward(&audio, &weights, &mel, n_frames) {
            Err(Error::AudioTooLong { frames, max_frames }) => {
                assert_eq!(frames, 10);
                assert_eq!(max_frames, 2);
            }
            other => panic!("expected AudioTooLong, got {other:?}"),
        }
    }
}
