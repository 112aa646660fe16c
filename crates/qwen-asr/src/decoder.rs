//! Text decoder: causal transformer with grouped-query attention, a KV
//! cache for self-attention, and cross-attention over the encoder output.
//!
//! One call to [`forward_step`] consumes a single token id at the cache
//! position, appends that position's K/V to every layer's cache slot, and
//! returns the vocabulary logits for the next token.

use crate::config::TextConfig;
use crate::kernels::{add_inplace, linear, rms_norm_rows, rope_inplace, silu_inplace, softmax_rows};
use crate::kv::{CrossKv, KvCache};
use crate::model::{DecoderBlockWeights, DecoderWeights};

/// Grouped-query attention for one query row against `[seq_len, kv_dim]`
/// keys/values: each group of `n_heads / n_kv_heads` query heads attends to
/// the same KV head.
fn attention_gqa(
    query: &[f32],
    keys: &[f32],
    values: &[f32],
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    seq_len: usize,
) -> Vec<f32> {
    debug_assert_eq!(query.len(), n_heads * head_dim);
    debug_assert_eq!(keys.len(), seq_len * n_kv_heads * head_dim);
    debug_assert_eq!(values.len(), seq_len * n_kv_heads * head_dim);
    debug_assert_eq!(n_heads % n_kv_heads, 0);

    let kv_group = n_heads / n_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let be = crate::kernels::backend();

    let mut out = vec![0.0f32; n_heads * head_dim];
    let mut scores = vec![0.0f32; seq_len];

    for h in 0..n_heads {
        let q = &query[h * head_dim..(h + 1) * head_dim];
        let kv_h = h / kv_group;

        for (t, score) in scores.iter_mut().enumerate() {
            let k_base = (t * n_kv_heads + kv_h) * head_dim;
            *score = be.dot(q, &keys[k_base..k_base + head_dim]) * scale;
        }
        softmax_rows(&mut scores, seq_len);

        let out_h = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &a) in scores.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            let v_base = (t * n_kv_heads + kv_h) * head_dim;
            be.axpy(out_h, a, &values[v_base..v_base + head_dim]);
        }
    }
    out
}

/// Project the encoder hidden states into each layer's cross-attention K/V.
/// Done once per utterance.
pub fn prepare_cross(
    text: &TextConfig,
    weights: &DecoderWeights,
    enc_hidden: &[f32],
    enc_len: usize,
    enc_dim: usize,
    cross: &mut CrossKv,
) {
    debug_assert_eq!(enc_hidden.len(), enc_len * enc_dim);
    let kv_dim = text.num_key_value_heads * text.head_dim;

    cross.begin(enc_len);
    for (l, block) in weights.blocks.iter().enumerate() {
        let k = linear(enc_hidden, enc_len, enc_dim, &block.cwk, kv_dim, None);
        let v = linear(enc_hidden, enc_len, enc_dim, &block.cwv, kv_dim, None);
        cross.store(l, k, v);
    }
}

fn self_attention(
    text: &TextConfig,
    block: &DecoderBlockWeights,
    layer: usize,
    x_norm: &[f32],
    kv: &mut KvCache,
    pos: usize,
) -> Vec<f32> {
    let d = text.hidden_size;
    let hd = text.head_dim;
    let n_heads = text.num_attention_heads;
    let n_kv = text.num_key_value_heads;
    let q_dim = n_heads * hd;
    let kv_dim = n_kv * hd;
    let eps = text.rms_norm_eps;

    let mut q = linear(x_norm, 1, d, &block.wq, q_dim, None);
    let mut k = linear(x_norm, 1, d, &block.wk, kv_dim, None);
    let v = linear(x_norm, 1, d, &block.wv, kv_dim, None);

    // Per-head RMSNorm on Q and K (Qwen3 style), then rotary at `pos`.
    let q_src = q.clone();
    rms_norm_rows(&mut q, &q_src, &block.q_norm, hd, eps);
    let k_src = k.clone();
    rms_norm_rows(&mut k, &k_src, &block.k_norm, hd, eps);

    rope_inplace(&mut q, n_heads, hd, pos as f32, text.rope_theta);
    rope_inplace(&mut k, n_kv, hd, pos as f32, text.rope_theta);

    kv.append(layer, &k, &v);
    let seq_len = kv.len() + 1; // cache rows incl. the one just written

    // The causal mask is implicit: the cache only holds positions <= pos.
    let attn = attention_gqa(
        &q,
        kv.keys_through(layer, seq_len),
        kv.values_through(layer, seq_len),
        n_heads,
        n_kv,
        hd,
        seq_len,
    );
    linear(&attn, 1, q_dim, &block.wo, d, None)
}

fn cross_attention(
    text: &TextConfig,
    block: &DecoderBlockWeights,
    layer: usize,
    x_norm: &[f32],
    cross: &CrossKv,
) -> Vec<f32> {
    let d = text.hidden_size;
    let hd = text.head_dim;
    let q_dim = text.num_attention_heads * hd;

    let q = linear(x_norm, 1, d, &block.cwq, q_dim, None);
    let attn = attention_gqa(
        &q,
        cross.keys(layer),
        cross.values(layer),
        text.num_attention_heads,
        text.num_key_value_heads,
        hd,
        cross.seq_len(),
    );
    linear(&attn, 1, q_dim, &block.cwo, d, None)
}

/// Run one decode step for `token` at the current cache position.
///
/// Appends to the KV cache, advances the shared position counter, and
/// returns the `[vocab_size]` logits row.
pub fn forward_step(
    text: &TextConfig,
    weights: &DecoderWeights,
    kv: &mut KvCache,
    cross: &CrossKv,
    token: u32,
) -> Vec<f32> {
    let d = text.hidden_size;
    let eps = text.rms_norm_eps;
    let pos = kv.len();

    let mut h = vec![0.0f32; d];
    crate::kernels::embed_lookup(&weights.embed_tokens, d, token as usize, &mut h);

    let mut x_norm = vec![0.0f32; d];
    for (l, block) in weights.blocks.iter().enumerate() {
        rms_norm_rows(&mut x_norm, &h, &block.self_attn_norm, d, eps);
        let attn = self_attention(text, block, l, &x_norm, kv, pos);
        add_inplace(&mut h, &attn);

        if cross.seq_len() > 0 {
            rms_norm_rows(&mut x_norm, &h, &block.cross_attn_norm, d, eps);
            let attn = cross_attention(text, block, l, &x_norm, cross);
            add_inplace(&mut h, &attn);
        }

        rms_norm_rows(&mut x_norm, &h, &block.mlp_norm, d, eps);
        let mut gate = linear(&x_norm, 1, d, &block.w_gate, text.intermediate_size, None);
        let up = linear(&x_norm, 1, d, &block.w_up, text.intermediate_size, None);
        silu_inplace(&mut gate);
        for (g, u) in gate.iter_mut().zip(up.iter().copied()) {
            *g *= u;
        }
        let down = linear(&gate, 1, text.intermediate_size, &block.w_down, d, None);
        add_inplace(&mut h, &down);
    }
    kv.advance();

    rms_norm_rows(&mut x_norm, &h, &weights.final_norm, d, eps);
    let head = weights.lm_head.as_deref().unwrap_or(&weights.embed_tokens);
    linear(&x_norm, 1, d, head, text.vocab_size, None)
}
