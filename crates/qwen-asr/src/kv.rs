//! Decoder attention caches.
//!
//! [`KvCache`] is the append-only self-attention cache: one K and one V
//! buffer per layer, preallocated to the maximum context length. All layers
//! share a single position counter; a decode step writes every layer's slot
//! at the current position and then advances the counter once. `reset`
//! empties the cache without releasing memory.
//!
//! [`CrossKv`] holds the encoder-side keys and values for cross-attention,
//! projected once per utterance.

#[derive(Debug)]
pub struct KvCache {
    n_layers: usize,
    kv_dim: usize,
    max_len: usize,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    len: usize,
}

impl KvCache {
    #[must_use]
    pub fn new(n_layers: usize, n_kv_heads: usize, head_dim: usize, max_len: usize) -> Self {
        debug_assert!(n_layers > 0);
        debug_assert!(n_kv_heads > 0 && head_dim > 0);
        debug_assert!(max_len > 0);

        let kv_dim = n_kv_heads * head_dim;
        Self {
            n_layers,
            kv_dim,
            max_len,
            keys: vec![vec![0.0f32; max_len * kv_dim]; n_layers],
            values: vec![vec![0.0f32; max_len * kv_dim]; n_layers],
            len: 0,
        }
    }

    /// Number of cached positions, shared by every layer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.max_len
    }

    /// Empty the cache. Buffers stay allocated.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Write one token's K/V into `layer`'s slot at the current position.
    ///
    /// Call for every layer of a step, then [`advance`](Self::advance) once.
    pub fn append(&mut self, layer: usize, k: &[f32], v: &[f32]) {
        debug_assert!(layer < self.n_layers);
        debug_assert!(self.len < self.max_len, "KV cache overflow");
        debug_assert_eq!(k.len(), self.kv_dim);
        debug_assert_eq!(v.len(), self.kv_dim);

        let at = self.len * self.kv_dim;
        self.keys[layer][at..at + self.kv_dim].copy_from_slice(k);
        self.values[layer][at..at + self.kv_dim].copy_from_slice(v);
    }

    /// Advance the shared position counter after all layers appended.
    pub fn advance(&mut self) {
        debug_assert!(self.len < self.max_len);
        self.len += 1;
    }

    /// Cached keys for `layer`: `[len, kv_dim]`.
    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.keys[layer][..self.len * self.kv_dim]
    }

    /// Cached values for `layer`: `[len, kv_dim]`.
    pub fn values(&self, layer: usize) -> &[f32] {
        &self.values[layer][..self.len * self.kv_dim]
    }

    /// Keys for `layer` through the first `n` positions. `n` may exceed
    /// `len` by one to include the slot written for the in-flight step.
    pub fn keys_through(&self, layer: usize, n: usize) -> &[f32] {
        debug_assert!(n <= self.len + 1 && n <= self.max_len);
        &self.keys[layer][..n * self.kv_dim]
    }

    /// Values counterpart of [`keys_through`](Self::keys_through).
    pub fn values_through(&self, layer: usize, n: usize) -> &[f32] {
        debug_assert!(n <= self.len + 1 && n <= self.max_len);
        &self.values[layer][..n * self.kv_dim]
    }
}

/// Encoder-side K/V per decoder layer, rebuilt once per utterance.
#[derive(Debug, Default)]
pub struct CrossKv {
    layers: Vec<(Vec<f32>, Vec<f32>)>,
    seq_len: usize,
}

impl CrossKv {
    #[must_use]
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: vec![(Vec::new(), Vec::new()); n_layers],
            seq_len: 0,
        }
    }

    /// Start a new utterance of `seq_len` encoder positions.
    pub fn begin(&mut self, seq_len: usize) {
        self.seq_len = seq_len;
        for (k, v) in &mut self.layers {
            k.clear();
            v.clear();
        }
    }

    pub fn store(&mut self, layer: usize, k: Vec<f32>, v: Vec<f32>) {
        debug_assert_eq!(k.len(), v.len());
        debug_assert!(self.seq_len == 0 || k.len() % self.seq_len == 0);
        self.layers[layer] = (k, v);
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.layers[layer].0
    }

    pub fn values(&self, layer: usize) -> &[f32] {
        &self.layers[layer].1
    }
}
