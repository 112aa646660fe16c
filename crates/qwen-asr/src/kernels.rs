//! CPU compute kernels.
//!
//! All tensor math runs over flat `f32` buffers. The innermost loops (dot
//! product, scaled accumulate) go through a [`Backend`] chosen once per
//! process by CPU-feature probing; everything above them partitions work
//! across the rayon pool and is identical for every backend.

use std::sync::OnceLock;

use rayon::prelude::*;

/// Vectorized primitive set implemented per ISA family.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `sum(a[i] * b[i])`
    fn dot(&self, a: &[f32], b: &[f32]) -> f32;

    /// `y[i] += a * x[i]`
    fn axpy(&self, y: &mut [f32], a: f32, x: &[f32]);
}

struct Scalar;

impl Backend for Scalar {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn axpy(&self, y: &mut [f32], a: f32, x: &[f32]) {
        debug_assert_eq!(y.len(), x.len());
        for (yi, &xi) in y.iter_mut().zip(x) {
            *yi += a * xi;
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::x86_64::*;

    pub struct Avx2;

    impl super::Backend for Avx2 {
        fn name(&self) -> &'static str {
            "avx2"
        }

        fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
            debug_assert_eq!(a.len(), b.len());
            // SAFETY: construction is gated on runtime avx2+fma detection.
            unsafe { dot_avx2(a, b) }
        }

        fn axpy(&self, y: &mut [f32], a: f32, x: &[f32]) {
            debug_assert_eq!(y.len(), x.len());
            // SAFETY: construction is gated on runtime avx2+fma detection.
            unsafe { axpy_avx2(y, a, x) }
        }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        unsafe {
            let mut acc0 = _mm256_setzero_ps();
            let mut acc1 = _mm256_setzero_ps();
            let mut acc2 = _mm256_setzero_ps();
            let mut acc3 = _mm256_setzero_ps();

            let mut i = 0;
            while i + 32 <= n {
                let a0 = _mm256_loadu_ps(a.as_ptr().add(i));
                let b0 = _mm256_loadu_ps(b.as_ptr().add(i));
                acc0 = _mm256_fmadd_ps(a0, b0, acc0);

                let a1 = _mm256_loadu_ps(a.as_ptr().add(i + 8));
                let b1 = _mm256_loadu_ps(b.as_ptr().add(i + 8));
                acc1 = _mm256_fmadd_ps(a1, b1, acc1);

                let a2 = _mm256_loadu_ps(a.as_ptr().add(i + 16));
                let b2 = _mm256_loadu_ps(b.as_ptr().add(i + 16));
                acc2 = _mm256_fmadd_ps(a2, b2, acc2);

                let a3 = _mm256_loadu_ps(a.as_ptr().add(i + 24));
                let b3 = _mm256_loadu_ps(b.as_ptr().add(i + 24));
                acc3 = _mm256_fmadd_ps(a3, b3, acc3);

                i += 32;
            }
            while i + 8 <= n {
                let av = _mm256_loadu_ps(a.as_ptr().add(i));
                let bv = _mm256_loadu_ps(b.as_ptr().add(i));
                acc0 = _mm256_fmadd_ps(av, bv, acc0);
                i += 8;
            }

            let acc = _mm256_add_ps(_mm256_add_ps(acc0, acc1), _mm256_add_ps(acc2, acc3));
            let hi = _mm256_extractf128_ps(acc, 1);
            let lo = _mm256_castps256_ps128(acc);
            let sum128 = _mm_add_ps(hi, lo);
            let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
            let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 1));
            let mut sum = _mm_cvtss_f32(sum32);

            while i < n {
                sum += a[i] * b[i];
                i += 1;
            }
            sum
        }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn axpy_avx2(y: &mut [f32], a: f32, x: &[f32]) {
        let n = y.len();
        unsafe {
            let av = _mm256_set1_ps(a);
            let mut i = 0;
            while i + 8 <= n {
                let yv = _mm256_loadu_ps(y.as_ptr().add(i));
                let xv = _mm256_loadu_ps(x.as_ptr().add(i));
                _mm256_storeu_ps(y.as_mut_ptr().add(i), _mm256_fmadd_ps(av, xv, yv));
                i += 8;
            }
            while i < n {
                y[i] += a * x[i];
                i += 1;
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arm {
    use std::arch::aarch64::*;

    pub struct Neon;

    impl super::Backend for Neon {
        fn name(&self) -> &'static str {
            "neon"
        }

        fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
            debug_assert_eq!(a.len(), b.len());
            let n = a.len();
            // SAFETY: NEON is baseline on aarch64.
            unsafe {
                let mut acc0 = vdupq_n_f32(0.0);
                let mut acc1 = vdupq_n_f32(0.0);
                let mut acc2 = vdupq_n_f32(0.0);
                let mut acc3 = vdupq_n_f32(0.0);

                let mut i = 0;
                while i + 16 <= n {
                    let a0 = vld1q_f32(a.as_ptr().add(i));
                    let b0 = vld1q_f32(b.as_ptr().add(i));
                    acc0 = vfmaq_f32(acc0, a0, b0);

                    let a1 = vld1q_f32(a.as_ptr().add(i + 4));
                    let b1 = vld1q_f32(b.as_ptr().add(i + 4));
                    acc1 = vfmaq_f32(acc1, a1, b1);

                    let a2 = vld1q_f32(a.as_ptr().add(i + 8));
                    let b2 = vld1q_f32(b.as_ptr().add(i + 8));
                    acc2 = vfmaq_f32(acc2, a2, b2);

                    let a3 = vld1q_f32(a.as_ptr().add(i + 12));
                    let b3 = vld1q_f32(b.as_ptr().add(i + 12));
                    acc3 = vfmaq_f32(acc3, a3, b3);

                    i += 16;
                }

                acc0 = vaddq_f32(acc0, acc1);
                acc2 = vaddq_f32(acc2, acc3);
                let mut sum = vaddvq_f32(vaddq_f32(acc0, acc2));

                while i < n {
                    sum += a[i] * b[i];
                    i += 1;
                }
                sum
            }
        }

        fn axpy(&self, y: &mut [f32], a: f32, x: &[f32]) {
            debug_assert_eq!(y.len(), x.len());
            let n = y.len();
            // SAFETY: NEON is baseline on aarch64.
            unsafe {
                let av = vdupq_n_f32(a);
                let mut i = 0;
                while i + 4 <= n {
                    let yv = vld1q_f32(y.as_ptr().add(i));
                    let xv = vld1q_f32(x.as_ptr().add(i));
                    vst1q_f32(y.as_mut_ptr().add(i), vfmaq_f32(yv, av, xv));
                    i += 4;
                }
                while i < n {
                    y[i] += a * x[i];
                    i += 1;
                }
            }
        }
    }
}

static ACTIVE: OnceLock<&'static dyn Backend> = OnceLock::new();
static SCALAR: Scalar = Scalar;

#[cfg(target_arch = "x86_64")]
fn probe() -> &'static dyn Backend {
    if std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma") {
        static AVX2: x86::Avx2 = x86::Avx2;
        &AVX2
    } else {
        &SCALAR
    }
}

#[cfg(target_arch = "aarch64")]
fn probe() -> &'static dyn Backend {
    static NEON: arm::Neon = arm::Neon;
    &NEON
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn probe() -> &'static dyn Backend {
    &SCALAR
}

/// Backend selected for this process.
pub fn backend() -> &'static dyn Backend {
    *ACTIVE.get_or_init(probe)
}

/// The plain-Rust reference backend (used by tests to cross-check SIMD paths).
pub fn scalar_backend() -> &'static dyn Backend {
    &SCALAR
}

/// Size the process-wide worker pool. `0` means one worker per CPU.
///
/// Only reliable before the first kernel call; later calls are ignored.
pub fn set_threads(n: usize) {
    let n = if n == 0 { num_cpus() } else { n };
    let _ = rayon::ThreadPoolBuilder::new().num_threads(n).build_global();
}

pub fn num_threads() -> usize {
    rayon::current_num_threads()
}

pub fn num_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |v| v.get())
}

/// Linear layer: `y = x * W^T + b`.
///
/// Shapes:
/// - `input`: `[n_rows, in_dim]`
/// - `weight`: `[out_dim, in_dim]`
/// - output: `[n_rows, out_dim]`
///
/// Rows are partitioned across the worker pool; a single row partitions its
/// output features instead.
pub fn linear(
    input: &[f32],
    n_rows: usize,
    in_dim: usize,
    weight: &[f32],
    out_dim: usize,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), n_rows * in_dim);
    debug_assert_eq!(weight.len(), out_dim * in_dim);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), out_dim);
    }

    let be = backend();
    let mut out = vec![0.0f32; n_rows * out_dim];

    if n_rows == 1 {
        out.par_iter_mut()
            .with_min_len(16)
            .enumerate()
            .for_each(|(o, y)| {
                let w = &weight[o * in_dim..(o + 1) * in_dim];
                *y = bias.map_or(0.0, |b| b[o]) + be.dot(input, w);
            });
    } else {
        out.par_chunks_mut(out_dim)
            .zip(input.par_chunks(in_dim))
            .for_each(|(y, x)| {
                for (o, yo) in y.iter_mut().enumerate() {
                    let w = &weight[o * in_dim..(o + 1) * in_dim];
                    *yo = bias.map_or(0.0, |b| b[o]) + be.dot(x, w);
                }
            });
    }
    out
}

/// Row-major matrix product `C[m,n] = A[m,k] * B[k,n]`, no transposes.
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);

    let be = backend();
    let mut out = vec![0.0f32; m * n];
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (l, &av) in a[i * k..(i + 1) * k].iter().enumerate() {
            be.axpy(row, av, &b[l * n..(l + 1) * n]);
        }
    });
    out
}

/// Numerically stable in-place row-wise softmax over `[.., n_cols]`.
pub fn softmax_rows(x: &mut [f32], n_cols: usize) {
    debug_assert!(n_cols > 0);
    debug_assert_eq!(x.len() % n_cols, 0);

    for row in x.chunks_exact_mut(n_cols) {
        let mut max_v = f32::NEG_INFINITY;
        for &v in row.iter() {
            if v > max_v {
                max_v = v;
            }
        }
        let mut sum = 0.0f32;
        for v in row.iter_mut() {
            *v = (*v - max_v).exp();
            sum += *v;
        }
        if sum > 0.0 {
            let inv = 1.0 / sum;
            for v in row {
                *v *= inv;
            }
        }
    }
}

pub fn rms_norm_rows(output: &mut [f32], input: &[f32], weight: &[f32], dim: usize, eps: f32) {
    debug_assert!(dim > 0);
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(weight.len(), dim);
    debug_assert_eq!(input.len() % dim, 0);

    for (in_row, out_row) in input.chunks_exact(dim).zip(output.chunks_exact_mut(dim)) {
        let mut sq_sum = 0.0f32;
        for &v in in_row {
            sq_sum += v * v;
        }
        let inv_rms = 1.0 / ((sq_sum / (dim as f32) + eps).sqrt());
        for i in 0..dim {
            out_row[i] = in_row[i] * inv_rms * weight[i];
        }
    }
}

#[inline]
pub fn silu_inplace(x: &mut [f32]) {
    for v in x {
        let t = *v;
        *v = t / (1.0 + (-t).exp());
    }
}

#[inline]
pub fn gelu_inplace(x: &mut [f32]) {
    // tanh approximation, matches the reference conv stem.
    for v in x {
        let val = *v;
        let x3 = val * val * val;
        let inner = 0.797_884_6_f32 * (val + 0.044_715_f32 * x3);
        *v = 0.5_f32 * val * (1.0_f32 + inner.tanh());
    }
}

/// Apply interleaved RoPE in-place on one `[n_heads, head_dim]` row.
///
/// Pairs `(x[2i], x[2i+1])` are rotated by `pos * theta^(-2i/head_dim)`.
pub fn rope_inplace(data: &mut [f32], n_heads: usize, head_dim: usize, pos: f32, theta: f32) {
    debug_assert_eq!(data.len(), n_heads * head_dim);
    debug_assert_eq!(head_dim % 2, 0);

    for h in 0..n_heads {
        let head = &mut data[h * head_dim..(h + 1) * head_dim];
        for pair in 0..(head_dim / 2) {
            let i0 = 2 * pair;
            let i1 = i0 + 1;

            let inv_freq = theta.powf(-(i0 as f32) / (head_dim as f32));
            let angle = pos * inv_freq;
            let (sin, cos) = angle.sin_cos();

            let x0 = head[i0];
            let x1 = head[i1];
            head[i0] = x0 * cos - x1 * sin;
            head[i1] = x0 * sin + x1 * cos;
        }
    }
}

pub fn add_inplace(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter().copied()) {
        *d += s;
    }
}

/// Copy the embedding row for `id` into `out`.
pub fn embed_lookup(table: &[f32], dim: usize, id: usize, out: &mut [f32]) {
    debug_assert_eq!(out.len(), dim);
    debug_assert!((id + 1) * dim <= table.len());
    out.copy_from_slice(&table[id * dim..(id + 1) * dim]);
}

/// Index of the first maximum element.
pub fn argmax(x: &[f32]) -> usize {
    debug_assert!(!x.is_empty());
    let mut best = 0usize;
    let mut best_v = x[0];
    for (i, &v) in x.iter().enumerate().skip(1) {
        if v > best_v {
            best = i;
            best_v = v;
        }
    }
    best
}

/// Dequantize symmetric group-wise int8: `out[i] = q[i] * scales[i / group_size]`.
pub fn dequantize_q8(q: &[i8], scales: &[f32], group_size: usize, out: &mut [f32]) {
    debug_assert!(group_size > 0);
    debug_assert_eq!(q.len(), out.len());
    debug_assert_eq!(q.len().div_ceil(group_size), scales.len());

    for (g, (q_chunk, out_chunk)) in q
        .chunks(group_size)
        .zip(out.chunks_mut(group_size))
        .enumerate()
    {
        let scale = scales[g];
        for (o, &qv) in out_chunk.iter_mut().zip(q_chunk) {
            *o = f32::from(qv) * scale;
        }
    }
}
