//! Safetensors-backed model weight loading.
//!
//! Tensors are memory-mapped and materialized to `f32` on request. Supported
//! storage dtypes: F32, F16, BF16, and symmetric group-wise int8 (an I8
//! tensor `X.weight` paired with an F32 `X.scales` sibling holding one scale
//! per `group_size` elements).

use std::path::{Path, PathBuf};

use memmap2::MmapOptions;
use safetensors::SafeTensors;
use safetensors::tensor::{Dtype, SafeTensorError};

use crate::error::{Error, Result};
use crate::kernels::dequantize_q8;

#[derive(Debug, Clone)]
pub struct TensorF32 {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorF32 {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug)]
pub struct WeightStore {
    mmap: memmap2::Mmap,
    quant_group_size: usize,
}

#[inline]
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) & 1;
    let exp = u32::from(bits >> 10) & 0x1F;
    let mant = u32::from(bits) & 0x3FF;

    if exp == 0 {
        if mant == 0 {
            return f32::from_bits(sign << 31);
        }
        // Subnormal.
        let m = (mant as f32) / 1024.0;
        let v = m * 2.0f32.powi(-14);
        return if sign == 0 { v } else { -v };
    }
    if exp == 31 {
        if mant == 0 {
            return if sign == 0 {
                f32::INFINITY
            } else {
                f32::NEG_INFINITY
            };
        }
        return f32::NAN;
    }
    f32::from_bits((sign << 31) | ((exp + 127 - 15) << 23) | (mant << 13))
}

fn map_safetensor_err(name: Option<&str>, err: SafeTensorError) -> Error {
    match err {
        SafeTensorError::TensorNotFound(n) => Error::MissingTensor(n),
        other => {
            let tensor = name.map(|n| format!(" ({n})")).unwrap_or_default();
            Error::HeaderParse(format!("{other}{tensor}"))
        }
    }
}

impl WeightStore {
    pub fn open(path: impl AsRef<Path>, quant_group_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(PathBuf::from(path))
            } else {
                Error::Io(e)
            }
        })?;
        // SAFETY: read-only file mapping for immutable tensor access.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        // Validate the header (length prefix, JSON, offsets) up front so a
        // corrupt file fails at load rather than on first tensor access.
        SafeTensors::deserialize(&mmap).map_err(|e| map_safetensor_err(None, e))?;

        Ok(Self {
            mmap,
            quant_group_size,
        })
    }

    fn view(&self) -> Result<SafeTensors<'_>> {
        SafeTensors::deserialize(&self.mmap).map_err(|e| map_safetensor_err(None, e))
    }

    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self
            .view()?
            .iter()
            .map(|(name, _)| name.to_string())
            .collect())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.view()?.tensor(name).is_ok())
    }

    /// Materialize a tensor as `f32`, dequantizing int8 storage on the fly.
    pub fn tensor_f32(&self, name: &str) -> Result<TensorF32> {
        let st = self.view()?;
        let tv = st
            .tensor(name)
            .map_err(|e| map_safetensor_err(Some(name), e))?;
        let shape = tv.shape().to_vec();

        let data = match tv.dtype() {
            Dtype::F32 => raw_to_f32(name, tv.data())?,
            Dtype::F16 => {
                check_elem_size(name, tv.data(), 2)?;
                tv.data()
                    .chunks_exact(2)
                    .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                    .collect()
            }
            Dtype::BF16 => {
                check_elem_size(name, tv.data(), 2)?;
                tv.data()
                    .chunks_exact(2)
                    .map(|c| {
                        let bits = u32::from(u16::from_le_bytes([c[0], c[1]]));
                        f32::from_bits(bits << 16)
                    })
                    .collect()
            }
            Dtype::I8 => self.dequantize_i8(&st, name, tv.data())?,
            other => {
                return Err(Error::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{other:?}"),
                });
            }
        };

        Ok(TensorF32 { shape, data })
    }

    fn dequantize_i8(&self, st: &SafeTensors<'_>, name: &str, raw: &[u8]) -> Result<Vec<f32>> {
        let scales_name = match name.strip_suffix(".weight") {
            Some(stem) => format!("{stem}.scales"),
            None => format!("{name}.scales"),
        };
        let sv = st
            .tensor(&scales_name)
            .map_err(|e| map_safetensor_err(Some(&scales_name), e))?;
        if sv.dtype() != Dtype::F32 {
            return Err(Error::UnsupportedDtype {
                name: scales_name,
                dtype: format!("{:?}", sv.dtype()),
            });
        }
        let scales = raw_to_f32(&scales_name, sv.data())?;

        let expected_groups = raw.len().div_ceil(self.quant_group_size);
        if scales.len() != expected_groups {
            return Err(Error::ShapeMismatch {
                name: scales_name,
                expected: vec![expected_groups],
                actual: vec![scales.len()],
            });
        }

        let q: Vec<i8> = raw.iter().map(|&b| b as i8).collect();
        let mut out = vec![0.0f32; q.len()];
        dequantize_q8(&q, &scales, self.quant_group_size, &mut out);
        Ok(out)
    }
}

fn check_elem_size(name: &str, raw: &[u8], elem_size: usize) -> Result<()> {
    if raw.len() % elem_size != 0 {
        return Err(Error::HeaderParse(format!(
            "tensor {name}: byte length {} is not a multiple of {elem_size}",
            raw.len()
        )));
    }
    Ok(())
}

fn raw_to_f32(name: &str, raw: &[u8]) -> Result<Vec<f32>> {
    check_elem_size(name, raw, 4)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// Needed by model loading but defined here so shape semantics live with the
// store: pull a tensor and insist on an exact shape.
pub fn tensor_with_shape(store: &WeightStore, name: &str, shape: &[usize]) -> Result<Vec<f32>> {
    let t = store.tensor_f32(name)?;
    if t.shape != shape {
        return Err(Error::ShapeMismatch {
            name: name.to_string(),
            expected: shape.to_vec(),
            actual: t.shape,
        });
    }
    Ok(t.data)
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use safetensors::tensor::{Dtype, View, serialize_to_file};

    use super::{WeightStore, tensor_with_shape};
    use crate::error::Error;

    #[derive(Debug, Clone)]
    pub(crate) struct TestTensor {
        pub dtype: Dtype,
        pub shape: Vec<usize>,
        pub data: Vec<u8>,
    }

    impl View for TestTensor {
        fn dtype(&self) -> Dtype {
            self.dtype
        }

        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn data(&self) -> Cow<'_, [u8]> {
            Cow::Borrowed(&self.data)
        }

        fn data_len(&self) -> usize {
            self.data.len()
        }
    }

    fn tmp_file(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("qwen-asr-weights-test-{name}-{nanos}.safetensors"));
        p
    }

    fn f32_tensor(shape: Vec<usize>, values: &[f32]) -> TestTensor {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        TestTensor {
            dtype: Dtype::F32,
            shape,
            data,
        }
    }

    #[test]
    fn loads_f32_f16_and_bf16_tensors() {
        let f32_data = vec![1.0f32, 2.5, -3.0, 4.25];

        // F16 for [1.0, -2.0] -> [0x3c00, 0xc000]
        let f16_words = [0x3c00u16, 0xc000u16];
        let mut f16_bytes = Vec::new();
        for &w in &f16_words {
            f16_bytes.extend_from_slice(&w.to_le_bytes());
        }

        // BF16 for [1.0, -2.0] -> [0x3f80, 0xc000]
        let bf16_words = [0x3f80u16, 0xc000u16];
        let mut bf16_bytes = Vec::new();
        for &w in &bf16_words {
            bf16_bytes.extend_from_slice(&w.to_le_bytes());
        }

        let tensors = vec![
            ("a".to_string(), f32_tensor(vec![2, 2], &f32_data)),
            (
                "b".to_string(),
                TestTensor {
                    dtype: Dtype::F16,
                    shape: vec![2],
                    data: f16_bytes,
                },
            ),
            (
                "c".to_string(),
                TestTensor {
                    dtype: Dtype::BF16,
                    shape: vec![2],
                    data: bf16_bytes,
                },
            ),
        ];

        let path = tmp_file("dtypes");
        serialize_to_file(tensors, &None, &path).expect("serialize safetensors");

        let ws = WeightStore::open(&path, 64).expect("open");
        let names = ws.names().expect("names");
        assert_eq!(names.len(), 3);

        let a = ws.tensor_f32("a").expect("tensor a");
        assert_eq!(a.shape, vec![2, 2]);
        assert_eq!(a.data, f32_data);

        for name in ["b", "c"] {
            let t = ws.tensor_f32(name).expect("halfish tensor");
            assert!((t.data[0] - 1.0).abs() < 1e-6, "{name}");
            assert!((t.data[1] + 2.0).abs() < 1e-6, "{name}");
        }

        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn dequantizes_grouped_i8_with_scales_sibling() {
        let q: Vec<u8> = [2i8, 4, -6, 8, 100, -100, 50, 25]
            .iter()
            .map(|&v| v as u8)
            .collect();
        let tensors = vec![
            (
                "layer.w.weight".to_string(),
                TestTensor {
                    dtype: Dtype::I8,
                    shape: vec![2, 4],
                    data: q,
                },
            ),
            (
                "layer.w.scales".to_string(),
                f32_tensor(vec![2], &[0.5, 0.01]),
            ),
        ];

        let path = tmp_file("q8");
        serialize_to_file(tensors, &None, &path).expect("serialize safetensors");

        let ws = WeightStore::open(&path, 4).expect("open");
        let t = ws.tensor_f32("layer.w.weight").expect("dequantized");
        assert_eq!(t.shape, vec![2, 4]);
        assert_eq!(t.data[0], 1.0);
        assert_eq!(t.data[3], 4.0);
        assert!((t.data[4] - 1.0).abs() < 1e-6);
        assert!((t.data[7] - 0.25).abs() < 1e-6);

        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn truncated_header_is_a_parse_error() {
        let path = tmp_file("truncated");
        // A length prefix promising far more header bytes than the file has.
        std::fs::write(&path, 1_000_000u64.to_le_bytes()).expect("write");

        match WeightStore::open(&path, 64) {
            Err(Error::HeaderParse(_)) => {}
            other => panic!("expected HeaderParse, got {other:?}"),
        }
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn missing_file_missing_tensor_and_shape_mismatch() {
        match WeightStore::open("/nonexistent/model.safetensors", 64) {
            Err(Error::FileNotFound(_)) => {}
            other => panic!("expected FileNotFound, got {other:?}"),
        }

        let path = tmp_file("missing");
        let tensors = vec![("present".to_string(), f32_tensor(vec![2], &[1.0, 2.0]))];
        serialize_to_file(tensors, &None, &path).expect("serialize safetensors");

        let ws = WeightStore::open(&path, 64).expect("open");
        match ws.tensor_f32("absent") {
            Err(Error::MissingTensor(name)) => assert_eq!(name, "absent"),
            other => panic!("expected MissingTensor, got {other:?}"),
        }
        match tensor_with_shape(&ws, "present", &[3]) {
            Err(Error::ShapeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, vec![3]);
                assert_eq!(actual, vec![2]);
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn unsupported_dtype_is_reported_by_name() {
        let path = tmp_file("f64");
        let tensors = vec![(
            "wide".to_string(),
            TestTensor {
                dtype: Dtype::F64,
                shape: vec![1],
                data: 1.0f64.to_le_bytes().to_vec(),
            },
        )];
        serialize_to_file(tensors, &None, &path).expect("serialize safetensors");

        let ws = WeightStore::open(&path, 64).expect("open");
        match ws.tensor_f32("wide") {
            Err(Error::UnsupportedDtype { name, .. }) => assert_eq!(name, "wide"),
            other => panic!("expected UnsupportedDtype, got {other:?}"),
        }
        std::fs::remove_file(path).expect("cleanup");
    }
}
