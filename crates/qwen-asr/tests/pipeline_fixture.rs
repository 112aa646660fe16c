//! End-to-end pipeline tests against a synthetic miniature checkpoint.
//!
//! A tiny model directory (config.json, vocab.json, model.safetensors with
//! deterministic pseudo-random weights) is written to a temp dir, loaded
//! through the public API, and driven through transcription.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use safetensors::tensor::{Dtype, View, serialize_to_file};

use qwen_asr::error::Error;
use qwen_asr::model::required_tensors;
use qwen_asr::{ModelConfig, Qwen3Asr};

const CONFIG_JSON: &str = r#"
{
  "audio_config": {
    "num_mel_bins": 128,
    "d_model": 8,
    "encoder_layers": 1,
    "encoder_attention_heads": 2,
    "encoder_ffn_dim": 16,
    "conv_stride": 2,
    "max_source_positions": 32,
    "rope_theta": 10000.0,
    "rms_norm_eps": 1e-06
  },
  "text_config": {
    "hidden_size": 8,
    "num_hidden_layers": 1,
    "intermediate_size": 16,
    "num_attention_heads": 2,
    "num_key_value_heads": 1,
    "head_dim": 4,
    "vocab_size": 300,
    "max_position_embeddings": 32,
    "rope_theta": 1000000.0,
    "rms_norm_eps": 1e-06,
    "tie_word_embeddings": true
  }
}
"#;

struct RawTensor {
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl View for RawTensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
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

/// The byte-to-printable alphabet used by the byte-level vocabulary.
fn byte_alphabet() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut assigned = [false; 256];
    for b in (0x21u32..=0x7E).chain(0xA1..=0xAC).chain(0xAE..=0xFF) {
        table[b as usize] = char::from_u32(b).unwrap();
        assigned[b as usize] = true;
    }
    let mut next = 0u32;
    for b in 0..256usize {
        if !assigned[b] {
            table[b] = char::from_u32(256 + next).unwrap();
            next += 1;
        }
    }
    table
}

fn fixture_vocab_json() -> String {
    let mut vocab = HashMap::new();
    for (i, c) in byte_alphabet().iter().enumerate() {
        vocab.insert(c.to_string(), i as u32);
    }

    let specials: HashMap<&str, u32> = [
        ("<|bos|>", 256),
        ("<|eos|>", 257),
        ("<|system|>", 258),
        ("<|user|>", 259),
        ("<|assistant|>", 260),
        ("<|lang_english|>", 261),
        ("<|lang_french|>", 262),
    ]
    .into_iter()
    .collect();

    serde_json::json!({
        "vocab": vocab,
        "merges": [],
        "special_tokens": specials,
    })
    .to_string()
}

fn write_weights(path: &Path, config: &ModelConfig) {
    let mut seed = 2024u32;
    let mut tensors = Vec::new();
    for (name, shape) in required_tensors(config) {
        let n: usize = shape.iter().product();
        let mut data = Vec::with_capacity(n * 4);
        for _ in 0..n {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            let v = (((seed >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0) * 0.05;
            data.extend_from_slice(&v.to_le_bytes());
        }
        tensors.push((name, RawTensor { shape, data }));
    }
    serialize_to_file(tensors, &None, path).expect("serialize fixture weights");
}

fn fixture_model_dir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    dir.push(format!("qwen-asr-fixture-{tag}-{nanos}"));
    std::fs::create_dir_all(&dir).expect("mkdir");

    std::fs::write(dir.join("config.json"), CONFIG_JSON).expect("write config");
    std::fs::write(dir.join("vocab.json"), fixture_vocab_json()).expect("write vocab");

    let config = ModelConfig::from_json_str(CONFIG_JSON).expect("fixture config");
    write_weights(&dir.join("model.safetensors"), &config);
    dir
}

#[test]
fn back_to_back_transcriptions_are_identical() {
    let dir = fixture_model_dir("determinism");
    let mut ctx = Qwen3Asr::load(&dir).expect("load fixture model");
    ctx.set_max_new_tokens(8);

    // 0.2s of silence: 3200 samples, 20 mel frames, 5 encoder positions.
    let samples = vec![0.0f32; 3200];

    let first = ctx.transcribe(&samples).expect("first transcription");
    let first_tokens = ctx.perf().text_tokens;
    let first_kv = ctx.kv_cache_len();

    // No explicit cache reset between calls; the engine resets internally.
    let second = ctx.transcribe(&samples).expect("second transcription");

    assert_eq!(first, second);
    assert_eq!(ctx.perf().text_tokens, first_tokens);
    assert_eq!(ctx.kv_cache_len(), first_kv);
    assert!(first_kv > 0);

    let perf = ctx.perf();
    assert!((perf.audio_ms - 200.0).abs() < 1e-9);
    assert!(perf.total_ms >= perf.encode_ms + perf.decode_ms - 1.0);

    std::fs::remove_dir_all(dir).expect("cleanup");
}

#[test]
fn language_forcing_validates_against_the_vocabulary() {
    let dir = fixture_model_dir("language");
    let mut ctx = Qwen3Asr::load(&dir).expect("load fixture model");
    ctx.set_max_new_tokens(4);

    assert_eq!(ctx.supported_languages_csv(), "English,French");
    ctx.set_force_language(Some("English")).expect("english ok");

    match ctx.set_force_language(Some("Klingon")) {
        Err(Error::UnsupportedLanguage(lang)) => assert_eq!(lang, "Klingon"),
        other => panic!("expected UnsupportedLanguage, got {other:?}"),
    }

    // The rejected call must not disturb the prior setting; both forced
    // languages still transcribe.
    let samples = vec![0.0f32; 1600];
    ctx.transcribe(&samples).expect("transcribe with english");

    ctx.set_force_language(Some("French")).expect("french ok");
    ctx.transcribe(&samples).expect("transcribe with french");

    ctx.set_force_language(None).expect("clear");
    ctx.transcribe(&samples).expect("transcribe with auto language");

    std::fs::remove_dir_all(dir).expect("cleanup");
}

#[test]
fn prompt_biasing_is_accepted_and_deterministic() {
    let dir = fixture_model_dir("prompt");
    let mut ctx = Qwen3Asr::load(&dir).expect("load fixture model");
    ctx.set_max_new_tokens(6);
    ctx.set_prompt(Some("names: Kennedy"));

    let samples = vec![0.0f32; 1600];
    let a = ctx.transcribe(&samples).expect("with prompt");
    let b = ctx.transcribe(&samples).expect("with prompt again");
    assert_eq!(a, b);

    ctx.set_prompt(None);
    ctx.transcribe(&samples).expect("without prompt");

    std::fs::remove_dir_all(dir).expect("cleanup");
}

#[test]
fn encoder_forward_exposes_hidden_states() {
    let dir = fixture_model_dir("encoder");
    let ctx = Qwen3Asr::load(&dir).expect("load fixture model");

    let samples = vec![0.0f32; 3200];
    let (mel, n_frames) = ctx
        .mel_spectrogram(&samples, qwen_asr::constants::SAMPLE_RATE_HZ)
        .expect("mel");
    assert_eq!(n_frames, 20);

    match ctx.mel_spectrogram(&samples, 44_100) {
        Err(Error::InvalidSampleRate(rate)) => assert_eq!(rate, 44_100),
        other => panic!("expected InvalidSampleRate, got {other:?}"),
    }

    let (hidden, out_len) = ctx.encoder_forward(&mel, n_frames).expect("encoder forward");
    assert_eq!(out_len, 5);
    assert_eq!(hidden.len(), out_len * ctx.config().audio_config.d_model);
    assert!(hidden.iter().all(|v| v.is_finite()));

    std::fs::remove_dir_all(dir).expect("cleanup");
}

#[test]
fn corrupt_weights_fail_with_a_header_parse_error() {
    let dir = fixture_model_dir("corrupt");
    // Overwrite the weights with a length prefix pointing past EOF.
    std::fs::write(dir.join("model.safetensors"), 1_000_000u64.to_le_bytes())
        .expect("truncate weights");

    match Qwen3Asr::load(&dir) {
        Ok(_) => panic!("load of corrupt weights must fail"),
        Err(err) => match err.downcast_ref::<Error>() {
            Some(Error::HeaderParse(_)) => {}
            other => panic!("expected HeaderParse, got {other:?}"),
        },
    }

    std::fs::remove_dir_all(dir).expect("cleanup");
}
