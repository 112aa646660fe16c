//! Optional integration test against a real checkpoint.
//!
//! Run locally with:
//! `QWEN_ASR_MODEL_DIR=/path/to/model cargo test -p qwen-asr --test e2e_model_env -- --nocapture`

use qwen_asr::Qwen3Asr;

#[test]
fn model_dir_env_smoke() {
    let Some(model_dir) = std::env::var_os("QWEN_ASR_MODEL_DIR") else {
        eprintln!("skipping: QWEN_ASR_MODEL_DIR is not set");
        return;
    };

    let mut ctx = Qwen3Asr::load(&model_dir).expect("load model");

    let languages = ctx.supported_languages_csv();
    assert!(!languages.is_empty(), "no language tags in vocab.json");
    assert!(
        languages.split(',').any(|l| l == "English"),
        "English missing from {languages}"
    );
    ctx.set_force_language(Some("English")).expect("force english");

    // Five seconds of silence: expect a near-empty transcript and working
    // perf counters.
    let samples = vec![0.0f32; 5 * 16_000];
    let text = ctx.transcribe(&samples).expect("transcribe silence");
    eprintln!("silence transcript: {text:?}");

    let perf = ctx.perf();
    assert!((perf.audio_ms - 5000.0).abs() < 1e-6);
    assert!(perf.total_ms > 0.0);
    assert!(
        perf.text_tokens <= 1,
        "silence produced {} tokens",
        perf.text_tokens
    );
}
