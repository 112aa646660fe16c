use std::io::{Cursor, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use qwen_asr::constants::SAMPLE_RATE_HZ;
use qwen_asr::{Qwen3Asr, set_threads};

#[derive(Debug, Parser)]
#[command(name = "qwen-asr")]
#[command(about = "Qwen3-ASR CPU transcription", long_about = None)]
struct Args {
    /// Model directory (config.json, vocab.json, *.safetensors).
    #[arg(short = 'd', long)]
    model_dir: PathBuf,

    /// WAV file to transcribe (PCM or float; resampled to 16 kHz if needed).
    #[arg(short = 'i', long)]
    audio: Option<PathBuf>,

    /// Read audio from stdin (WAV, or raw s16le 16 kHz mono).
    #[arg(long, default_value_t = false)]
    stdin: bool,

    /// Force the transcription language (see --list-languages).
    #[arg(short = 'l', long)]
    language: Option<String>,

    /// System prompt to bias the decoder (names, jargon, spellings).
    #[arg(short = 'p', long)]
    prompt: Option<String>,

    /// Number of worker threads (0 = one per CPU).
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Cap on generated tokens per utterance.
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Print the supported languages and exit.
    #[arg(long, default_value_t = false)]
    list_languages: bool,

    /// Validate the model directory and print its dimensions, then exit.
    #[arg(long, default_value_t = false)]
    inspect_model: bool,

    /// Suppress the per-call timing line on stderr.
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    set_threads(args.threads);

    let mut ctx = Qwen3Asr::load(&args.model_dir)
        .with_context(|| format!("load model from {}", args.model_dir.display()))?;
    ctx.set_verbose(!args.quiet);
    if let Some(n) = args.max_tokens {
        ctx.set_max_new_tokens(n);
    }

    if args.list_languages {
        println!("{}", ctx.supported_languages_csv());
        return Ok(());
    }

    if args.inspect_model {
        let config = ctx.config();
        eprintln!(
            "model ok: encoder d={} layers={}  decoder d={} layers={}  vocab={}  languages={}",
            config.audio_config.d_model,
            config.audio_config.encoder_layers,
            config.text_config.hidden_size,
            config.text_config.num_hidden_layers,
            config.text_config.vocab_size,
            ctx.supported_languages_csv(),
        );
        return Ok(());
    }

    if let Some(lang) = &args.language {
        ctx.set_force_language(Some(lang)).with_context(|| {
            format!("supported languages: {}", ctx.supported_languages_csv())
        })?;
    }
    ctx.set_prompt(args.prompt.as_deref());

    let samples = match (&args.audio, args.stdin) {
        (Some(path), false) => load_wav_file(path)?,
        (None, true) => load_stdin()?,
        _ => anyhow::bail!("choose exactly one input: --audio FILE or --stdin"),
    };

    let text = ctx.transcribe(&samples)?;
    println!("{text}");
    Ok(())
}

/// Decode a WAV through hound into mono f32, downmixing and resampling.
fn wav_to_mono_16k<R: Read>(reader: hound::WavReader<R>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    anyhow::ensure!(spec.channels >= 1, "WAV has no channels");

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| Ok(s? as f32 / max_val))
                .collect::<Result<_>>()?
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| Ok(s?))
            .collect::<Result<_>>()?,
    };

    let channels = usize::from(spec.channels);
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();

    if spec.sample_rate == SAMPLE_RATE_HZ {
        Ok(mono)
    } else {
        Ok(resample_linear(&mono, spec.sample_rate, SAMPLE_RATE_HZ))
    }
}

fn load_wav_file(path: &PathBuf) -> Result<Vec<f32>> {
    let reader =
        hound::WavReader::open(path).with_context(|| format!("open WAV {}", path.display()))?;
    wav_to_mono_16k(reader)
}

fn load_stdin() -> Result<Vec<f32>> {
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf).context("read stdin")?;

    if buf.len() >= 12 && &buf[0..4] == b"RIFF" && &buf[8..12] == b"WAVE" {
        let reader = hound::WavReader::new(Cursor::new(buf)).context("parse WAV from stdin")?;
        return wav_to_mono_16k(reader);
    }

    // Raw s16le 16 kHz mono.
    if buf.len() % 2 != 0 {
        buf.pop();
    }
    Ok(buf
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect())
}

/// Linearly resample `input` from `src_hz` to `dst_hz`.
fn resample_linear(input: &[f32], src_hz: u32, dst_hz: u32) -> Vec<f32> {
    if src_hz == dst_hz || input.is_empty() {
        return input.to_vec();
    }

    let new_n = (input.len() as u64) * u64::from(dst_hz) / u64::from(src_hz);
    let mut out = vec![0.0f32; new_n as usize];

    for (i, y) in out.iter_mut().enumerate() {
        let src_pos = (i as f32) * (src_hz as f32) / (dst_hz as f32);
        let idx = src_pos.floor() as usize;
        let frac = src_pos - (idx as f32);

        let a = input.get(idx).copied().unwrap_or(0.0);
        let b = input.get(idx + 1).copied().unwrap_or(a);
        *y = a * (1.0 - frac) + b * frac;
    }
    out
}
