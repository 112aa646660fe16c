//! Byte-level BPE tokenizer (`vocab.json`).
//!
//! The vocabulary file carries three sections: `vocab` (token string -> id),
//! `merges` (ordered `"left right"` pairs, highest priority first) and
//! `special_tokens` (symbolic name -> id). Token strings are written in the
//! byte-to-printable alphabet, so every possible input byte has a base
//! symbol and encoding is total.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const BOS_TOKEN: &str = "<|bos|>";
pub const EOS_TOKEN: &str = "<|eos|>";
pub const SYSTEM_TOKEN: &str = "<|system|>";
pub const USER_TOKEN: &str = "<|user|>";
pub const ASSISTANT_TOKEN: &str = "<|assistant|>";

const LANG_PREFIX: &str = "<|lang_";
const LANG_SUFFIX: &str = "|>";

#[derive(Debug, Deserialize)]
struct VocabFile {
    vocab: HashMap<String, u32>,
    merges: Vec<String>,
    special_tokens: HashMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: HashMap<String, u32>,
    token_by_id: HashMap<u32, String>,
    /// `"left right"` -> merge priority (lower wins).
    merge_rank: HashMap<String, usize>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    special_ids: HashSet<u32>,
    special_by_name: HashMap<String, u32>,
    /// Lowercase language tag -> token id, e.g. `"english"` -> `<|lang_english|>`.
    languages: Vec<(String, u32)>,
    bos: u32,
    eos: u32,
    system: u32,
    user: u32,
    assistant: u32,
}

/// The GPT-2 byte-to-printable-unicode alphabet.
fn byte_alphabet() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut assigned = [false; 256];
    let printable = (0x21u32..=0x7E).chain(0xA1..=0xAC).chain(0xAE..=0xFF);
    for b in printable {
        table[b as usize] = char::from_u32(b).expect("printable byte");
        assigned[b as usize] = true;
    }
    let mut next = 0u32;
    for b in 0..256usize {
        if !assigned[b] {
            table[b] = char::from_u32(256 + next).expect("remapped byte");
            next += 1;
        }
    }
    table
}

impl Tokenizer {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: VocabFile = serde_json::from_str(json).context("parse vocab.json")?;
        anyhow::ensure!(!file.vocab.is_empty(), "vocab section is empty");

        let byte_encoder = byte_alphabet();
        let byte_decoder: HashMap<char, u8> = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        // Every base byte symbol must resolve, otherwise encoding could drop
        // input bytes silently.
        for (b, c) in byte_encoder.iter().enumerate() {
            anyhow::ensure!(
                file.vocab.contains_key(&c.to_string()),
                "vocab is missing the base symbol for byte {b:#04x}"
            );
        }

        let mut merge_rank = HashMap::with_capacity(file.merges.len());
        for (rank, pair) in file.merges.iter().enumerate() {
            anyhow::ensure!(
                pair.split(' ').count() == 2,
                "malformed merge entry {pair:?}"
            );
            merge_rank.insert(pair.clone(), rank);
        }

        let required = |name: &str| -> Result<u32> {
            file.special_tokens
                .get(name)
                .copied()
                .with_context(|| format!("special_tokens is missing {name}"))
        };
        let bos = required(BOS_TOKEN)?;
        let eos = required(EOS_TOKEN)?;
        let system = required(SYSTEM_TOKEN)?;
        let user = required(USER_TOKEN)?;
        let assistant = required(ASSISTANT_TOKEN)?;

        let mut languages: Vec<(String, u32)> = file
            .special_tokens
            .iter()
            .filter_map(|(name, &id)| {
                let tag = name.strip_prefix(LANG_PREFIX)?.strip_suffix(LANG_SUFFIX)?;
                (!tag.is_empty()).then(|| (tag.to_ascii_lowercase(), id))
            })
            .collect();
        languages.sort();

        let token_by_id = file.vocab.iter().map(|(t, &id)| (id, t.clone())).collect();
        let special_ids = file.special_tokens.values().copied().collect();

        Ok(Self {
            vocab: file.vocab,
            token_by_id,
            merge_rank,
            byte_encoder,
            byte_decoder,
            special_ids,
            special_by_name: file.special_tokens,
            languages,
            bos,
            eos,
            system,
            user,
            assistant,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let json = std::fs::read_to_string(path_ref)
            .with_context(|| format!("read {}", path_ref.display()))?;
        Self::from_json_str(&json)
    }

    pub fn bos_id(&self) -> u32 {
        self.bos
    }

    pub fn eos_id(&self) -> u32 {
        self.eos
    }

    pub fn system_id(&self) -> u32 {
        self.system
    }

    pub fn user_id(&self) -> u32 {
        self.user
    }

    pub fn assistant_id(&self) -> u32 {
        self.assistant
    }

    pub fn special_id(&self, name: &str) -> Option<u32> {
        self.special_by_name.get(name).copied()
    }

    pub fn is_special(&self, id: u32) -> bool {
        self.special_ids.contains(&id)
    }

    /// Token id of `<|lang_xx|>` for a language name, matched case-insensitively.
    pub fn language_id(&self, language: &str) -> Option<u32> {
        let tag = language.to_ascii_lowercase();
        self.languages
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|&(_, id)| id)
    }

    /// Comma-separated display names of the supported languages.
    pub fn supported_languages_csv(&self) -> String {
        let names: Vec<String> = self
            .languages
            .iter()
            .map(|(tag, _)| {
                let mut chars = tag.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect();
        names.join(",")
    }

    /// Encode UTF-8 text into token ids.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut symbols: Vec<String> = text
            .bytes()
            .map(|b| self.byte_encoder[b as usize].to_string())
            .collect();

        // Greedy BPE: repeatedly apply the highest-priority merge among
        // adjacent pairs until none applies.
        while symbols.len() > 1 {
            let mut best: Option<(usize, usize)> = None; // (rank, position)
            let mut key = String::new();
            for i in 0..symbols.len() - 1 {
                key.clear();
                key.push_str(&symbols[i]);
                key.push(' ');
                key.push_str(&symbols[i + 1]);
                if let Some(&rank) = self.merge_rank.get(&key) {
                    if best.is_none_or(|(r, _)| rank < r) {
                        best = Some((rank, i));
                    }
                }
            }
            let Some((_, pos)) = best else { break };
            let right = symbols.remove(pos + 1);
            symbols[pos].push_str(&right);
        }

        let mut ids = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            if let Some(&id) = self.vocab.get(symbol) {
                ids.push(id);
            } else {
                // A merge produced a symbol absent from the vocab; fall back
                // to its base byte symbols, which are validated at load.
                for c in symbol.chars() {
                    ids.push(self.vocab[&c.to_string()]);
                }
            }
        }
        ids
    }

    /// Decode token ids into UTF-8 text. Special tokens are skipped; byte
    /// sequences that are not valid UTF-8 decode lossily.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::<u8>::new();
        for &id in ids {
            if self.special_ids.contains(&id) {
                continue;
            }
            let Some(token) = self.token_by_id.get(&id) else {
                continue;
            };
            for c in token.chars() {
                match self.byte_decoder.get(&c) {
                    Some(&b) => bytes.push(b),
                    // Outside the byte alphabet: pass the character through.
                    None => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
        }
        String::from_utf8_lossy(&bytes).to_string()
    }
}
