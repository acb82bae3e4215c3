use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer as HfTokenizer;

const EOS_CANDIDATES: &[&str] = &[
    "<|endoftext|>",
    "</s>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
    "<eos>",
];

const BOS_CANDIDATES: &[&str] = &["<s>", "<|begin_of_text|>", "<bos>"];

/// HuggingFace tokenizer plus the special tokens the decode loop needs.
pub struct TextTokenizer {
    tokenizer: HfTokenizer,
    eos_token_ids: Vec<u32>,
    bos_token_id: Option<u32>,
}

impl TextTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = HfTokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("failed to read tokenizer {}: {}", path.display(), e)
        })?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    pub fn from_tokenizer(tokenizer: HfTokenizer) -> Self {
        let eos_token_ids = EOS_CANDIDATES
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .take(1)
            .collect();
        let bos_token_id = BOS_CANDIDATES.iter().find_map(|t| tokenizer.token_to_id(t));

        Self {
            tokenizer,
            eos_token_ids,
            bos_token_id,
        }
    }

    /// Replace the guessed end-of-sequence ids with the ones the model declares.
    pub fn with_eos_ids(mut self, ids: Vec<u32>) -> Self {
        if !ids.is_empty() {
            self.eos_token_ids = ids;
        }
        self
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow::anyhow!("decoding failed: {}", e))
    }

    /// Token count without special tokens; falls back to a character heuristic if the
    /// tokenizer rejects the input.
    pub fn count(&self, text: &str) -> usize {
        match self.encode(text, false) {
            Ok(ids) => ids.len(),
            Err(_) => crate::context::heuristic_token_count(text),
        }
    }

    /// Length of `prompt` as generation encodes it: special tokens added, and an empty
    /// prompt seeded with one token.
    pub fn prompt_len(&self, prompt: &str) -> usize {
        match self.encode(prompt, true) {
            Ok(ids) => ids.len().max(1),
            Err(_) => crate::context::heuristic_token_count(prompt).max(1),
        }
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }

    /// Token used to start generation from an empty prompt.
    pub fn seed_token(&self) -> Option<u32> {
        self.bos_token_id.or_else(|| self.eos_token_ids.first().copied())
    }
}

/// `eos_token_id` from a model config, which may be a number or a list.
pub(crate) fn eos_ids_from_config(config: &serde_json::Value) -> Vec<u32> {
    match config.get("eos_token_id") {
        Some(serde_json::Value::Number(n)) => {
            n.as_u64().map(|v| vec![v as u32]).unwrap_or_default()
        }
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_u64())
            .map(|v| v as u32)
            .collect(),
        _ => Vec::new(),
    }
}
