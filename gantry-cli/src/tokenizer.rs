use std::path::Path;

use gantry_core::{GantryError, Result, Tokenizer};
use tokenizers::Tokenizer as Inner;

/// Adapter over a Hugging Face `tokenizer.json`.
pub struct HfTokenizer {
    inner: Inner,
    eos_token_id: Option<u32>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Inner::from_file(path).map_err(|e| GantryError::Tokenizer(e.to_string()))?;
        let eos_token_id = config_eos(path, &inner)
            .or_else(|| inner.token_to_id("</s>"))
            .or_else(|| inner.token_to_id("<|endoftext|>"))
            .or_else(|| inner.token_to_id("<|im_end|>"))
            .or_else(|| inner.token_to_id("<|eot_id|>"));
        Ok(Self {
            inner,
            eos_token_id,
        })
    }
}

/// EOS from a sibling `tokenizer_config.json`, as an id or a token string.
fn config_eos(path: &Path, inner: &Inner) -> Option<u32> {
    let config_path = path.parent()?.join("tokenizer_config.json");
    let text = std::fs::read_to_string(config_path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    if let Some(id) = value.get("eos_token_id").and_then(|v| v.as_u64()) {
        return u32::try_from(id).ok();
    }
    // Either "</s>" or {"content": "</s>", ...}
    let token = value.get("eos_token").and_then(|v| {
        v.as_str()
            .or_else(|| v.get("content").and_then(|c| c.as_str()))
    })?;
    inner.token_to_id(token)
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| GantryError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| GantryError::Tokenizer(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
