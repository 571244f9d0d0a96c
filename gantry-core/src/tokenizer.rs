use std::collections::HashMap;

use crate::{GantryError, Result};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn eos_token_id(&self) -> Option<u32>;
    fn vocab_size(&self) -> usize;
}

/// Fixed-vocabulary tokenizer with greedy longest-match encoding.
///
/// Token ids are assigned in insertion order. Decoding concatenates token
/// strings, so `decode(encode(s)) == s` whenever `s` is encodable.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    id_to_token: Vec<String>,
    token_to_id: HashMap<String, u32>,
    eos_token_id: Option<u32>,
    max_token_chars: usize,
}

impl VocabTokenizer {
    /// Build from a token list. Duplicates and empty strings are skipped.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut id_to_token = Vec::new();
        let mut token_to_id = HashMap::new();
        let mut max_token_chars = 0;
        for token in tokens {
            let token = token.into();
            if token.is_empty() || token_to_id.contains_key(&token) {
                continue;
            }
            max_token_chars = max_token_chars.max(token.chars().count());
            token_to_id.insert(token.clone(), id_to_token.len() as u32);
            id_to_token.push(token);
        }
        Self {
            id_to_token,
            token_to_id,
            eos_token_id: None,
            max_token_chars,
        }
    }

    /// Vocabulary of every printable ASCII character plus `words`.
    pub fn ascii_with<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chars = (b' '..=b'~').map(|b| (b as char).to_string());
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        Self::new(chars.chain(["\n".to_string()]).chain(words))
    }

    /// Mark an existing token (or a newly appended one) as end-of-sequence.
    pub fn with_eos(mut self, eos: &str) -> Self {
        let id = match self.token_to_id.get(eos) {
            Some(&id) => id,
            None => {
                let id = self.id_to_token.len() as u32;
                self.max_token_chars = self.max_token_chars.max(eos.chars().count());
                self.token_to_id.insert(eos.to_string(), id);
                self.id_to_token.push(eos.to_string());
                id
            }
        };
        self.eos_token_id = Some(id);
        self
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let mut ids = Vec::new();
        let mut start = 0;
        while start + 1 < boundaries.len() {
            let longest = (start + 1..boundaries.len())
                .take(self.max_token_chars)
                .rev()
                .find_map(|end| {
                    let piece = &text[boundaries[start]..boundaries[end]];
                    self.token_to_id.get(piece).map(|&id| (id, end))
                });
            match longest {
                Some((id, end)) => {
                    ids.push(id);
                    start = end;
                }
                None => {
                    return Err(GantryError::Tokenizer(format!(
                        "no token covers {:?} at byte {}",
                        &text[boundaries[start]..],
                        boundaries[start]
                    )))
                }
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut text = String::new();
        for &id in ids {
            let token = self
                .token(id)
                .ok_or_else(|| GantryError::Tokenizer(format!("unknown token id {id}")))?;
            text.push_str(token);
        }
        Ok(text)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }
}
