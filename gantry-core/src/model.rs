use crate::Result;

/// One request's slice of a batched forward call.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqInput {
    pub request_id: String,
    /// History tokens the model has not ingested yet. The full prompt on prefill.
    pub tokens: Vec<u32>,
    /// Cache position of `tokens[0]`.
    pub position_offset: usize,
    pub is_prefill: bool,
}

/// A language model with a per-request positional cache.
///
/// `forward` returns one vocabulary-sized logits row per input, in input order,
/// predicting the token that follows each input's last token.
pub trait ForwardModel: Send {
    fn forward(&mut self, batch: &[SeqInput]) -> Result<Vec<Vec<f32>>>;

    /// Drop the last `n` cached positions of a request.
    fn rewind_cache(&mut self, request_id: &str, n: usize) -> Result<()>;

    /// Free everything held for a request. Unknown ids are not an error.
    fn release(&mut self, request_id: &str) -> Result<()>;

    fn vocab_size(&self) -> usize;

    /// Most positions the cache can hold for one request, if bounded.
    fn max_positions(&self) -> Option<usize> {
        None
    }
}
