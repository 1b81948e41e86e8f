//! Neural network building blocks on Candle
//!
//! Everything a Llama or Mixtral decoder stack needs, with HF parameter
//! names so checkpoints load directly and state dicts line up one-to-one.

pub mod attention;
pub mod init;
pub mod mlp;
pub mod moe;
pub mod norm;
pub mod rotary;

pub use attention::{
    causal_mask, expand_attention_mask, AttentionConfig, AttentionOutput, CausalSelfAttention, KvEntry,
};
pub use init::{shell_var_builder, WeightInit};
pub use mlp::GatedMlp;
pub use moe::{FusedExperts, SparseMoeBlock};
pub use norm::RmsNorm;
pub use rotary::RotaryEmbedding;

use candle_core::Tensor;

/// Arguments forwarded unchanged through a decoder layer to its attention
/// and expert sub-blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerArgs<'a> {
    /// Additive mask broadcastable to `[batch, heads, seq, kv_len]`; a causal
    /// mask is built when absent
    pub attention_mask: Option<&'a Tensor>,
    /// `[batch, seq]` absolute positions
    pub position_ids: Option<&'a Tensor>,
    /// Cache of earlier positions
    pub past_key_value: Option<&'a KvEntry>,
    /// Return attention probabilities
    pub output_attentions: bool,
    /// Return router logits (MoE layers only)
    pub output_router_logits: bool,
    /// Return the updated cache
    pub use_cache: bool,
    /// Precomputed rotary `(cos, sin)`, each `[batch, seq, head_dim]`
    pub position_embeddings: Option<(&'a Tensor, &'a Tensor)>,
}

/// What a decoder layer returns, in HF tuple order: hidden states, then the
/// optional attention weights, cache entry and router logits.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// `[batch, seq, hidden]`
    pub hidden_states: Tensor,
    /// Present when `output_attentions` was set
    pub attn_weights: Option<Tensor>,
    /// Present when `use_cache` was set
    pub present_key_value: Option<KvEntry>,
    /// Present when `output_router_logits` was set on a MoE layer
    pub router_logits: Option<Tensor>,
}

impl LayerOutput {
    /// Number of entries the equivalent HF output tuple would hold
    pub fn len(&self) -> usize {
        1 + usize::from(self.attn_weights.is_some())
            + usize::from(self.present_key_value.is_some())
            + usize::from(self.router_logits.is_some())
    }

    /// Never empty: hidden states are always present
    pub fn is_empty(&self) -> bool {
        false
    }
}
