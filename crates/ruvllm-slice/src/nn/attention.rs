//! Grouped-query causal self-attention with a KV cache

use super::init::linear;
use super::rotary::{apply_rotary_pos_emb, default_position_ids, RotaryEmbedding};
use super::LayerArgs;
use crate::error::Result;
use crate::state_dict::{join, Parameterized, StateDict};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Value used for masked attention scores. Finite so fully masked rows
/// (left padding) stay NaN-free.
pub const MASK_VALUE: f32 = f32::MIN;

/// Cached keys and values of one layer, each `[batch, num_kv_heads, seq, head_dim]`
#[derive(Debug, Clone)]
pub struct KvEntry {
    /// Keys (after RoPE)
    pub key: Tensor,
    /// Values
    pub value: Tensor,
}

impl KvEntry {
    /// Number of cached positions
    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.key.dim(2)?)
    }
}

/// Attention geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionConfig {
    /// Residual stream width
    pub hidden_size: usize,
    /// Query heads
    pub num_heads: usize,
    /// Key/value heads
    pub num_kv_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
    /// Bias on q/k/v/o
    pub bias: bool,
    /// Sliding attention window
    pub sliding_window: Option<usize>,
}

/// Result of one attention call
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, seq, hidden]`
    pub hidden_states: Tensor,
    /// `[batch, heads, seq, kv_len]`, when requested
    pub attn_weights: Option<Tensor>,
    /// Updated cache, when `use_cache` is set
    pub present_key_value: Option<KvEntry>,
}

/// Multi-head self-attention with grouped KV heads and rotary embeddings.
#[derive(Debug, Clone)]
pub struct CausalSelfAttention {
    /// Query projection
    pub q_proj: Linear,
    /// Key projection
    pub k_proj: Linear,
    /// Value projection
    pub v_proj: Linear,
    /// Output projection
    pub o_proj: Linear,
    rotary: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    sliding_window: Option<usize>,
}

impl CausalSelfAttention {
    /// Load the four projections from `vb`
    pub fn load(cfg: &AttentionConfig, rotary: RotaryEmbedding, vb: VarBuilder) -> Result<Self> {
        let q_dim = cfg.num_heads * cfg.head_dim;
        let kv_dim = cfg.num_kv_heads * cfg.head_dim;

        Ok(Self {
            q_proj: linear(cfg.hidden_size, q_dim, cfg.bias, vb.pp("q_proj"))?,
            k_proj: linear(cfg.hidden_size, kv_dim, cfg.bias, vb.pp("k_proj"))?,
            v_proj: linear(cfg.hidden_size, kv_dim, cfg.bias, vb.pp("v_proj"))?,
            o_proj: linear(q_dim, cfg.hidden_size, cfg.bias, vb.pp("o_proj"))?,
            rotary,
            num_heads: cfg.num_heads,
            num_kv_heads: cfg.num_kv_heads,
            head_dim: cfg.head_dim,
            sliding_window: cfg.sliding_window,
        })
    }

    /// Sliding attention window
    pub fn sliding_window(&self) -> Option<usize> {
        self.sliding_window
    }

    /// Attend over `hidden_states` (`[batch, seq, hidden]`).
    ///
    /// Without an explicit `attention_mask` a causal mask (with the sliding
    /// window, if any) is built. Without `position_embeddings` the rotary
    /// table is evaluated at `position_ids`, or at positions following the
    /// cache.
    pub fn forward(&self, hidden_states: &Tensor, args: &LayerArgs<'_>) -> Result<AttentionOutput> {
        let (batch, q_len, _) = hidden_states.dims3()?;
        let device = hidden_states.device();

        let q = self.split_heads(&self.q_proj.forward(hidden_states)?, self.num_heads)?;
        let k = self.split_heads(&self.k_proj.forward(hidden_states)?, self.num_kv_heads)?;
        let v = self.split_heads(&self.v_proj.forward(hidden_states)?, self.num_kv_heads)?;

        let past_len = match args.past_key_value {
            Some(past) => past.seq_len()?,
            None => 0,
        };

        let (cos, sin) = match args.position_embeddings {
            Some((cos, sin)) => (cos.clone(), sin.clone()),
            None => {
                let position_ids = match args.position_ids {
                    Some(ids) => ids.clone(),
                    None => default_position_ids(batch, q_len, past_len, device)?,
                };
                self.rotary.forward(&position_ids, q.dtype())?
            }
        };
        let (q, k) = apply_rotary_pos_emb(&q, &k, &cos, &sin)?;

        let (k, v) = match args.past_key_value {
            Some(past) => (
                Tensor::cat(&[&past.key, &k], 2)?,
                Tensor::cat(&[&past.value, &v], 2)?,
            ),
            None => (k, v),
        };
        let present_key_value = args.use_cache.then(|| KvEntry {
            key: k.clone(),
            value: v.clone(),
        });

        // GQA
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?.to_dtype(DType::F32)?;
        let mask = match args.attention_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => causal_mask(q_len, past_len, self.sliding_window, device)?,
        };
        let scores = scores.broadcast_add(&mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;

        let attn = weights
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?;
        let hidden_states = self.o_proj.forward(&attn)?;

        Ok(AttentionOutput {
            hidden_states,
            attn_weights: args.output_attentions.then_some(weights),
            present_key_value,
        })
    }

    fn split_heads(&self, xs: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq_len, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

impl Parameterized for CausalSelfAttention {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.q_proj.named_parameters(&join(prefix, "q_proj"), out);
        self.k_proj.named_parameters(&join(prefix, "k_proj"), out);
        self.v_proj.named_parameters(&join(prefix, "v_proj"), out);
        self.o_proj.named_parameters(&join(prefix, "o_proj"), out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.q_proj.assign_parameters(&join(prefix, "q_proj"), sd)?;
        self.k_proj.assign_parameters(&join(prefix, "k_proj"), sd)?;
        self.v_proj.assign_parameters(&join(prefix, "v_proj"), sd)?;
        self.o_proj.assign_parameters(&join(prefix, "o_proj"), sd)
    }
}

/// Repeat each KV head `n_rep` times along the head axis
pub fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs);
    }
    let (batch, n_kv_heads, seq_len, head_dim) = xs.dims4()?;
    let repeated = Tensor::cat(&vec![&xs; n_rep], 2)?;
    Ok(repeated.reshape((batch, n_kv_heads * n_rep, seq_len, head_dim))?)
}

/// Additive causal mask `[1, 1, q_len, past_len + q_len]` in f32.
///
/// Query `i` sits at absolute position `past_len + i` and sees key `j` when
/// `j <= past_len + i` and, with a window, `past_len + i - j < window`.
pub fn causal_mask(q_len: usize, past_len: usize, sliding_window: Option<usize>, device: &Device) -> Result<Tensor> {
    let kv_len = past_len + q_len;
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            let pos = past_len + i;
            (0..kv_len).map(move |j| {
                let visible = j <= pos && sliding_window.map_or(true, |w| pos - j < w);
                if visible {
                    0.0
                } else {
                    MASK_VALUE
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, q_len, kv_len), device)?)
}

/// Combine the causal mask with a `[batch, kv_len]` keep/pad mask (1 = keep)
/// into `[batch, 1, q_len, kv_len]`
pub fn expand_attention_mask(
    padding_mask: &Tensor,
    q_len: usize,
    past_len: usize,
    sliding_window: Option<usize>,
) -> Result<Tensor> {
    let (batch, kv_len) = padding_mask.dims2()?;
    let causal = causal_mask(q_len, past_len, sliding_window, padding_mask.device())?;

    // 1 -> 0, 0 -> MASK_VALUE
    let padding = padding_mask
        .to_dtype(DType::F32)?
        .affine(-1.0, 1.0)?
        .affine(MASK_VALUE as f64, 0.0)?
        .reshape((batch, 1, 1, kv_len))?;
    Ok(causal.broadcast_minimum(&padding)?)
}
