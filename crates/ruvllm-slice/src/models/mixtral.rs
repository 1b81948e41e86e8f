//! Mixtral decoder stack (TinyMix included)
//!
//! Same attention as Llama plus an optional sliding window; the MLP junction
//! is a sparse mixture of experts whose router logits can be returned per
//! layer.

use super::{past_length, run_layers, write_checkpoint, CausalLm, CausalLmOutput};
use crate::adapter::{add_residual, DecoderBlock, Shortcuts};
use crate::adapters::tinymix::CompressedMixtralDecoderLayer;
use crate::config::{MixtralConfig, PretrainedConfig};
use crate::error::Result;
use crate::nn::rotary::default_position_ids;
use crate::nn::{
    expand_attention_mask, shell_var_builder, AttentionConfig, CausalSelfAttention, KvEntry, LayerArgs,
    LayerOutput, RmsNorm, RotaryEmbedding, SparseMoeBlock, WeightInit,
};
use crate::state_dict::{join, Parameterized, StateDict};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};
use std::any::Any;
use std::path::Path;

fn attention_config(config: &MixtralConfig) -> AttentionConfig {
    AttentionConfig {
        hidden_size: config.base.hidden_size,
        num_heads: config.base.num_attention_heads,
        num_kv_heads: config.base.num_kv_heads(),
        head_dim: config.base.head_dim(),
        bias: false,
        sliding_window: config.sliding_window,
    }
}

fn rotary_embedding(config: &MixtralConfig, device: &Device) -> Result<RotaryEmbedding> {
    RotaryEmbedding::new(config.base.head_dim(), config.rope_theta(), None, device)
}

// ============================================================================
// Decoder layer
// ============================================================================

/// Pre-norm decoder layer with a sparse expert block in place of the MLP
#[derive(Debug, Clone)]
pub struct MixtralDecoderLayer {
    /// Self attention
    pub self_attn: CausalSelfAttention,
    /// Router and experts
    pub block_sparse_moe: SparseMoeBlock,
    /// Norm before attention
    pub input_layernorm: RmsNorm,
    /// Norm before the experts
    pub post_attention_layernorm: RmsNorm,
    layer_idx: usize,
}

impl MixtralDecoderLayer {
    /// Load layer `layer_idx` from `vb` (rooted at the layer)
    pub fn load(config: &MixtralConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let base = &config.base;
        let rotary = rotary_embedding(config, vb.device())?;

        Ok(Self {
            self_attn: CausalSelfAttention::load(&attention_config(config), rotary, vb.pp("self_attn"))?,
            block_sparse_moe: SparseMoeBlock::load(
                base.hidden_size,
                base.intermediate_size,
                config.num_local_experts,
                config.num_experts_per_tok,
                vb.pp("block_sparse_moe"),
            )?,
            input_layernorm: RmsNorm::load(base.hidden_size, base.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::load(
                base.hidden_size,
                base.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            layer_idx,
        })
    }

    /// Build a standalone layer
    pub fn new(config: &MixtralConfig, layer_idx: usize, init: WeightInit, dtype: DType, device: &Device) -> Result<Self> {
        Self::load(config, layer_idx, shell_var_builder(init, dtype, device))
    }

    pub(crate) fn forward_with_shortcuts(
        &self,
        hidden_states: &Tensor,
        args: &LayerArgs<'_>,
        shortcuts: Option<&Shortcuts>,
    ) -> Result<LayerOutput> {
        // Self attention
        let residual = hidden_states;
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn = self.self_attn.forward(&normed, args)?;
        let attn_q = shortcuts.and_then(|s| s.attn_shortcut_q.as_ref());
        let hidden_states = add_residual(residual, &attn.hidden_states, attn_q)?;

        // Experts
        let residual = &hidden_states;
        let normed = self.post_attention_layernorm.forward(residual)?;
        let (moe_out, router_logits) = self.block_sparse_moe.forward(&normed)?;
        let mlp_q = shortcuts.and_then(|s| s.mlp_shortcut_q.as_ref());
        let hidden_states = add_residual(residual, &moe_out, mlp_q)?;

        Ok(LayerOutput {
            hidden_states,
            attn_weights: attn.attn_weights,
            present_key_value: attn.present_key_value,
            router_logits: args.output_router_logits.then_some(router_logits),
        })
    }
}

impl Parameterized for MixtralDecoderLayer {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.self_attn.named_parameters(&join(prefix, "self_attn"), out);
        self.block_sparse_moe
            .named_parameters(&join(prefix, "block_sparse_moe"), out);
        self.input_layernorm.named_parameters(&join(prefix, "input_layernorm"), out);
        self.post_attention_layernorm
            .named_parameters(&join(prefix, "post_attention_layernorm"), out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.self_attn.assign_parameters(&join(prefix, "self_attn"), sd)?;
        self.block_sparse_moe
            .assign_parameters(&join(prefix, "block_sparse_moe"), sd)?;
        self.input_layernorm.assign_parameters(&join(prefix, "input_layernorm"), sd)?;
        self.post_attention_layernorm
            .assign_parameters(&join(prefix, "post_attention_layernorm"), sd)
    }
}

impl DecoderBlock for MixtralDecoderLayer {
    fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    fn forward(&self, hidden_states: &Tensor, args: &LayerArgs<'_>) -> Result<LayerOutput> {
        self.forward_with_shortcuts(hidden_states, args, None)
    }

    fn state_dict(&self) -> StateDict {
        self.to_state_dict()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// One layer slot of a Mixtral model
#[derive(Debug, Clone)]
pub enum MixtralBlock {
    /// Native layer
    Original(MixtralDecoderLayer),
    /// Layer with shortcut slots
    Compressed(CompressedMixtralDecoderLayer),
}

impl MixtralBlock {
    /// The underlying attention/expert structure
    pub fn decoder(&self) -> &MixtralDecoderLayer {
        match self {
            Self::Original(layer) => layer,
            Self::Compressed(layer) => layer.decoder(),
        }
    }

    /// The underlying attention/expert structure, mutably
    pub fn decoder_mut(&mut self) -> &mut MixtralDecoderLayer {
        match self {
            Self::Original(layer) => layer,
            Self::Compressed(layer) => layer.decoder_mut(),
        }
    }

    /// The slot as a trait object
    pub fn as_block(&self) -> &dyn DecoderBlock {
        match self {
            Self::Original(layer) => layer,
            Self::Compressed(layer) => layer,
        }
    }

    /// The slot as a mutable trait object
    pub fn as_block_mut(&mut self) -> &mut dyn DecoderBlock {
        match self {
            Self::Original(layer) => layer,
            Self::Compressed(layer) => layer,
        }
    }
}

// ============================================================================
// Model
// ============================================================================

/// Embeddings, decoder layers and final norm
#[derive(Debug, Clone)]
pub struct MixtralModel {
    /// Token embeddings
    pub embed_tokens: Embedding,
    /// Decoder layers
    pub layers: Vec<MixtralBlock>,
    /// Final norm
    pub norm: RmsNorm,
    rotary: RotaryEmbedding,
}

/// Mixtral with a language-modelling head
#[derive(Debug, Clone)]
pub struct MixtralForCausalLM {
    /// Decoder stack
    pub model: MixtralModel,
    /// Output projection to the vocabulary
    pub lm_head: Linear,
    config: MixtralConfig,
    device: Device,
    dtype: DType,
}

impl MixtralForCausalLM {
    /// Load every parameter from `vb` (rooted at the checkpoint)
    pub fn load(config: MixtralConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let base = &config.base;
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let embed_tokens = candle_nn::embedding(base.vocab_size, base.hidden_size, vb.pp("model.embed_tokens"))?;
        let layers = (0..base.num_hidden_layers)
            .map(|i| {
                MixtralDecoderLayer::load(&config, i, vb.pp("model.layers").pp(i)).map(MixtralBlock::Original)
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::load(base.hidden_size, base.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = if base.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(base.hidden_size, base.vocab_size, vb.pp("lm_head"))?
        };
        let rotary = rotary_embedding(&config, &device)?;

        tracing::info!(
            "Built Mixtral model: {} layers, {} experts (top {}), hidden {}, {:?}",
            base.num_hidden_layers,
            config.num_local_experts,
            config.num_experts_per_tok,
            base.hidden_size,
            dtype
        );

        Ok(Self {
            model: MixtralModel {
                embed_tokens,
                layers,
                norm,
                rotary,
            },
            lm_head,
            config,
            device,
            dtype,
        })
    }

    /// Build a model without a checkpoint
    pub fn new(config: MixtralConfig, init: WeightInit, dtype: DType, device: &Device) -> Result<Self> {
        Self::load(config, shell_var_builder(init, dtype, device))
    }

    /// Model configuration
    pub fn config(&self) -> &MixtralConfig {
        &self.config
    }

    /// Model configuration, mutably
    pub fn config_mut(&mut self) -> &mut MixtralConfig {
        &mut self.config
    }

    /// `lm_head` still shares the embedding table.
    ///
    /// Replacing either one unties them; the other keeps its tensor.
    pub fn lm_head_is_tied(&self) -> bool {
        self.config.base.tie_word_embeddings
            && self.lm_head.weight().id() == self.model.embed_tokens.embeddings().id()
    }
}

impl Parameterized for MixtralForCausalLM {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.model
            .embed_tokens
            .named_parameters(&join(prefix, "model.embed_tokens"), out);
        for (i, layer) in self.model.layers.iter().enumerate() {
            let layer_prefix = join(prefix, &format!("model.layers.{}", i));
            layer.decoder().named_parameters(&layer_prefix, out);
        }
        self.model.norm.named_parameters(&join(prefix, "model.norm"), out);
        // Tied checkpoints carry the table once, as HF writes them
        if !self.lm_head_is_tied() {
            self.lm_head.named_parameters(&join(prefix, "lm_head"), out);
        }
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        let tied = self.lm_head_is_tied();
        self.model
            .embed_tokens
            .assign_parameters(&join(prefix, "model.embed_tokens"), sd)?;
        for (i, layer) in self.model.layers.iter_mut().enumerate() {
            let layer_prefix = join(prefix, &format!("model.layers.{}", i));
            layer.decoder_mut().assign_parameters(&layer_prefix, sd)?;
        }
        self.model.norm.assign_parameters(&join(prefix, "model.norm"), sd)?;
        if tied {
            self.lm_head = Linear::new(self.model.embed_tokens.embeddings().clone(), None);
            return Ok(());
        }
        self.lm_head.assign_parameters(&join(prefix, "lm_head"), sd)
    }
}

impl CausalLm for MixtralForCausalLM {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        past_key_values: Option<&[KvEntry]>,
    ) -> Result<CausalLmOutput> {
        let (batch, seq_len) = input_ids.dims2()?;
        let past_len = past_length(past_key_values)?;

        let hidden_states = self.model.embed_tokens.forward(input_ids)?;
        let position_ids = default_position_ids(batch, seq_len, past_len, &self.device)?;
        let (cos, sin) = self.model.rotary.forward(&position_ids, hidden_states.dtype())?;
        let mask = attention_mask
            .map(|mask| expand_attention_mask(mask, seq_len, past_len, self.config.sliding_window))
            .transpose()?;
        let use_cache = self.config.use_cache();
        let output_router_logits = self.config.output_router_logits;

        let base = LayerArgs {
            attention_mask: mask.as_ref(),
            position_ids: Some(&position_ids),
            use_cache,
            output_router_logits,
            position_embeddings: Some((&cos, &sin)),
            ..Default::default()
        };
        let stack = run_layers(
            self.model.layers.iter().map(MixtralBlock::as_block),
            hidden_states,
            base,
            past_key_values,
        )?;

        let hidden_states = self.model.norm.forward(&stack.hidden_states)?;
        let logits = self.lm_head.forward(&hidden_states)?.to_dtype(DType::F32)?;

        Ok(CausalLmOutput {
            logits,
            past_key_values: use_cache.then_some(stack.presents),
            router_logits: output_router_logits.then_some(stack.router_logits),
        })
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn num_layers(&self) -> usize {
        self.model.layers.len()
    }

    fn state_dict(&self) -> StateDict {
        self.to_state_dict()
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        let mut config = self.config.clone();
        config.base.tie_word_embeddings = self.lm_head_is_tied();
        write_checkpoint(&config, "MixtralForCausalLM", self.to_state_dict(), dir)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
