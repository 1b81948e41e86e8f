//! Llama decoder stack (Llama-3 / 3.1)

use super::{past_length, run_layers, write_checkpoint, CausalLm, CausalLmOutput};
use crate::adapter::{add_residual, DecoderBlock, Shortcuts};
use crate::adapters::llama3::CompressedLlama3DecoderLayer;
use crate::config::{LlamaConfig, PretrainedConfig};
use crate::error::Result;
use crate::nn::rotary::default_position_ids;
use crate::nn::{
    expand_attention_mask, shell_var_builder, AttentionConfig, CausalSelfAttention, GatedMlp, KvEntry,
    LayerArgs, LayerOutput, RmsNorm, RotaryEmbedding, WeightInit,
};
use crate::state_dict::{join, Parameterized, StateDict};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};
use std::any::Any;
use std::path::Path;

fn attention_config(config: &LlamaConfig) -> AttentionConfig {
    AttentionConfig {
        hidden_size: config.base.hidden_size,
        num_heads: config.base.num_attention_heads,
        num_kv_heads: config.base.num_kv_heads(),
        head_dim: config.base.head_dim(),
        bias: config.attention_bias,
        sliding_window: None,
    }
}

fn rotary_embedding(config: &LlamaConfig, device: &Device) -> Result<RotaryEmbedding> {
    RotaryEmbedding::new(
        config.base.head_dim(),
        config.rope_theta(),
        config.rope_scaling.as_ref(),
        device,
    )
}

// ============================================================================
// Decoder layer
// ============================================================================

/// Pre-norm decoder layer: attention and SwiGLU MLP, each behind an RMS norm
/// and a residual add.
#[derive(Debug, Clone)]
pub struct LlamaDecoderLayer {
    /// Self attention
    pub self_attn: CausalSelfAttention,
    /// Feed-forward block
    pub mlp: GatedMlp,
    /// Norm before attention
    pub input_layernorm: RmsNorm,
    /// Norm before the MLP
    pub post_attention_layernorm: RmsNorm,
    layer_idx: usize,
}

impl LlamaDecoderLayer {
    /// Load layer `layer_idx` from `vb` (rooted at the layer)
    pub fn load(config: &LlamaConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let base = &config.base;
        let rotary = rotary_embedding(config, vb.device())?;

        Ok(Self {
            self_attn: CausalSelfAttention::load(&attention_config(config), rotary, vb.pp("self_attn"))?,
            mlp: GatedMlp::load(base.hidden_size, base.intermediate_size, vb.pp("mlp"))?,
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
    pub fn new(config: &LlamaConfig, layer_idx: usize, init: WeightInit, dtype: DType, device: &Device) -> Result<Self> {
        Self::load(config, layer_idx, shell_var_builder(init, dtype, device))
    }

    /// Forward pass, rotating the residual at each junction whose shortcut is
    /// attached
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

        // Fully connected
        let residual = &hidden_states;
        let normed = self.post_attention_layernorm.forward(residual)?;
        let mlp_out = self.mlp.forward(&normed)?;
        let mlp_q = shortcuts.and_then(|s| s.mlp_shortcut_q.as_ref());
        let hidden_states = add_residual(residual, &mlp_out, mlp_q)?;

        Ok(LayerOutput {
            hidden_states,
            attn_weights: attn.attn_weights,
            present_key_value: attn.present_key_value,
            router_logits: None,
        })
    }
}

impl Parameterized for LlamaDecoderLayer {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.self_attn.named_parameters(&join(prefix, "self_attn"), out);
        self.mlp.named_parameters(&join(prefix, "mlp"), out);
        self.input_layernorm.named_parameters(&join(prefix, "input_layernorm"), out);
        self.post_attention_layernorm
            .named_parameters(&join(prefix, "post_attention_layernorm"), out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.self_attn.assign_parameters(&join(prefix, "self_attn"), sd)?;
        self.mlp.assign_parameters(&join(prefix, "mlp"), sd)?;
        self.input_layernorm.assign_parameters(&join(prefix, "input_layernorm"), sd)?;
        self.post_attention_layernorm
            .assign_parameters(&join(prefix, "post_attention_layernorm"), sd)
    }
}

impl DecoderBlock for LlamaDecoderLayer {
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

/// One layer slot of a Llama model
#[derive(Debug, Clone)]
pub enum LlamaBlock {
    /// Native layer
    Original(LlamaDecoderLayer),
    /// Layer with shortcut slots
    Compressed(CompressedLlama3DecoderLayer),
}

impl LlamaBlock {
    /// The underlying attention/MLP structure
    pub fn decoder(&self) -> &LlamaDecoderLayer {
        match self {
            Self::Original(layer) => layer,
            Self::Compressed(layer) => layer.decoder(),
        }
    }

    /// The underlying attention/MLP structure, mutably
    pub fn decoder_mut(&mut self) -> &mut LlamaDecoderLayer {
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
pub struct LlamaModel {
    /// Token embeddings
    pub embed_tokens: Embedding,
    /// Decoder layers
    pub layers: Vec<LlamaBlock>,
    /// Final norm
    pub norm: RmsNorm,
    rotary: RotaryEmbedding,
}

/// Llama with a language-modelling head
#[derive(Debug, Clone)]
pub struct LlamaForCausalLM {
    /// Decoder stack
    pub model: LlamaModel,
    /// Output projection to the vocabulary
    pub lm_head: Linear,
    config: LlamaConfig,
    device: Device,
    dtype: DType,
}

impl LlamaForCausalLM {
    /// Load every parameter from `vb` (rooted at the checkpoint)
    pub fn load(config: LlamaConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let base = &config.base;
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let embed_tokens = candle_nn::embedding(base.vocab_size, base.hidden_size, vb.pp("model.embed_tokens"))?;
        let layers = (0..base.num_hidden_layers)
            .map(|i| {
                LlamaDecoderLayer::load(&config, i, vb.pp("model.layers").pp(i)).map(LlamaBlock::Original)
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
            "Built Llama model: {} layers, hidden {}, vocab {}, {:?}",
            base.num_hidden_layers,
            base.hidden_size,
            base.vocab_size,
            dtype
        );

        Ok(Self {
            model: LlamaModel {
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
    pub fn new(config: LlamaConfig, init: WeightInit, dtype: DType, device: &Device) -> Result<Self> {
        Self::load(config, shell_var_builder(init, dtype, device))
    }

    /// Model configuration
    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    /// Model configuration, mutably
    pub fn config_mut(&mut self) -> &mut LlamaConfig {
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

impl Parameterized for LlamaForCausalLM {
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

impl CausalLm for LlamaForCausalLM {
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
            .map(|mask| expand_attention_mask(mask, seq_len, past_len, None))
            .transpose()?;
        let use_cache = self.config.use_cache();

        let base = LayerArgs {
            attention_mask: mask.as_ref(),
            position_ids: Some(&position_ids),
            use_cache,
            position_embeddings: Some((&cos, &sin)),
            ..Default::default()
        };
        let stack = run_layers(
            self.model.layers.iter().map(LlamaBlock::as_block),
            hidden_states,
            base,
            past_key_values,
        )?;

        let hidden_states = self.model.norm.forward(&stack.hidden_states)?;
        let logits = self.lm_head.forward(&hidden_states)?.to_dtype(DType::F32)?;

        Ok(CausalLmOutput {
            logits,
            past_key_values: use_cache.then_some(stack.presents),
            router_logits: None,
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
        write_checkpoint(&config, "LlamaForCausalLM", self.to_state_dict(), dir)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiny_config(tie: bool) -> LlamaConfig {
        serde_json::from_value(json!({
            "vocab_size": 32,
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "max_position_embeddings": 64,
            "rope_theta": 500000.0,
            "tie_word_embeddings": tie
        }))
        .unwrap()
    }

    #[test]
    fn test_parameter_names_follow_hf_layout() {
        let model = LlamaForCausalLM::new(tiny_config(false), WeightInit::Skip, DType::F32, &Device::Cpu).unwrap();
        let sd = model.to_state_dict();

        assert!(sd.contains_key("model.embed_tokens.weight"));
        assert!(sd.contains_key("model.layers.1.self_attn.k_proj.weight"));
        assert!(sd.contains_key("model.layers.0.mlp.gate_proj.weight"));
        assert!(sd.contains_key("model.layers.0.post_attention_layernorm.weight"));
        assert!(sd.contains_key("model.norm.weight"));
        assert!(sd.contains_key("lm_head.weight"));
        assert_eq!(sd["model.layers.0.self_attn.k_proj.weight"].dims(), &[8, 16]);
        // 9 per layer, plus embeddings, norm and head
        assert_eq!(sd.len(), 2 * 9 + 3);
    }

    #[test]
    fn test_tied_head_shares_embedding_until_replaced() {
        let mut model = LlamaForCausalLM::new(tiny_config(true), WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
        assert!(model.lm_head_is_tied());

        let sd = model.to_state_dict();
        assert!(!sd.contains_key("lm_head.weight"));
        assert_eq!(sd.len(), 2 * 9 + 2);

        let head = Tensor::randn(0f32, 1.0, (32, 16), &Device::Cpu).unwrap();
        model.lm_head = Linear::new(head, None);
        assert!(!model.lm_head_is_tied());
        assert!(model.to_state_dict().contains_key("lm_head.weight"));
    }

    #[test]
    fn test_forward_logits_shape() {
        let model = LlamaForCausalLM::new(tiny_config(true), WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
        let input_ids = Tensor::new(&[[1u32, 5, 9], [2, 3, 4]], &Device::Cpu).unwrap();

        let out = model.forward(&input_ids, None, None).unwrap();
        assert_eq!(out.logits.dims(), &[2, 3, 32]);
        assert_eq!(out.logits.dtype(), DType::F32);
        assert_eq!(out.past_key_values.unwrap().len(), 2);
        assert!(out.router_logits.is_none());
    }

    #[test]
    fn test_cached_decoding_matches_full_pass() {
        let model = LlamaForCausalLM::new(tiny_config(false), WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
        let full_ids = Tensor::new(&[[3u32, 7, 11, 2]], &Device::Cpu).unwrap();
        let full = model.forward(&full_ids, None, None).unwrap().logits;

        let prefix = full_ids.narrow(1, 0, 3).unwrap();
        let last = full_ids.narrow(1, 3, 1).unwrap();
        let cache = model.forward(&prefix, None, None).unwrap().past_key_values.unwrap();
        let step = model.forward(&last, None, Some(&cache)).unwrap().logits;

        let diff = step
            .sub(&full.narrow(1, 3, 1).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-3);
    }

    #[test]
    fn test_right_padding_does_not_change_real_tokens() {
        let model = LlamaForCausalLM::new(tiny_config(false), WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
        let short = Tensor::new(&[[4u32, 8]], &Device::Cpu).unwrap();
        let padded = Tensor::new(&[[4u32, 8, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();

        let a = model.forward(&short, None, None).unwrap().logits;
        let b = model.forward(&padded, Some(&mask), None).unwrap().logits;
        let diff = a
            .sub(&b.narrow(1, 0, 2).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4);
    }
}
