//! Adapter contracts
//!
//! A compression engine works against two capability traits instead of
//! concrete architectures:
//!
//! - [`LayerAdapter`]: a view over one decoder block exposing its norms and
//!   the projections on the attention and MLP boundaries
//! - [`ModelAdapter`]: a whole causal LM exposing metadata, layer
//!   enumeration and replacement, embeddings, head, and compressed-layer
//!   construction
//!
//! Decoder blocks themselves are [`DecoderBlock`] trait objects so that a
//! native layer and its compressed counterpart can share a layer slot.

use crate::config::PretrainedConfig;
use crate::error::{Result, SliceError};
use crate::models::CausalLm;
use crate::nn::{LayerArgs, LayerOutput, RmsNorm};
use crate::state_dict::StateDict;
use crate::tokenizer::PadTokenizer;
use candle_core::Tensor;
use candle_nn::{Embedding, Linear};
use std::any::{Any, TypeId};
use std::fmt::Debug;

// ============================================================================
// Decoder blocks
// ============================================================================

/// One decoder layer, native or compressed.
pub trait DecoderBlock: Any + Send + Sync + Debug {
    /// Position of the block in its model
    fn layer_idx(&self) -> usize;

    /// Run the block on `hidden_states` (`[batch, seq, hidden]`)
    fn forward(&self, hidden_states: &Tensor, args: &LayerArgs<'_>) -> Result<LayerOutput>;

    /// Learned parameters under HF names relative to the block
    fn state_dict(&self) -> StateDict;

    /// Whether this block carries shortcut slots
    fn is_compressed(&self) -> bool {
        self.shortcuts().is_some()
    }

    /// Shortcut matrices of a compressed block
    fn shortcuts(&self) -> Option<&Shortcuts> {
        None
    }

    /// Shortcut matrices of a compressed block, mutably
    fn shortcuts_mut(&mut self) -> Option<&mut Shortcuts> {
        None
    }

    /// Upcast for downcasting to the concrete block type
    fn as_any(&self) -> &dyn Any;

    /// Owned upcast
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Optional rotations applied to the residual stream of a compressed block.
///
/// Both start absent; the compression engine attaches them after
/// conversion. Each is `[d_in, d_out]` so a sliced block may map the
/// residual into a smaller basis.
#[derive(Debug, Clone, Default)]
pub struct Shortcuts {
    /// Applied to the residual before the attention add
    pub attn_shortcut_q: Option<Tensor>,
    /// Applied to the residual before the MLP add
    pub mlp_shortcut_q: Option<Tensor>,
}

impl Shortcuts {
    /// Neither matrix attached
    pub fn is_empty(&self) -> bool {
        self.attn_shortcut_q.is_none() && self.mlp_shortcut_q.is_none()
    }
}

/// Residual recombination: `residual @ q + hidden_states` when `q` is
/// attached, `residual + hidden_states` otherwise.
pub fn add_residual(residual: &Tensor, hidden_states: &Tensor, shortcut_q: Option<&Tensor>) -> Result<Tensor> {
    let residual = match shortcut_q {
        Some(q) => residual.broadcast_matmul(&q.to_dtype(residual.dtype())?)?,
        None => residual.clone(),
    };
    Ok(residual.add(hidden_states)?)
}

// ============================================================================
// Layer adapter
// ============================================================================

/// View over one decoder block.
///
/// Accessors return projections by reference in a fixed order: attention
/// inputs are `[q, k, v]`, MLP inputs are `[gate, up]`. Downstream rotation
/// code indexes them positionally.
pub trait LayerAdapter {
    /// The wrapped block
    fn layer(&self) -> &dyn DecoderBlock;

    /// Index of the hidden states among the block's forward inputs
    fn hidden_states_args_position(&self) -> usize {
        0
    }

    /// Index of the hidden states in the block's output tuple
    fn hidden_states_output_position(&self) -> usize {
        0
    }

    /// Pre-attention norm
    fn get_first_layernorm(&self) -> &RmsNorm;

    /// Pre-attention norm, mutably
    fn get_first_layernorm_mut(&mut self) -> &mut RmsNorm;

    /// Pre-MLP norm
    fn get_second_layernorm(&self) -> &RmsNorm;

    /// Pre-MLP norm, mutably
    fn get_second_layernorm_mut(&mut self) -> &mut RmsNorm;

    /// `[q_proj, k_proj, v_proj]`
    fn get_attention_inputs(&self) -> Vec<&Linear>;

    /// `[q_proj, k_proj, v_proj]`, mutably
    fn get_attention_inputs_mut(&mut self) -> Vec<&mut Linear>;

    /// `o_proj`
    fn get_attention_output(&self) -> &Linear;

    /// `o_proj`, mutably
    fn get_attention_output_mut(&mut self) -> &mut Linear;

    /// `[gate, up]`
    fn get_mlp_inputs(&self) -> Vec<&Linear>;

    /// `[gate, up]`, mutably
    fn get_mlp_inputs_mut(&mut self) -> Vec<&mut Linear>;

    /// Output-side projection of the MLP or expert block
    fn get_mlp_output(&self) -> &Linear;

    /// Output-side projection, mutably
    fn get_mlp_output_mut(&mut self) -> &mut Linear;
}

// ============================================================================
// Model adapter
// ============================================================================

/// A whole causal LM seen through the compression contract.
///
/// Adapters own their model exclusively. Nothing here is internally
/// synchronised; the engine is expected to drive one adapter from one
/// thread.
pub trait ModelAdapter: Send + Sync {
    /// The wrapped model
    fn model(&self) -> &dyn CausalLm;

    /// Model configuration
    fn config(&self) -> &dyn PretrainedConfig;

    /// Model configuration, mutably
    fn config_mut(&mut self) -> &mut dyn PretrainedConfig;

    /// Expected concrete config type
    fn config_type(&self) -> TypeId;

    /// Attention and MLP run in parallel off the same norm
    fn parallel_blocks(&self) -> bool {
        false
    }

    /// A mean subtraction may be folded into adjacent linears
    fn should_bake_mean_into_linear(&self) -> bool {
        false
    }

    /// Native decoder layer type
    fn original_layer_type(&self) -> TypeId;

    /// Native norm type
    fn original_layer_norm_type(&self) -> TypeId;

    /// Layer adapter type
    fn layer_adapter_type(&self) -> TypeId;

    /// Compressed decoder layer type
    fn compressed_layer_type(&self) -> TypeId;

    /// Maximum sequence length
    fn seqlen(&self) -> usize {
        self.config().max_position_embeddings()
    }

    /// Residual stream width
    fn hidden_size(&self) -> usize {
        self.config().hidden_size()
    }

    /// Cache flag of the config
    fn use_cache(&self) -> bool {
        self.config().use_cache()
    }

    /// Set the cache flag of the config
    fn set_use_cache(&mut self, value: bool) {
        self.config_mut().set_use_cache(value);
    }

    /// Check the config is of [`ModelAdapter::config_type`]
    fn validate_config(&self) -> Result<()> {
        if self.config().as_any().type_id() != self.config_type() {
            return Err(SliceError::StructuralMismatch(format!(
                "Config of model type '{}' does not match the adapter",
                self.config().model_type()
            )));
        }
        Ok(())
    }

    /// Full forward pass; logits `[batch, seq, vocab]` in f32
    fn compute_output_logits(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Number of decoder layers
    fn num_layers(&self) -> usize;

    /// Fresh views over every decoder block, in model order
    fn get_layers(&mut self) -> Vec<Box<dyn LayerAdapter + '_>>;

    /// Block at `index`
    fn get_raw_layer_at(&self, index: usize) -> Result<&dyn DecoderBlock>;

    /// Block at `index`, mutably (e.g. to attach shortcuts)
    fn get_raw_layer_at_mut(&mut self, index: usize) -> Result<&mut dyn DecoderBlock>;

    /// Replace the block at `index`. Only the native and compressed block
    /// types of this architecture are accepted.
    fn set_raw_layer_at(&mut self, index: usize, layer: Box<dyn DecoderBlock>) -> Result<()>;

    /// Build a compressed block in the configured dtype and copy every
    /// parameter of `layer` into it by strict state transfer.
    ///
    /// `layer_idx` defaults to the index of `layer`.
    fn convert_layer_to_compressed(
        &self,
        layer: &dyn DecoderBlock,
        layer_idx: Option<usize>,
    ) -> Result<Box<dyn DecoderBlock>>;

    /// Embedding tables
    fn get_embeddings(&self) -> Vec<&Embedding>;

    /// Embedding tables, mutably
    fn get_embeddings_mut(&mut self) -> Vec<&mut Embedding>;

    /// Final norm before the head; fails if it is not the native norm type
    fn get_pre_head_layernorm(&self) -> Result<&RmsNorm>;

    /// Final norm before the head, mutably
    fn get_pre_head_layernorm_mut(&mut self) -> Result<&mut RmsNorm>;

    /// Output projection to the vocabulary
    fn get_lm_head(&self) -> &Linear;

    /// Output projection, mutably.
    ///
    /// With `tie_word_embeddings`, replacing the head unties it from the
    /// embedding table: the embeddings keep their tensor, and a saved
    /// checkpoint carries the head separately with the tie switched off.
    fn get_lm_head_mut(&mut self) -> &mut Linear;

    /// Pair the model with its tokenizer: the tokenizer pads with its EOS
    /// token and the config records the resulting pad id. Call once.
    fn post_init(&mut self, tokenizer: &mut dyn PadTokenizer) -> Result<()> {
        let eos = tokenizer.eos_token().ok_or_else(|| {
            SliceError::Tokenization("Tokenizer has no end-of-sequence token".to_string())
        })?;
        tokenizer.set_pad_token(Some(eos))?;
        let pad_token_id = tokenizer.pad_token_id();
        self.config_mut().set_pad_token_id(pad_token_id);

        tracing::info!("Pad token set to EOS (id {:?})", pad_token_id);
        Ok(())
    }
}

/// Check that `value` is of type `expected`
pub fn ensure_type(value: &dyn Any, expected: TypeId, what: &str) -> Result<()> {
    if value.type_id() != expected {
        return Err(SliceError::StructuralMismatch(format!(
            "{} does not have the expected type",
            what
        )));
    }
    Ok(())
}

/// Bounds check for layer indices
pub fn check_layer_index(index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(SliceError::LayerIndexOutOfRange { index, len });
    }
    Ok(())
}
