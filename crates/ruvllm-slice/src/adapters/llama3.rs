//! Llama-3 adapter pair
//!
//! Accepts model names starting with `meta-llama/Llama-3`.

use crate::adapter::{
    check_layer_index, ensure_type, DecoderBlock, LayerAdapter, ModelAdapter, Shortcuts,
};
use crate::config::{LlamaConfig, PretrainedConfig};
use crate::error::{Result, SliceError};
use crate::hub::{LoadOptions, ModelLocation};
use crate::models::{CausalLm, LlamaBlock, LlamaDecoderLayer, LlamaForCausalLM};
use crate::nn::{LayerArgs, LayerOutput, RmsNorm, WeightInit};
use crate::state_dict::{load_state_dict_strict, Parameterized, StateDict};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};
use std::any::{Any, TypeId};

/// Model names this adapter pair accepts start with this
pub const MODEL_PREFIX: &str = "meta-llama/Llama-3";

// ============================================================================
// Compressed layer
// ============================================================================

/// Llama decoder layer with optional residual rotations.
///
/// Without shortcuts it computes exactly what [`LlamaDecoderLayer`] computes.
#[derive(Debug, Clone)]
pub struct CompressedLlama3DecoderLayer {
    inner: LlamaDecoderLayer,
    /// Residual rotations, absent until the compression engine attaches them
    pub shortcuts: Shortcuts,
}

impl CompressedLlama3DecoderLayer {
    /// Build a layer for `config`
    pub fn new(config: &LlamaConfig, layer_idx: usize, init: WeightInit, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self::from_layer(LlamaDecoderLayer::new(config, layer_idx, init, dtype, device)?))
    }

    /// Wrap an existing layer, keeping its weights
    pub fn from_layer(inner: LlamaDecoderLayer) -> Self {
        Self {
            inner,
            shortcuts: Shortcuts::default(),
        }
    }

    /// Attention and MLP structure
    pub fn decoder(&self) -> &LlamaDecoderLayer {
        &self.inner
    }

    /// Attention and MLP structure, mutably
    pub fn decoder_mut(&mut self) -> &mut LlamaDecoderLayer {
        &mut self.inner
    }
}

impl Parameterized for CompressedLlama3DecoderLayer {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.inner.named_parameters(prefix, out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.inner.assign_parameters(prefix, sd)
    }
}

impl DecoderBlock for CompressedLlama3DecoderLayer {
    fn layer_idx(&self) -> usize {
        self.inner.layer_idx()
    }

    fn forward(&self, hidden_states: &Tensor, args: &LayerArgs<'_>) -> Result<LayerOutput> {
        self.inner
            .forward_with_shortcuts(hidden_states, args, Some(&self.shortcuts))
    }

    fn state_dict(&self) -> StateDict {
        self.to_state_dict()
    }

    fn shortcuts(&self) -> Option<&Shortcuts> {
        Some(&self.shortcuts)
    }

    fn shortcuts_mut(&mut self) -> Option<&mut Shortcuts> {
        Some(&mut self.shortcuts)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// ============================================================================
// Layer adapter
// ============================================================================

/// View over one Llama layer slot
pub struct Llama3LayerAdapter<'a> {
    block: &'a mut LlamaBlock,
}

impl<'a> Llama3LayerAdapter<'a> {
    /// Wrap `block`
    pub fn new(block: &'a mut LlamaBlock) -> Self {
        Self { block }
    }
}

impl LayerAdapter for Llama3LayerAdapter<'_> {
    fn layer(&self) -> &dyn DecoderBlock {
        self.block.as_block()
    }

    fn get_first_layernorm(&self) -> &RmsNorm {
        &self.block.decoder().input_layernorm
    }

    fn get_first_layernorm_mut(&mut self) -> &mut RmsNorm {
        &mut self.block.decoder_mut().input_layernorm
    }

    fn get_second_layernorm(&self) -> &RmsNorm {
        &self.block.decoder().post_attention_layernorm
    }

    fn get_second_layernorm_mut(&mut self) -> &mut RmsNorm {
        &mut self.block.decoder_mut().post_attention_layernorm
    }

    fn get_attention_inputs(&self) -> Vec<&Linear> {
        let attn = &self.block.decoder().self_attn;
        vec![&attn.q_proj, &attn.k_proj, &attn.v_proj]
    }

    fn get_attention_inputs_mut(&mut self) -> Vec<&mut Linear> {
        let attn = &mut self.block.decoder_mut().self_attn;
        vec![&mut attn.q_proj, &mut attn.k_proj, &mut attn.v_proj]
    }

    fn get_attention_output(&self) -> &Linear {
        &self.block.decoder().self_attn.o_proj
    }

    fn get_attention_output_mut(&mut self) -> &mut Linear {
        &mut self.block.decoder_mut().self_attn.o_proj
    }

    fn get_mlp_inputs(&self) -> Vec<&Linear> {
        let mlp = &self.block.decoder().mlp;
        vec![&mlp.gate_proj, &mlp.up_proj]
    }

    fn get_mlp_inputs_mut(&mut self) -> Vec<&mut Linear> {
        let mlp = &mut self.block.decoder_mut().mlp;
        vec![&mut mlp.gate_proj, &mut mlp.up_proj]
    }

    fn get_mlp_output(&self) -> &Linear {
        &self.block.decoder().mlp.down_proj
    }

    fn get_mlp_output_mut(&mut self) -> &mut Linear {
        &mut self.block.decoder_mut().mlp.down_proj
    }
}

// ============================================================================
// Model adapter
// ============================================================================

/// Adapter over a [`LlamaForCausalLM`]
#[derive(Debug)]
pub struct Llama3ModelAdapter {
    model: LlamaForCausalLM,
}

impl Llama3ModelAdapter {
    /// Take ownership of `model`
    pub fn new(model: LlamaForCausalLM) -> Self {
        Self { model }
    }

    /// The concrete model
    pub fn inner(&self) -> &LlamaForCausalLM {
        &self.model
    }

    /// Give the model back
    pub fn into_inner(self) -> LlamaForCausalLM {
        self.model
    }

    /// Load a checkpoint, or `Ok(None)` when `model_name` is not a Llama-3
    /// model.
    ///
    /// The requested dtype is recorded in the config so compressed layers are
    /// built in the same dtype.
    pub fn from_pretrained(model_name: &str, model_path: &str, options: &LoadOptions) -> Result<Option<Self>> {
        if !model_name.starts_with(MODEL_PREFIX) {
            return Ok(None);
        }

        let location = ModelLocation::resolve(model_path, options)?;
        let mut config = LlamaConfig::from_file(location.config_file()?)?;
        let files = location.weight_files()?;
        let device = options.device.select()?;

        tracing::info!(
            "Loading {} from {} ({} weight files, {:?})",
            model_name,
            location,
            files.len(),
            options.dtype
        );

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, options.dtype, &device)? };
        config.set_torch_dtype(options.dtype);
        let model = LlamaForCausalLM::load(config, vb)?;

        Ok(Some(Self::new(model)))
    }

    /// Build a shell from the config alone, or `Ok(None)` when `model_name`
    /// is not a Llama-3 model.
    ///
    /// No initialisation pass runs; every parameter is zero until weights are
    /// copied in.
    pub fn from_uninitialized(model_name: &str, model_path: &str, options: &LoadOptions) -> Result<Option<Self>> {
        if !model_name.starts_with(MODEL_PREFIX) {
            return Ok(None);
        }

        let location = ModelLocation::resolve(model_path, options)?;
        let mut config = LlamaConfig::from_file(location.config_file()?)?;
        let device = options.device.select()?;

        tracing::info!("Building uninitialized {} ({:?})", model_name, options.dtype);

        config.set_torch_dtype(options.dtype);
        let model = LlamaForCausalLM::new(config, WeightInit::Skip, options.dtype, &device)?;

        Ok(Some(Self::new(model)))
    }
}

impl ModelAdapter for Llama3ModelAdapter {
    fn model(&self) -> &dyn CausalLm {
        &self.model
    }

    fn config(&self) -> &dyn PretrainedConfig {
        self.model.config()
    }

    fn config_mut(&mut self) -> &mut dyn PretrainedConfig {
        self.model.config_mut()
    }

    fn config_type(&self) -> TypeId {
        TypeId::of::<LlamaConfig>()
    }

    fn original_layer_type(&self) -> TypeId {
        TypeId::of::<LlamaDecoderLayer>()
    }

    fn original_layer_norm_type(&self) -> TypeId {
        TypeId::of::<RmsNorm>()
    }

    fn layer_adapter_type(&self) -> TypeId {
        TypeId::of::<Llama3LayerAdapter<'static>>()
    }

    fn compressed_layer_type(&self) -> TypeId {
        TypeId::of::<CompressedLlama3DecoderLayer>()
    }

    fn compute_output_logits(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.model.forward(input_ids, None, None)?.logits)
    }

    fn num_layers(&self) -> usize {
        self.model.model.layers.len()
    }

    fn get_layers(&mut self) -> Vec<Box<dyn LayerAdapter + '_>> {
        self.model
            .model
            .layers
            .iter_mut()
            .map(|block| Box::new(Llama3LayerAdapter::new(block)) as Box<dyn LayerAdapter + '_>)
            .collect()
    }

    fn get_raw_layer_at(&self, index: usize) -> Result<&dyn DecoderBlock> {
        let layers = &self.model.model.layers;
        check_layer_index(index, layers.len())?;
        Ok(layers[index].as_block())
    }

    fn get_raw_layer_at_mut(&mut self, index: usize) -> Result<&mut dyn DecoderBlock> {
        let layers = &mut self.model.model.layers;
        check_layer_index(index, layers.len())?;
        Ok(layers[index].as_block_mut())
    }

    fn set_raw_layer_at(&mut self, index: usize, layer: Box<dyn DecoderBlock>) -> Result<()> {
        let layers = &mut self.model.model.layers;
        check_layer_index(index, layers.len())?;

        let block = match layer.into_any().downcast::<LlamaDecoderLayer>() {
            Ok(native) => LlamaBlock::Original(*native),
            Err(other) => match other.downcast::<CompressedLlama3DecoderLayer>() {
                Ok(compressed) => LlamaBlock::Compressed(*compressed),
                Err(_) => {
                    return Err(SliceError::StructuralMismatch(format!(
                        "Layer {} replacement is not a Llama decoder layer",
                        index
                    )))
                }
            },
        };
        layers[index] = block;
        Ok(())
    }

    fn convert_layer_to_compressed(
        &self,
        layer: &dyn DecoderBlock,
        layer_idx: Option<usize>,
    ) -> Result<Box<dyn DecoderBlock>> {
        let config = self.model.config();
        let dtype = config.torch_dtype()?.unwrap_or_else(|| self.model.dtype());
        let layer_idx = layer_idx.unwrap_or_else(|| layer.layer_idx());

        let mut compressed =
            CompressedLlama3DecoderLayer::new(config, layer_idx, WeightInit::Skip, dtype, self.model.device())?;
        load_state_dict_strict(&mut compressed, &layer.state_dict())?;

        tracing::debug!("Converted layer {} to compressed ({:?})", layer_idx, dtype);
        Ok(Box::new(compressed))
    }

    fn get_embeddings(&self) -> Vec<&Embedding> {
        vec![&self.model.model.embed_tokens]
    }

    fn get_embeddings_mut(&mut self) -> Vec<&mut Embedding> {
        vec![&mut self.model.model.embed_tokens]
    }

    fn get_pre_head_layernorm(&self) -> Result<&RmsNorm> {
        let norm = &self.model.model.norm;
        ensure_type(norm, self.original_layer_norm_type(), "Pre-head norm")?;
        Ok(norm)
    }

    fn get_pre_head_layernorm_mut(&mut self) -> Result<&mut RmsNorm> {
        let expected = self.original_layer_norm_type();
        let norm = &mut self.model.model.norm;
        ensure_type(norm, expected, "Pre-head norm")?;
        Ok(norm)
    }

    fn get_lm_head(&self) -> &Linear {
        &self.model.lm_head
    }

    fn get_lm_head_mut(&mut self) -> &mut Linear {
        &mut self.model.lm_head
    }
}
