//! TinyMix (Mixtral) adapter pair
//!
//! Accepts model names starting with `eastwind/tinymix-8x1b-chat`. The MLP
//! boundary of a Mixtral layer is its expert block: the router `gate` and
//! the fused expert up-projection feed it, the fused expert down-projection
//! leaves it. Individual experts are not exposed.

use crate::adapter::{
    check_layer_index, ensure_type, DecoderBlock, LayerAdapter, ModelAdapter, Shortcuts,
};
use crate::config::{MixtralConfig, PretrainedConfig};
use crate::error::{Result, SliceError};
use crate::hub::{LoadOptions, ModelLocation};
use crate::models::{CausalLm, MixtralBlock, MixtralDecoderLayer, MixtralForCausalLM};
use crate::nn::{LayerArgs, LayerOutput, RmsNorm, WeightInit};
use crate::state_dict::{load_state_dict_strict, Parameterized, StateDict};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};
use std::any::{Any, TypeId};

/// Model names this adapter pair accepts start with this
pub const MODEL_PREFIX: &str = "eastwind/tinymix-8x1b-chat";

// ============================================================================
// Compressed layer
// ============================================================================

/// Mixtral decoder layer with optional residual rotations.
///
/// Without shortcuts it computes exactly what [`MixtralDecoderLayer`] computes,
/// router logits included. The MLP shortcut rotates the residual around the
/// whole expert block, not per expert.
#[derive(Debug, Clone)]
pub struct CompressedMixtralDecoderLayer {
    inner: MixtralDecoderLayer,
    /// Residual rotations, absent until the compression engine attaches them
    pub shortcuts: Shortcuts,
}

impl CompressedMixtralDecoderLayer {
    /// Build a layer for `config`
    pub fn new(config: &MixtralConfig, layer_idx: usize, init: WeightInit, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self::from_layer(MixtralDecoderLayer::new(config, layer_idx, init, dtype, device)?))
    }

    /// Wrap an existing layer, keeping its weights
    pub fn from_layer(inner: MixtralDecoderLayer) -> Self {
        Self {
            inner,
            shortcuts: Shortcuts::default(),
        }
    }

    /// Attention and expert structure
    pub fn decoder(&self) -> &MixtralDecoderLayer {
        &self.inner
    }

    /// Attention and expert structure, mutably
    pub fn decoder_mut(&mut self) -> &mut MixtralDecoderLayer {
        &mut self.inner
    }
}

impl Parameterized for CompressedMixtralDecoderLayer {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.inner.named_parameters(prefix, out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.inner.assign_parameters(prefix, sd)
    }
}

impl DecoderBlock for CompressedMixtralDecoderLayer {
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

/// View over one Mixtral layer slot
pub struct MixtralLayerAdapter<'a> {
    block: &'a mut MixtralBlock,
}

impl<'a> MixtralLayerAdapter<'a> {
    /// Wrap `block`
    pub fn new(block: &'a mut MixtralBlock) -> Self {
        Self { block }
    }
}

impl LayerAdapter for MixtralLayerAdapter<'_> {
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
        let moe = &self.block.decoder().block_sparse_moe;
        vec![&moe.gate, &moe.experts.gate_up_proj]
    }

    fn get_mlp_inputs_mut(&mut self) -> Vec<&mut Linear> {
        let moe = &mut self.block.decoder_mut().block_sparse_moe;
        vec![&mut moe.gate, &mut moe.experts.gate_up_proj]
    }

    fn get_mlp_output(&self) -> &Linear {
        &self.block.decoder().block_sparse_moe.experts.down_proj
    }

    fn get_mlp_output_mut(&mut self) -> &mut Linear {
        &mut self.block.decoder_mut().block_sparse_moe.experts.down_proj
    }
}

// ============================================================================
// Model adapter
// ============================================================================

/// Adapter over a [`MixtralForCausalLM`]
#[derive(Debug)]
pub struct MixtralModelAdapter {
    model: MixtralForCausalLM,
}

impl MixtralModelAdapter {
    /// Take ownership of `model`
    pub fn new(model: MixtralForCausalLM) -> Self {
        Self { model }
    }

    /// The concrete model
    pub fn inner(&self) -> &MixtralForCausalLM {
        &self.model
    }

    /// Give the model back
    pub fn into_inner(self) -> MixtralForCausalLM {
        self.model
    }

    /// Load a checkpoint, or `Ok(None)` when `model_name` is not a TinyMix
    /// model.
    ///
    /// The requested dtype is recorded in the config so compressed layers are
    /// built in the same dtype.
    pub fn from_pretrained(model_name: &str, model_path: &str, options: &LoadOptions) -> Result<Option<Self>> {
        if !model_name.starts_with(MODEL_PREFIX) {
            return Ok(None);
        }

        let location = ModelLocation::resolve(model_path, options)?;
        let mut config = MixtralConfig::from_file(location.config_file()?)?;
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
        let model = MixtralForCausalLM::load(config, vb)?;

        Ok(Some(Self::new(model)))
    }

    /// Build a shell from the config alone, or `Ok(None)` when `model_name`
    /// is not a TinyMix model.
    ///
    /// No initialisation pass runs; every parameter is zero until weights are
    /// copied in.
    pub fn from_uninitialized(model_name: &str, model_path: &str, options: &LoadOptions) -> Result<Option<Self>> {
        if !model_name.starts_with(MODEL_PREFIX) {
            return Ok(None);
        }

        let location = ModelLocation::resolve(model_path, options)?;
        let mut config = MixtralConfig::from_file(location.config_file()?)?;
        let device = options.device.select()?;

        tracing::info!("Building uninitialized {} ({:?})", model_name, options.dtype);

        config.set_torch_dtype(options.dtype);
        let model = MixtralForCausalLM::new(config, WeightInit::Skip, options.dtype, &device)?;

        Ok(Some(Self::new(model)))
    }
}

impl ModelAdapter for MixtralModelAdapter {
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
        TypeId::of::<MixtralConfig>()
    }

    fn original_layer_type(&self) -> TypeId {
        TypeId::of::<MixtralDecoderLayer>()
    }

    fn original_layer_norm_type(&self) -> TypeId {
        TypeId::of::<RmsNorm>()
    }

    fn layer_adapter_type(&self) -> TypeId {
        TypeId::of::<MixtralLayerAdapter<'static>>()
    }

    fn compressed_layer_type(&self) -> TypeId {
        TypeId::of::<CompressedMixtralDecoderLayer>()
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
            .map(|block| Box::new(MixtralLayerAdapter::new(block)) as Box<dyn LayerAdapter + '_>)
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

        let block = match layer.into_any().downcast::<MixtralDecoderLayer>() {
            Ok(native) => MixtralBlock::Original(*native),
            Err(other) => match other.downcast::<CompressedMixtralDecoderLayer>() {
                Ok(compressed) => MixtralBlock::Compressed(*compressed),
                Err(_) => {
                    return Err(SliceError::StructuralMismatch(format!(
                        "Layer {} replacement is not a Mixtral decoder layer",
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
            CompressedMixtralDecoderLayer::new(config, layer_idx, WeightInit::Skip, dtype, self.model.device())?;
        load_state_dict_strict(&mut compressed, &layer.state_dict())?;

        tracing::debug!(
            "Converted layer {} to compressed ({} experts, {:?})",
            layer_idx,
            config.num_local_experts,
            dtype
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiny_config() -> MixtralConfig {
        serde_json::from_value(json!({
            "vocab_size": 20,
            "hidden_size": 8,
            "intermediate_size": 6,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "num_key_value_heads": 1,
            "max_position_embeddings": 32,
            "num_local_experts": 3,
            "num_experts_per_tok": 2
        }))
        .unwrap()
    }

    fn adapter() -> MixtralModelAdapter {
        let model = MixtralForCausalLM::new(tiny_config(), WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
        MixtralModelAdapter::new(model)
    }

    #[test]
    fn test_prefix_mismatch_is_none() {
        let options = LoadOptions::default();
        assert!(MixtralModelAdapter::from_pretrained("meta-llama/Llama-3-8B", "/nonexistent", &options)
            .unwrap()
            .is_none());
        assert!(MixtralModelAdapter::from_uninitialized("mistralai/Mixtral-8x7B-v0.1", "/nonexistent", &options)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mlp_boundary_is_expert_block() {
        let mut adapter = adapter();
        let layers = adapter.get_layers();
        let inputs = layers[0].get_mlp_inputs();

        assert_eq!(inputs.len(), 2);
        // router
        assert_eq!(inputs[0].weight().dims(), &[3, 8]);
        // every expert's w1 and w3
        assert_eq!(inputs[1].weight().dims(), &[3 * 2 * 6, 8]);
        assert_eq!(layers[0].get_mlp_output().weight().dims(), &[8, 3 * 6]);
    }

    #[test]
    fn test_compressed_layer_keeps_router_logits() {
        let adapter = adapter();
        let layer = adapter.get_raw_layer_at(0).unwrap();
        let compressed = adapter.convert_layer_to_compressed(layer, Some(0)).unwrap();

        let xs = Tensor::randn(0f32, 1., (1, 4, 8), &Device::Cpu).unwrap();
        let args = LayerArgs {
            output_router_logits: true,
            use_cache: true,
            ..Default::default()
        };
        let out = compressed.forward(&xs, &args).unwrap();
        assert_eq!(out.router_logits.unwrap().dims(), &[4, 3]);
        assert!(out.present_key_value.is_some());
        assert!(out.attn_weights.is_none());
    }

    #[test]
    fn test_foreign_layer_rejected() {
        let mut adapter = adapter();
        let llama_config: crate::config::LlamaConfig = serde_json::from_value(json!({
            "vocab_size": 20,
            "hidden_size": 8,
            "intermediate_size": 6,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "max_position_embeddings": 32
        }))
        .unwrap();
        let foreign =
            crate::models::LlamaDecoderLayer::new(&llama_config, 0, WeightInit::Skip, DType::F32, &Device::Cpu)
                .unwrap();

        assert!(matches!(
            adapter.set_raw_layer_at(0, Box::new(foreign)),
            Err(SliceError::StructuralMismatch(_))
        ));
    }

    #[test]
    fn test_foreign_layer_fails_strict_conversion() {
        let adapter = adapter();
        let llama_config: crate::config::LlamaConfig = serde_json::from_value(json!({
            "vocab_size": 20,
            "hidden_size": 8,
            "intermediate_size": 6,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "num_key_value_heads": 1,
            "max_position_embeddings": 32
        }))
        .unwrap();
        let foreign =
            crate::models::LlamaDecoderLayer::new(&llama_config, 0, WeightInit::Skip, DType::F32, &Device::Cpu)
                .unwrap();

        assert!(matches!(
            adapter.convert_layer_to_compressed(&foreign, None),
            Err(SliceError::StateDict { .. })
        ));
    }
}
