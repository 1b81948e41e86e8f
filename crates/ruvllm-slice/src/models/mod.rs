//! Native causal language models
//!
//! Candle implementations of the two decoder stacks the adapters wrap. Layer
//! slots hold either the native layer or its compressed counterpart, so a
//! model stays runnable at every step of a layer-by-layer conversion.

pub mod llama;
pub mod mixtral;

pub use llama::{LlamaBlock, LlamaDecoderLayer, LlamaForCausalLM, LlamaModel};
pub use mixtral::{MixtralBlock, MixtralDecoderLayer, MixtralForCausalLM, MixtralModel};

use crate::adapter::DecoderBlock;
use crate::config::PretrainedConfig;
use crate::error::Result;
use crate::hub::{CONFIG_FILE, SAFETENSORS_FILE};
use crate::nn::{KvEntry, LayerArgs};
use crate::state_dict::StateDict;
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::path::Path;

/// Output of a full forward pass
#[derive(Debug, Clone)]
pub struct CausalLmOutput {
    /// `[batch, seq, vocab]`, always f32
    pub logits: Tensor,
    /// One cache entry per layer when the config enables `use_cache`
    pub past_key_values: Option<Vec<KvEntry>>,
    /// One `[batch * seq, num_experts]` tensor per MoE layer, when enabled
    pub router_logits: Option<Vec<Tensor>>,
}

/// A decoder-only language model
pub trait CausalLm: Send + Sync + std::fmt::Debug {
    /// Run `input_ids` (`[batch, seq]`, u32) through the model.
    ///
    /// `attention_mask` is a `[batch, past + seq]` keep/pad mask (1 = keep).
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        past_key_values: Option<&[KvEntry]>,
    ) -> Result<CausalLmOutput>;

    /// Device the parameters live on
    fn device(&self) -> &Device;

    /// Dtype the parameters are held in
    fn dtype(&self) -> DType;

    /// Number of decoder layers
    fn num_layers(&self) -> usize;

    /// Every parameter under its full HF name
    fn state_dict(&self) -> StateDict;

    /// Write `config.json` and `model.safetensors` into `dir`
    fn save_pretrained(&self, dir: &Path) -> Result<()>;

    /// Upcast for downcasting to the concrete model
    fn as_any(&self) -> &dyn Any;
}

/// Results of running every decoder layer
pub(crate) struct StackOutput {
    pub hidden_states: Tensor,
    pub presents: Vec<KvEntry>,
    pub router_logits: Vec<Tensor>,
}

/// Run `hidden_states` through `layers` in order, threading the per-layer
/// cache entry into `base`
pub(crate) fn run_layers<'a, 'l>(
    layers: impl Iterator<Item = &'l dyn DecoderBlock>,
    mut hidden_states: Tensor,
    base: LayerArgs<'a>,
    past_key_values: Option<&'a [KvEntry]>,
) -> Result<StackOutput> {
    let mut presents = Vec::new();
    let mut router_logits = Vec::new();

    for (i, layer) in layers.enumerate() {
        let args = LayerArgs {
            past_key_value: past_key_values.and_then(|past| past.get(i)),
            ..base
        };
        let out = layer.forward(&hidden_states, &args)?;
        hidden_states = out.hidden_states;
        presents.extend(out.present_key_value);
        router_logits.extend(out.router_logits);
    }

    Ok(StackOutput {
        hidden_states,
        presents,
        router_logits,
    })
}

/// Cached length shared by every layer
pub(crate) fn past_length(past_key_values: Option<&[KvEntry]>) -> Result<usize> {
    match past_key_values.and_then(|past| past.first()) {
        Some(entry) => entry.seq_len(),
        None => Ok(0),
    }
}

/// Write `config` as JSON and `state_dict` as safetensors into `dir`.
///
/// The JSON carries `model_type` and `architectures` so HF tooling
/// recognises the checkpoint.
pub(crate) fn write_checkpoint<C: Serialize + PretrainedConfig>(
    config: &C,
    architecture: &str,
    state_dict: StateDict,
    dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&config_json(config, architecture)?)?)?;

    let tensors: HashMap<String, Tensor> = state_dict.into_iter().collect();
    candle_core::safetensors::save(&tensors, dir.join(SAFETENSORS_FILE))?;

    tracing::info!("Saved {} tensors to {}", tensors.len(), dir.display());
    Ok(())
}

/// `config` as a JSON object with its `model_type` and `architectures` keys
pub(crate) fn config_json<C: Serialize + PretrainedConfig>(config: &C, architecture: &str) -> Result<Value> {
    let mut value = serde_json::to_value(config)?;
    if let Value::Object(fields) = &mut value {
        fields.insert("model_type".to_string(), Value::from(config.model_type()));
        fields.insert("architectures".to_string(), Value::from(vec![architecture.to_string()]));
    }
    Ok(value)
}
