//! Model configuration
//!
//! Typed views over HuggingFace `config.json` files. The fields every decoder
//! stack shares live in [`TransformerConfig`], which is flattened into the
//! per-architecture configs so one JSON object deserializes into either.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ruvllm_slice::config::{LlamaConfig, PretrainedConfig};
//!
//! let config = LlamaConfig::from_file("Meta-Llama-3-8B/config.json")?;
//! assert_eq!(config.hidden_size(), 4096);
//! ```

use crate::error::{Result, SliceError};
use candle_core::DType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::Path;

/// Convert a torch dtype name (as written in `config.json`) to a Candle dtype.
pub fn dtype_from_torch_name(name: &str) -> Result<DType> {
    match name.trim_start_matches("torch.") {
        "float16" | "half" | "fp16" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float32" | "float" | "fp32" => Ok(DType::F32),
        "float64" | "double" => Ok(DType::F64),
        other => Err(SliceError::Config(format!("Unsupported torch_dtype '{}'", other))),
    }
}

/// Torch dtype name for a Candle dtype, as written back into `config.json`.
pub fn torch_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F32 => "float32",
        DType::F64 => "float64",
        other => other.as_str(),
    }
}

/// A token id field that may hold one id or a list (Llama-3 instruct models
/// list several EOS ids).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    /// Single id
    Single(u32),
    /// Several ids
    Multiple(Vec<u32>),
}

impl TokenIds {
    /// First id of the field
    pub fn first(&self) -> Option<u32> {
        match self {
            Self::Single(id) => Some(*id),
            Self::Multiple(ids) => ids.first().copied(),
        }
    }
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_true() -> bool {
    true
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

/// Hyperparameters shared by every decoder-only architecture in this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Residual stream width
    pub hidden_size: usize,
    /// MLP (or per-expert) intermediate width
    pub intermediate_size: usize,
    /// Number of decoder layers
    pub num_hidden_layers: usize,
    /// Number of query heads
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA); defaults to `num_attention_heads`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_key_value_heads: Option<usize>,
    /// Explicit head dimension; defaults to `hidden_size / num_attention_heads`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_dim: Option<usize>,
    /// Maximum sequence length
    pub max_position_embeddings: usize,
    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE base frequency; the architecture supplies the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_theta: Option<f64>,
    /// MLP activation
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    /// Share the embedding table with the output head
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Return KV cache entries from the forward pass
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Beginning-of-sequence id(s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token_id: Option<TokenIds>,
    /// End-of-sequence id(s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<TokenIds>,
    /// Padding id, set by `post_init`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_token_id: Option<u32>,
    /// Torch dtype name the weights are held in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torch_dtype: Option<String>,
}

impl TransformerConfig {
    /// Number of key/value heads
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Check the head layout is consistent
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_kv_heads() == 0 {
            return Err(SliceError::Config("Head counts must be non-zero".to_string()));
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(SliceError::Config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(SliceError::Config(format!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                self.num_kv_heads()
            )));
        }
        if self.hidden_act != "silu" {
            return Err(SliceError::Config(format!(
                "Unsupported hidden_act '{}'",
                self.hidden_act
            )));
        }
        Ok(())
    }
}

/// Behaviour every architecture config exposes to adapters.
///
/// The trait is object safe so a [`crate::adapter::ModelAdapter`] can hand out
/// `&dyn PretrainedConfig` regardless of the concrete config type.
pub trait PretrainedConfig: Any + Send + Sync + std::fmt::Debug {
    /// HF `model_type`
    fn model_type(&self) -> &'static str;

    /// Shared hyperparameters
    fn base(&self) -> &TransformerConfig;

    /// Shared hyperparameters, mutably
    fn base_mut(&mut self) -> &mut TransformerConfig;

    /// Upcast for type checks
    fn as_any(&self) -> &dyn Any;

    /// Residual stream width
    fn hidden_size(&self) -> usize {
        self.base().hidden_size
    }

    /// Maximum sequence length
    fn max_position_embeddings(&self) -> usize {
        self.base().max_position_embeddings
    }

    /// Vocabulary size
    fn vocab_size(&self) -> usize {
        self.base().vocab_size
    }

    /// Number of decoder layers
    fn num_hidden_layers(&self) -> usize {
        self.base().num_hidden_layers
    }

    /// Cache flag
    fn use_cache(&self) -> bool {
        self.base().use_cache
    }

    /// Set the cache flag
    fn set_use_cache(&mut self, value: bool) {
        self.base_mut().use_cache = value;
    }

    /// Padding id
    fn pad_token_id(&self) -> Option<u32> {
        self.base().pad_token_id
    }

    /// Set the padding id
    fn set_pad_token_id(&mut self, id: Option<u32>) {
        self.base_mut().pad_token_id = id;
    }

    /// Configured dtype, if `torch_dtype` is present
    fn torch_dtype(&self) -> Result<Option<DType>> {
        self.base()
            .torch_dtype
            .as_deref()
            .map(dtype_from_torch_name)
            .transpose()
    }

    /// Record the realized dtype
    fn set_torch_dtype(&mut self, dtype: DType) {
        self.base_mut().torch_dtype = Some(torch_name(dtype).to_string());
    }
}

/// Read and deserialize a `config.json`.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        SliceError::Config(format!("Failed to read config {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

// ============================================================================
// Llama
// ============================================================================

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

/// Llama-3.1 style RoPE frequency scaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RopeScaling {
    /// Scaling scheme; only `llama3` and `default` are understood
    #[serde(alias = "type")]
    pub rope_type: String,
    /// Wavelength stretch factor
    pub factor: f64,
    /// Low frequency boundary factor
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    /// High frequency boundary factor
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    /// Context length the base model was trained on
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
}

/// Configuration of a `LlamaForCausalLM` checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaConfig {
    /// Shared hyperparameters
    #[serde(flatten)]
    pub base: TransformerConfig,
    /// Optional RoPE scaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_scaling: Option<RopeScaling>,
    /// Bias on q/k/v/o projections
    #[serde(default)]
    pub attention_bias: bool,
}

impl LlamaConfig {
    /// Read a `config.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_config(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// RoPE base frequency
    pub fn rope_theta(&self) -> f64 {
        self.base.rope_theta.unwrap_or(10_000.0)
    }

    /// Check the config describes a model this crate can build
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if let Some(scaling) = &self.rope_scaling {
            if scaling.rope_type != "llama3" && scaling.rope_type != "default" {
                return Err(SliceError::Config(format!(
                    "Unsupported rope_scaling type '{}'",
                    scaling.rope_type
                )));
            }
        }
        Ok(())
    }
}

impl PretrainedConfig for LlamaConfig {
    fn model_type(&self) -> &'static str {
        "llama"
    }

    fn base(&self) -> &TransformerConfig {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransformerConfig {
        &mut self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mixtral
// ============================================================================

fn default_num_local_experts() -> usize {
    8
}

fn default_num_experts_per_tok() -> usize {
    2
}

/// Configuration of a `MixtralForCausalLM` checkpoint (TinyMix included)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixtralConfig {
    /// Shared hyperparameters
    #[serde(flatten)]
    pub base: TransformerConfig,
    /// Experts per layer
    #[serde(default = "default_num_local_experts")]
    pub num_local_experts: usize,
    /// Experts each token is routed to
    #[serde(default = "default_num_experts_per_tok")]
    pub num_experts_per_tok: usize,
    /// Sliding attention window, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliding_window: Option<usize>,
    /// Return router logits from every layer
    #[serde(default)]
    pub output_router_logits: bool,
}

impl MixtralConfig {
    /// Read a `config.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_config(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// RoPE base frequency
    pub fn rope_theta(&self) -> f64 {
        self.base.rope_theta.unwrap_or(1_000_000.0)
    }

    /// Check the config describes a model this crate can build
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if self.num_local_experts == 0 {
            return Err(SliceError::Config("num_local_experts must be non-zero".to_string()));
        }
        if self.num_experts_per_tok == 0 || self.num_experts_per_tok > self.num_local_experts {
            return Err(SliceError::Config(format!(
                "num_experts_per_tok {} must be in 1..={}",
                self.num_experts_per_tok, self.num_local_experts
            )));
        }
        Ok(())
    }
}

impl PretrainedConfig for MixtralConfig {
    fn model_type(&self) -> &'static str {
        "mixtral"
    }

    fn base(&self) -> &TransformerConfig {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransformerConfig {
        &mut self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn llama3_8b_json() -> serde_json::Value {
        json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "vocab_size": 128256,
            "hidden_size": 4096,
            "intermediate_size": 14336,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "max_position_embeddings": 8192,
            "rms_norm_eps": 1e-5,
            "rope_theta": 500000.0,
            "bos_token_id": 128000,
            "eos_token_id": [128001, 128009],
            "torch_dtype": "bfloat16"
        })
    }

    #[test]
    fn test_llama_config_parsing() {
        let config: LlamaConfig = serde_json::from_value(llama3_8b_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.hidden_size(), 4096);
        assert_eq!(config.base.num_kv_heads(), 8);
        assert_eq!(config.base.head_dim(), 128);
        assert_eq!(config.rope_theta(), 500000.0);
        assert!(config.use_cache());
        assert_eq!(config.base.eos_token_id.as_ref().and_then(TokenIds::first), Some(128001));
        assert_eq!(config.torch_dtype().unwrap(), Some(DType::BF16));
    }

    #[test]
    fn test_mixtral_defaults() {
        let config: MixtralConfig = serde_json::from_value(json!({
            "vocab_size": 32000,
            "hidden_size": 2048,
            "intermediate_size": 5632,
            "num_hidden_layers": 22,
            "num_attention_heads": 32,
            "num_key_value_heads": 4,
            "max_position_embeddings": 4096
        }))
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.num_local_experts, 8);
        assert_eq!(config.num_experts_per_tok, 2);
        assert_eq!(config.rope_theta(), 1_000_000.0);
        assert_eq!(config.torch_dtype().unwrap(), None);
    }

    #[test]
    fn test_dtype_write_back() {
        let mut config: LlamaConfig = serde_json::from_value(llama3_8b_json()).unwrap();
        config.set_torch_dtype(DType::F16);
        assert_eq!(config.base.torch_dtype.as_deref(), Some("float16"));
        assert_eq!(config.torch_dtype().unwrap(), Some(DType::F16));
    }

    #[test]
    fn test_invalid_head_layout_rejected() {
        let mut value = llama3_8b_json();
        value["num_key_value_heads"] = json!(5);
        let config: LlamaConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(config.validate(), Err(SliceError::Config(_))));
    }

    #[test]
    fn test_unknown_dtype_name() {
        assert!(dtype_from_torch_name("torch.float16").is_ok());
        assert!(dtype_from_torch_name("int4").is_err());
    }
}
