//! # RuvLLM-Slice - Structured Pruning Adapters for Candle Decoder Stacks
//!
//! RuvLLM-Slice lets a SliceGPT-style compression engine treat Llama-3 and
//! Mixtral (TinyMix) models uniformly. The engine reads and rewrites the
//! projections on each layer's attention and MLP boundaries, then swaps
//! every layer for a compressed twin that rotates the residual stream with
//! learned shortcut matrices.
//!
//! ## Architecture
//!
//! - **Layer adapters** expose one decoder block's norms and boundary
//!   projections in a fixed order
//! - **Model adapters** expose metadata, layer enumeration and replacement,
//!   embeddings, head, and two construction paths (checkpoint or
//!   uninitialized shell)
//! - **Compressed layers** run the native forward pass and apply
//!   `residual @ Q` at each residual add whose shortcut is attached
//!
//! ## Key Components
//!
//! - [`ModelAdapter`] / [`LayerAdapter`]: the compression contract
//! - [`Llama3ModelAdapter`], [`MixtralModelAdapter`]: the two adapter pairs
//! - [`CompressedLlama3DecoderLayer`], [`CompressedMixtralDecoderLayer`]
//! - [`registry`]: dispatch by model-name prefix
//! - [`state_dict`]: strict, all-or-nothing parameter transfer
//!
//! ## Example
//!
//! ```rust,ignore
//! use candle_core::DType;
//! use ruvllm_slice::{registry, LoadOptions};
//!
//! let options = LoadOptions::default().with_dtype(DType::F16);
//! let mut adapter = registry::from_pretrained("meta-llama/Llama-3-8B", "./Meta-Llama-3-8B", &options)?;
//!
//! for i in 0..adapter.num_layers() {
//!     let compressed = adapter.convert_layer_to_compressed(adapter.get_raw_layer_at(i)?, Some(i))?;
//!     adapter.set_raw_layer_at(i, compressed)?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod adapters;
pub mod config;
pub mod error;
pub mod hub;
pub mod models;
pub mod nn;
pub mod registry;
pub mod state_dict;
pub mod tokenizer;

pub use adapter::{add_residual, DecoderBlock, LayerAdapter, ModelAdapter, Shortcuts};
pub use adapters::{
    CompressedLlama3DecoderLayer, CompressedMixtralDecoderLayer, Llama3LayerAdapter, Llama3ModelAdapter,
    MixtralLayerAdapter, MixtralModelAdapter,
};
pub use config::{LlamaConfig, MixtralConfig, PretrainedConfig, TransformerConfig};
pub use error::{Result, SliceError};
pub use hub::{DeviceType, HubToken, LoadOptions, ModelLocation};
pub use models::{CausalLm, CausalLmOutput, LlamaForCausalLM, MixtralForCausalLM};
pub use nn::{KvEntry, LayerArgs, LayerOutput, RmsNorm, WeightInit};
pub use registry::AdapterFamily;
pub use state_dict::{load_state_dict_strict, Parameterized, StateDict};
pub use tokenizer::{CausalLmTokenizer, PadTokenizer};
