//! Concrete adapter pairs
//!
//! | Family | Model name prefix | Model |
//! |--------|-------------------|-------|
//! | Llama-3 | `meta-llama/Llama-3` | [`crate::models::LlamaForCausalLM`] |
//! | TinyMix | `eastwind/tinymix-8x1b-chat` | [`crate::models::MixtralForCausalLM`] |

pub mod llama3;
pub mod tinymix;

pub use llama3::{CompressedLlama3DecoderLayer, Llama3LayerAdapter, Llama3ModelAdapter};
pub use tinymix::{CompressedMixtralDecoderLayer, MixtralLayerAdapter, MixtralModelAdapter};
