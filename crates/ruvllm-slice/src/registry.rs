//! Adapter dispatch by model name
//!
//! Each family's constructors answer `Ok(None)` for names outside the
//! family, so dispatch tries every family in order.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ruvllm_slice::{registry, LoadOptions};
//!
//! let mut adapter = registry::from_pretrained(
//!     "meta-llama/Llama-3-8B",
//!     "meta-llama/Meta-Llama-3-8B",
//!     &LoadOptions::default(),
//! )?;
//! for layer in adapter.get_layers() {
//!     println!("{:?}", layer.get_attention_inputs().len());
//! }
//! ```

use crate::adapter::ModelAdapter;
use crate::adapters::{llama3, tinymix, Llama3ModelAdapter, MixtralModelAdapter};
use crate::error::{Result, SliceError};
use crate::hub::LoadOptions;
use serde::{Deserialize, Serialize};

/// A registered adapter family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterFamily {
    /// Llama-3
    Llama3,
    /// TinyMix (Mixtral)
    TinyMix,
}

impl AdapterFamily {
    /// Every family, in dispatch order
    pub const ALL: [AdapterFamily; 2] = [AdapterFamily::Llama3, AdapterFamily::TinyMix];

    /// Model names this family accepts start with this
    pub fn model_prefix(self) -> &'static str {
        match self {
            Self::Llama3 => llama3::MODEL_PREFIX,
            Self::TinyMix => tinymix::MODEL_PREFIX,
        }
    }

    /// Family accepting `model_name`, if any
    pub fn detect(model_name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| model_name.starts_with(family.model_prefix()))
    }

    /// This family's `from_pretrained`
    pub fn from_pretrained(
        self,
        model_name: &str,
        model_path: &str,
        options: &LoadOptions,
    ) -> Result<Option<Box<dyn ModelAdapter>>> {
        Ok(match self {
            Self::Llama3 => Llama3ModelAdapter::from_pretrained(model_name, model_path, options)?
                .map(|adapter| Box::new(adapter) as Box<dyn ModelAdapter>),
            Self::TinyMix => MixtralModelAdapter::from_pretrained(model_name, model_path, options)?
                .map(|adapter| Box::new(adapter) as Box<dyn ModelAdapter>),
        })
    }

    /// This family's `from_uninitialized`
    pub fn from_uninitialized(
        self,
        model_name: &str,
        model_path: &str,
        options: &LoadOptions,
    ) -> Result<Option<Box<dyn ModelAdapter>>> {
        Ok(match self {
            Self::Llama3 => Llama3ModelAdapter::from_uninitialized(model_name, model_path, options)?
                .map(|adapter| Box::new(adapter) as Box<dyn ModelAdapter>),
            Self::TinyMix => MixtralModelAdapter::from_uninitialized(model_name, model_path, options)?
                .map(|adapter| Box::new(adapter) as Box<dyn ModelAdapter>),
        })
    }
}

impl std::fmt::Display for AdapterFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llama3 => write!(f, "llama3"),
            Self::TinyMix => write!(f, "tinymix"),
        }
    }
}

/// Load `model_name` with the first family that accepts it
pub fn from_pretrained(model_name: &str, model_path: &str, options: &LoadOptions) -> Result<Box<dyn ModelAdapter>> {
    for family in AdapterFamily::ALL {
        if let Some(adapter) = family.from_pretrained(model_name, model_path, options)? {
            tracing::info!("Dispatched {} to the {} adapter", model_name, family);
            return Ok(adapter);
        }
    }
    Err(SliceError::UnsupportedModel(model_name.to_string()))
}

/// Build an uninitialized shell of `model_name` with the first family that
/// accepts it
pub fn from_uninitialized(model_name: &str, model_path: &str, options: &LoadOptions) -> Result<Box<dyn ModelAdapter>> {
    for family in AdapterFamily::ALL {
        if let Some(adapter) = family.from_uninitialized(model_name, model_path, options)? {
            tracing::info!("Dispatched {} to the {} adapter (uninitialized)", model_name, family);
            return Ok(adapter);
        }
    }
    Err(SliceError::UnsupportedModel(model_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(AdapterFamily::detect("meta-llama/Llama-3.1-8B"), Some(AdapterFamily::Llama3));
        assert_eq!(
            AdapterFamily::detect("eastwind/tinymix-8x1b-chat"),
            Some(AdapterFamily::TinyMix)
        );
        assert_eq!(AdapterFamily::detect("meta-llama/Llama-2-7b-hf"), None);
    }

    #[test]
    fn test_unknown_family_is_unsupported() {
        let result = from_uninitialized("facebook/opt-125m", "/nonexistent", &LoadOptions::default());
        assert!(matches!(result, Err(SliceError::UnsupportedModel(_))));
    }
}
