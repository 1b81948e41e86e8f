//! Tokenizer pairing
//!
//! [`crate::adapter::ModelAdapter::post_init`] only needs a tokenizer whose
//! pad token can be pointed at its EOS token; that capability is
//! [`PadTokenizer`]. [`CausalLmTokenizer`] provides it over a HuggingFace
//! `tokenizer.json`.

use crate::error::{Result, SliceError};
use crate::hub::{LoadOptions, ModelLocation, TOKENIZER_CONFIG_FILE, TOKENIZER_FILE};
use candle_core::{Device, Tensor};
use std::path::Path;
use tokenizers::{PaddingParams, Tokenizer as HfTokenizer};

/// EOS spellings tried when no `tokenizer_config.json` names one
const EOS_CANDIDATES: [&str; 5] = ["<|end_of_text|>", "<|eot_id|>", "</s>", "<|endoftext|>", "<eos>"];

/// A tokenizer with settable padding
pub trait PadTokenizer {
    /// End-of-sequence token
    fn eos_token(&self) -> Option<String>;

    /// Current pad token
    fn pad_token(&self) -> Option<String>;

    /// Set (or clear) the pad token
    fn set_pad_token(&mut self, token: Option<String>) -> Result<()>;

    /// Id of the pad token
    fn pad_token_id(&self) -> Option<u32>;
}

/// HF tokenizer for a causal LM
#[derive(Debug, Clone)]
pub struct CausalLmTokenizer {
    inner: HfTokenizer,
    eos_token: Option<String>,
    pad_token: Option<String>,
}

impl CausalLmTokenizer {
    /// Wrap a loaded tokenizer, detecting its EOS token
    pub fn new(inner: HfTokenizer) -> Self {
        let eos_token = EOS_CANDIDATES
            .iter()
            .find(|candidate| inner.token_to_id(candidate).is_some())
            .map(|token| token.to_string());
        let pad_token = inner.get_padding().map(|padding| padding.pad_token.clone());

        Self {
            inner,
            eos_token,
            pad_token,
        }
    }

    /// Load tokenizer from a local file
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| {
            SliceError::Tokenization(format!("Failed to load tokenizer: {}", e))
        })?;
        Ok(Self::new(inner))
    }

    /// Load `tokenizer.json` of a local directory or Hub repo.
    ///
    /// The EOS token declared in `tokenizer_config.json`, when the model ships
    /// one, takes precedence over the detected candidate.
    pub fn from_pretrained(model_path: &str, options: &LoadOptions) -> Result<Self> {
        let location = ModelLocation::resolve(model_path, options)?;
        let path = location.get(TOKENIZER_FILE)?;
        tracing::debug!("Loading tokenizer from {}", path.display());
        let mut tokenizer = Self::from_file(&path)?;

        if let Ok(config_path) = location.get(TOKENIZER_CONFIG_FILE) {
            tokenizer.load_special_tokens_from_config(&config_path)?;
        }
        Ok(tokenizer)
    }

    /// Take `eos_token` (plain string or `{"content": ...}`) from a
    /// `tokenizer_config.json`
    fn load_special_tokens_from_config(&mut self, path: &Path) -> Result<()> {
        let config_str = std::fs::read_to_string(path)?;
        let config: serde_json::Value = serde_json::from_str(&config_str)?;

        let eos = config.get("eos_token").and_then(|value| match value {
            serde_json::Value::String(token) => Some(token.clone()),
            serde_json::Value::Object(fields) => fields
                .get("content")
                .and_then(|content| content.as_str())
                .map(str::to_string),
            _ => None,
        });

        if let Some(eos) = eos {
            if self.inner.token_to_id(&eos).is_none() {
                tracing::warn!("EOS token '{}' from {} is not in the vocabulary", eos, path.display());
            }
            self.eos_token = Some(eos);
        }
        Ok(())
    }

    /// Override the detected EOS token
    pub fn with_eos_token(mut self, token: impl Into<String>) -> Self {
        self.eos_token = Some(token.into());
        self
    }

    /// Underlying tokenizer
    pub fn inner(&self) -> &HfTokenizer {
        &self.inner
    }

    /// Token ids of `text`
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| SliceError::Tokenization(format!("Encoding failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// `(input_ids, attention_mask)`, each `[batch, seq]` u32.
    ///
    /// Texts of different lengths need a pad token.
    pub fn encode_batch(&self, texts: &[&str], device: &Device) -> Result<(Tensor, Tensor)> {
        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| SliceError::Tokenization(format!("Batch encoding failed: {}", e)))?;

        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);
        if encodings.iter().any(|e| e.get_ids().len() != seq_len) {
            return Err(SliceError::InvalidOperation(
                "Texts differ in length and no pad token is set".to_string(),
            ));
        }

        let ids: Vec<u32> = encodings.iter().flat_map(|e| e.get_ids().to_vec()).collect();
        let mask: Vec<u32> = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().to_vec())
            .collect();
        let shape = (encodings.len(), seq_len);
        Ok((
            Tensor::from_vec(ids, shape, device)?,
            Tensor::from_vec(mask, shape, device)?,
        ))
    }

    /// Text of `ids`
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| SliceError::Tokenization(format!("Decoding failed: {}", e)))
    }
}

impl PadTokenizer for CausalLmTokenizer {
    fn eos_token(&self) -> Option<String> {
        self.eos_token.clone()
    }

    fn pad_token(&self) -> Option<String> {
        self.pad_token.clone()
    }

    fn set_pad_token(&mut self, token: Option<String>) -> Result<()> {
        match token {
            Some(token) => {
                let pad_id = self.inner.token_to_id(&token).ok_or_else(|| {
                    SliceError::Tokenization(format!("Pad token '{}' is not in the vocabulary", token))
                })?;
                self.inner.with_padding(Some(PaddingParams {
                    pad_id,
                    pad_token: token.clone(),
                    ..Default::default()
                }));
                self.pad_token = Some(token);
            }
            None => {
                self.inner.with_padding(None);
                self.pad_token = None;
            }
        }
        Ok(())
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token
            .as_deref()
            .and_then(|token| self.inner.token_to_id(token))
    }
}
