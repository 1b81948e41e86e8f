//! Model location resolution
//!
//! Turns the `(model_path, dtype, local_files_only, token)` arguments of the
//! adapter constructors into concrete files on disk:
//!
//! - **Local directories** are used as-is
//! - **Hub repo ids** are looked up in the HuggingFace cache, and downloaded
//!   through the sync `hf-hub` API unless `local_files_only` is set
//! - **Sharded checkpoints** are discovered from `model.safetensors.index.json`

use crate::error::{Result, SliceError};
use candle_core::{DType, Device};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Cache, Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Single-file checkpoint name
pub const SAFETENSORS_FILE: &str = "model.safetensors";
/// Sharded checkpoint index name
pub const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";
/// Model configuration name
pub const CONFIG_FILE: &str = "config.json";
/// Tokenizer definition name
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Tokenizer settings (special tokens, chat template)
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Get HuggingFace token from environment
pub fn get_hf_token() -> Option<String> {
    std::env::var("HF_TOKEN")
        .or_else(|_| std::env::var("HUGGING_FACE_HUB_TOKEN"))
        .or_else(|_| std::env::var("HUGGINGFACE_API_KEY"))
        .ok()
}

/// Which credential to present to the Hub.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HubToken {
    /// Environment token if set, otherwise the token stored by `huggingface-cli login`
    #[default]
    Default,
    /// Never send a token
    Anonymous,
    /// Use this token
    Explicit(String),
}

/// Device type for model placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceType {
    /// CPU
    #[default]
    Cpu,
    /// Metal (Apple Silicon)
    Metal,
    /// CUDA (NVIDIA GPUs)
    Cuda(usize),
}

impl DeviceType {
    /// Select the Candle device, falling back to CPU when the backend is not compiled in
    pub fn select(self) -> Result<Device> {
        match self {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Metal => {
                #[cfg(feature = "metal")]
                {
                    Device::new_metal(0).map_err(|e| {
                        SliceError::Config(format!("Failed to initialize Metal device: {}", e))
                    })
                }
                #[cfg(not(feature = "metal"))]
                {
                    tracing::warn!("Metal requested but not available, falling back to CPU");
                    Ok(Device::Cpu)
                }
            }
            DeviceType::Cuda(device_id) => {
                #[cfg(feature = "cuda")]
                {
                    Device::new_cuda(device_id).map_err(|e| {
                        SliceError::Config(format!("Failed to initialize CUDA device: {}", e))
                    })
                }
                #[cfg(not(feature = "cuda"))]
                {
                    let _ = device_id;
                    tracing::warn!("CUDA requested but not available, falling back to CPU");
                    Ok(Device::Cpu)
                }
            }
        }
    }
}

/// Options shared by `from_pretrained` and `from_uninitialized`
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Dtype the weights are materialized in
    pub dtype: DType,
    /// Placement
    pub device: DeviceType,
    /// Only consult local files and the HF cache
    pub local_files_only: bool,
    /// Hub credential
    pub token: HubToken,
    /// Hub revision
    pub revision: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            dtype: DType::F16,
            device: DeviceType::Cpu,
            local_files_only: false,
            token: HubToken::Default,
            revision: "main".to_string(),
        }
    }
}

impl LoadOptions {
    /// Set the dtype
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set the device
    pub fn with_device(mut self, device: DeviceType) -> Self {
        self.device = device;
        self
    }

    /// Restrict resolution to local files
    pub fn with_local_files_only(mut self, local_files_only: bool) -> Self {
        self.local_files_only = local_files_only;
        self
    }

    /// Set the Hub credential
    pub fn with_token(mut self, token: HubToken) -> Self {
        self.token = token;
        self
    }
}

/// Where a model's files live
#[derive(Debug, Clone)]
pub enum ModelLocation {
    /// A directory holding `config.json` and safetensors files
    Local(PathBuf),
    /// A HuggingFace Hub repository
    Hub {
        /// `owner/name`
        repo_id: String,
        /// Branch, tag or commit
        revision: String,
        /// Never touch the network
        local_files_only: bool,
        /// Credential for gated repos
        token: HubToken,
    },
}

impl ModelLocation {
    /// Resolve `model_path`: an existing directory wins, anything else is a repo id
    pub fn resolve(model_path: &str, options: &LoadOptions) -> Result<Self> {
        let path = Path::new(model_path);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }

        validate_repo_id(model_path)?;
        Ok(Self::Hub {
            repo_id: model_path.to_string(),
            revision: options.revision.clone(),
            local_files_only: options.local_files_only,
            token: options.token.clone(),
        })
    }

    /// Path of one file of the model, downloading it if allowed
    pub fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(filename);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(SliceError::NotFound(format!(
                        "{} not found in {}",
                        filename,
                        dir.display()
                    )))
                }
            }
            Self::Hub {
                repo_id,
                revision,
                local_files_only,
                token,
            } => {
                let repo = Repo::with_revision(repo_id.clone(), RepoType::Model, revision.clone());
                if *local_files_only {
                    return Cache::default().repo(repo).get(filename).ok_or_else(|| {
                        SliceError::NotFound(format!(
                            "{} for {} is not in the local cache",
                            filename, repo_id
                        ))
                    });
                }

                let mut builder = ApiBuilder::new().with_progress(false);
                builder = match token {
                    HubToken::Default => match get_hf_token() {
                        Some(env_token) => builder.with_token(Some(env_token)),
                        None => builder,
                    },
                    HubToken::Anonymous => builder.with_token(None),
                    HubToken::Explicit(value) => builder.with_token(Some(value.clone())),
                };
                let api = builder.build()?;

                tracing::debug!("Fetching {} from {}@{}", filename, repo_id, revision);
                Ok(api.repo(repo).get(filename)?)
            }
        }
    }

    /// Path of `config.json`
    pub fn config_file(&self) -> Result<PathBuf> {
        self.get(CONFIG_FILE)
    }

    /// Safetensors files holding the weights, sorted
    pub fn weight_files(&self) -> Result<Vec<PathBuf>> {
        if let Ok(path) = self.get(SAFETENSORS_FILE) {
            return Ok(vec![path]);
        }

        let index_path = self.get(SAFETENSORS_INDEX_FILE).map_err(|_| {
            SliceError::NotFound(format!("No safetensors weights found for {}", self))
        })?;
        let shards = shard_names(&index_path)?;
        if shards.is_empty() {
            return Err(SliceError::NotFound(format!(
                "{} lists no shards",
                index_path.display()
            )));
        }

        let mut files = shards
            .iter()
            .map(|shard| self.get(shard))
            .collect::<Result<Vec<_>>>()?;
        files.sort();
        Ok(files)
    }
}

impl std::fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(dir) => write!(f, "{}", dir.display()),
            Self::Hub { repo_id, revision, .. } => write!(f, "{}@{}", repo_id, revision),
        }
    }
}

/// Shard file names listed in a safetensors index
fn shard_names(index_path: &Path) -> Result<BTreeSet<String>> {
    #[derive(Deserialize)]
    struct SafetensorsIndex {
        weight_map: std::collections::HashMap<String, String>,
    }

    let raw = std::fs::read_to_string(index_path)?;
    let index: SafetensorsIndex = serde_json::from_str(&raw)?;
    Ok(index.weight_map.into_values().collect())
}

/// Validate repo_id format: `owner/name`, no traversal
fn validate_repo_id(repo_id: &str) -> Result<()> {
    let slash_count = repo_id.chars().filter(|&c| c == '/').count();
    if slash_count != 1 || repo_id.starts_with('/') || repo_id.ends_with('/') {
        return Err(SliceError::NotFound(format!(
            "'{}' is neither a local directory nor a repository id of the form 'owner/name'",
            repo_id
        )));
    }
    if repo_id.contains("..") {
        return Err(SliceError::Hub(
            "Repository ID cannot contain '..' (path traversal)".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_directory_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();

        let location =
            ModelLocation::resolve(dir.path().to_str().unwrap(), &LoadOptions::default()).unwrap();
        assert!(matches!(location, ModelLocation::Local(_)));
        assert_eq!(location.config_file().unwrap(), dir.path().join(CONFIG_FILE));
        assert!(matches!(location.get("missing.bin"), Err(SliceError::NotFound(_))));
    }

    #[test]
    fn test_sharded_weight_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let index = json!({
            "metadata": { "total_size": 0 },
            "weight_map": {
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors",
                "lm_head.weight": "model-00002-of-00002.safetensors"
            }
        });
        std::fs::write(dir.path().join(SAFETENSORS_INDEX_FILE), index.to_string()).unwrap();
        std::fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();
        std::fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();

        let location = ModelLocation::Local(dir.path().to_path_buf());
        let files = location.weight_files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("model-00001-of-00002.safetensors"));
    }

    #[test]
    fn test_missing_weights_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let location = ModelLocation::Local(dir.path().to_path_buf());
        assert!(matches!(location.weight_files(), Err(SliceError::NotFound(_))));
    }

    #[test]
    fn test_repo_id_resolution() {
        let options = LoadOptions::default().with_local_files_only(true);
        let location = ModelLocation::resolve("meta-llama/Meta-Llama-3-8B", &options).unwrap();
        match location {
            ModelLocation::Hub {
                repo_id,
                local_files_only,
                ..
            } => {
                assert_eq!(repo_id, "meta-llama/Meta-Llama-3-8B");
                assert!(local_files_only);
            }
            ModelLocation::Local(_) => panic!("expected a hub location"),
        }

        assert!(ModelLocation::resolve("not-a-repo", &options).is_err());
        assert!(ModelLocation::resolve("a/b/c", &options).is_err());
    }

    #[test]
    fn test_local_files_only_never_downloads() {
        let options = LoadOptions::default().with_local_files_only(true);
        let location =
            ModelLocation::resolve("ruvector-test/definitely-not-cached-model", &options).unwrap();
        assert!(matches!(location.config_file(), Err(SliceError::NotFound(_))));
    }

    #[test]
    fn test_cpu_device_selection() {
        let device = DeviceType::Cpu.select().unwrap();
        assert!(device.is_cpu());
    }
}
