//! Named parameter maps and strict state transfer
//!
//! Every module in [`crate::nn`] and [`crate::models`] reports its learned
//! tensors under HuggingFace parameter names (`self_attn.q_proj.weight`, ...)
//! and can have them replaced from a [`StateDict`]. Strict loading validates
//! names and shapes before touching a single parameter, so a failed load
//! leaves the destination exactly as it was.

use crate::error::{Result, SliceError};
use candle_core::Tensor;
use candle_nn::{Embedding, Linear};
use std::collections::BTreeMap;

/// Parameter name to tensor, ordered by name
pub type StateDict = BTreeMap<String, Tensor>;

/// Join a module prefix and a parameter name with `.`
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// A module owning named learned tensors.
pub trait Parameterized {
    /// Insert every parameter, named under `prefix`, into `out`
    fn named_parameters(&self, prefix: &str, out: &mut StateDict);

    /// Replace every parameter with the tensor `sd` holds under the same name.
    ///
    /// Callers validate names and shapes first; see [`load_state_dict_strict`].
    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()>;

    /// All parameters keyed by their unprefixed names
    fn to_state_dict(&self) -> StateDict {
        let mut sd = StateDict::new();
        self.named_parameters("", &mut sd);
        sd
    }
}

/// Take `name` from `sd`, cast to the dtype and device of `like`.
pub fn fetch(sd: &StateDict, name: &str, like: &Tensor) -> Result<Tensor> {
    let tensor = sd.get(name).ok_or_else(|| SliceError::StateDict {
        missing: vec![name.to_string()],
        unexpected: Vec::new(),
    })?;
    Ok(tensor.to_dtype(like.dtype())?.to_device(like.device())?)
}

/// Copy every parameter of `sd` into `module`, requiring an exact name match.
///
/// Fails with [`SliceError::StateDict`] when a name is missing or unexpected
/// and with [`SliceError::ShapeMismatch`] when a shape differs. Nothing is
/// assigned unless every check passes.
pub fn load_state_dict_strict<M: Parameterized + ?Sized>(module: &mut M, sd: &StateDict) -> Result<()> {
    let expected = module.to_state_dict();

    let missing: Vec<String> = expected
        .keys()
        .filter(|name| !sd.contains_key(*name))
        .cloned()
        .collect();
    let unexpected: Vec<String> = sd
        .keys()
        .filter(|name| !expected.contains_key(*name))
        .cloned()
        .collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(SliceError::StateDict { missing, unexpected });
    }

    for (name, current) in &expected {
        let source = &sd[name];
        if source.dims() != current.dims() {
            return Err(SliceError::ShapeMismatch {
                name: name.clone(),
                expected: current.dims().to_vec(),
                actual: source.dims().to_vec(),
            });
        }
    }

    module.assign_parameters("", sd)
}

impl Parameterized for Linear {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        out.insert(join(prefix, "weight"), self.weight().clone());
        if let Some(bias) = self.bias() {
            out.insert(join(prefix, "bias"), bias.clone());
        }
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        let weight = fetch(sd, &join(prefix, "weight"), self.weight())?;
        let bias = match self.bias() {
            Some(bias) => Some(fetch(sd, &join(prefix, "bias"), bias)?),
            None => None,
        };
        *self = Linear::new(weight, bias);
        Ok(())
    }
}

impl Parameterized for Embedding {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        out.insert(join(prefix, "weight"), self.embeddings().clone());
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        let table = fetch(sd, &join(prefix, "weight"), self.embeddings())?;
        let hidden_size = table.dim(1)?;
        *self = Embedding::new(table, hidden_size);
        Ok(())
    }
}
