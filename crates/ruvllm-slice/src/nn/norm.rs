//! RMS normalization

use crate::error::Result;
use crate::state_dict::{fetch, join, Parameterized, StateDict};
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Root-mean-square norm with a learned per-channel scale.
///
/// The variance is computed in f32 and the result cast back to the input
/// dtype before scaling, matching the HF Llama/Mixtral implementations.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Wrap an existing scale vector
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Load `weight` of length `size`; fresh shells start at one
    pub fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    /// Scale vector
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Replace the scale vector (e.g. after folding it into adjacent linears)
    pub fn set_weight(&mut self, weight: Tensor) {
        self.weight = weight;
    }

    /// Epsilon
    pub fn eps(&self) -> f64 {
        self.eps
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let xs = xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        xs.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}

impl Parameterized for RmsNorm {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        out.insert(join(prefix, "weight"), self.weight.clone());
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.weight = fetch(sd, &join(prefix, "weight"), &self.weight)?;
        Ok(())
    }
}
