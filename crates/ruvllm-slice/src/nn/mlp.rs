//! SwiGLU feed-forward block

use super::init::linear;
use crate::error::Result;
use crate::state_dict::{join, Parameterized, StateDict};
use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

/// `down(silu(gate(x)) * up(x))`
#[derive(Debug, Clone)]
pub struct GatedMlp {
    /// Gate projection
    pub gate_proj: Linear,
    /// Up projection
    pub up_proj: Linear,
    /// Down projection
    pub down_proj: Linear,
}

impl GatedMlp {
    /// Load `gate_proj`, `up_proj` and `down_proj` from `vb`
    pub fn load(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear(hidden_size, intermediate_size, false, vb.pp("gate_proj"))?,
            up_proj: linear(hidden_size, intermediate_size, false, vb.pp("up_proj"))?,
            down_proj: linear(intermediate_size, hidden_size, false, vb.pp("down_proj"))?,
        })
    }
}

impl Module for GatedMlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs)?)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&gate.mul(&up)?)
    }
}

impl Parameterized for GatedMlp {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.gate_proj.named_parameters(&join(prefix, "gate_proj"), out);
        self.up_proj.named_parameters(&join(prefix, "up_proj"), out);
        self.down_proj.named_parameters(&join(prefix, "down_proj"), out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.gate_proj.assign_parameters(&join(prefix, "gate_proj"), sd)?;
        self.up_proj.assign_parameters(&join(prefix, "up_proj"), sd)?;
        self.down_proj.assign_parameters(&join(prefix, "down_proj"), sd)
    }
}
