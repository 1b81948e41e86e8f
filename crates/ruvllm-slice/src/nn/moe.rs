//! Sparse mixture-of-experts block (Mixtral)
//!
//! Expert weights are held fused so the adapter can expose the block's
//! entry and exit projections as single linears:
//!
//! - `experts.gate_up_proj`: `[num_experts * 2 * intermediate, hidden]`,
//!   expert `e` owns rows `e*2I..(e+1)*2I` laid out as `w1 ‖ w3`
//! - `experts.down_proj`: `[hidden, num_experts * intermediate]`, expert `e`
//!   owns columns `e*I..(e+1)*I`
//!
//! HF checkpoints store `experts.{e}.w1/w2/w3` per expert; they are fused at
//! load time. Checkpoints saved by this crate already hold the fused names.

use super::init::linear;
use crate::error::{Result, SliceError};
use crate::state_dict::{join, Parameterized, StateDict};
use candle_core::{DType, Module, Tensor};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use candle_nn::{Linear, VarBuilder};

/// Every expert's SwiGLU weights in two fused linears
#[derive(Debug, Clone)]
pub struct FusedExperts {
    /// Stacked `w1 ‖ w3` of every expert
    pub gate_up_proj: Linear,
    /// Concatenated `w2` of every expert
    pub down_proj: Linear,
    num_experts: usize,
    intermediate_size: usize,
}

impl FusedExperts {
    /// Load expert weights from `vb`.
    ///
    /// Fused `gate_up_proj`/`down_proj` are read directly when present (as
    /// written by this crate); otherwise per-expert `{e}.w1`, `{e}.w3`,
    /// `{e}.w2` are read and fused.
    pub fn load(num_experts: usize, hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        if vb.contains_tensor("gate_up_proj.weight") {
            let gate_up = vb.get_with_hints(
                (num_experts * 2 * intermediate_size, hidden_size),
                "gate_up_proj.weight",
                DEFAULT_KAIMING_NORMAL,
            )?;
            let down = vb.get_with_hints(
                (hidden_size, num_experts * intermediate_size),
                "down_proj.weight",
                DEFAULT_KAIMING_NORMAL,
            )?;
            return Ok(Self {
                gate_up_proj: Linear::new(gate_up, None),
                down_proj: Linear::new(down, None),
                num_experts,
                intermediate_size,
            });
        }

        let mut gate_up = Vec::with_capacity(num_experts);
        let mut down = Vec::with_capacity(num_experts);
        for e in 0..num_experts {
            let evb = vb.pp(e);
            let w1 = evb.get_with_hints((intermediate_size, hidden_size), "w1.weight", DEFAULT_KAIMING_NORMAL)?;
            let w3 = evb.get_with_hints((intermediate_size, hidden_size), "w3.weight", DEFAULT_KAIMING_NORMAL)?;
            let w2 = evb.get_with_hints((hidden_size, intermediate_size), "w2.weight", DEFAULT_KAIMING_NORMAL)?;
            gate_up.push(Tensor::cat(&[&w1, &w3], 0)?);
            down.push(w2);
        }

        Ok(Self {
            gate_up_proj: Linear::new(Tensor::cat(&gate_up, 0)?, None),
            down_proj: Linear::new(Tensor::cat(&down, 1)?, None),
            num_experts,
            intermediate_size,
        })
    }

    /// Number of experts
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Per-expert intermediate width
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    /// Run expert `e` on `xs` (`[tokens, hidden]`)
    pub fn expert_forward(&self, e: usize, xs: &Tensor) -> Result<Tensor> {
        if e >= self.num_experts {
            return Err(SliceError::InvalidOperation(format!(
                "Expert {} out of range for {} experts",
                e, self.num_experts
            )));
        }
        let inter = self.intermediate_size;

        let w13 = self.gate_up_proj.weight().narrow(0, e * 2 * inter, 2 * inter)?;
        let h = xs.matmul(&w13.t()?)?;
        let gate = candle_nn::ops::silu(&h.narrow(1, 0, inter)?)?;
        let h = gate.mul(&h.narrow(1, inter, inter)?)?;

        let w2 = self.down_proj.weight().narrow(1, e * inter, inter)?.contiguous()?;
        Ok(h.matmul(&w2.t()?)?)
    }
}

impl Parameterized for FusedExperts {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.gate_up_proj.named_parameters(&join(prefix, "gate_up_proj"), out);
        self.down_proj.named_parameters(&join(prefix, "down_proj"), out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.gate_up_proj.assign_parameters(&join(prefix, "gate_up_proj"), sd)?;
        self.down_proj.assign_parameters(&join(prefix, "down_proj"), sd)
    }
}

/// Router plus experts. Each token goes to its `top_k` experts, weighted by
/// the renormalised router probabilities.
#[derive(Debug, Clone)]
pub struct SparseMoeBlock {
    /// Router, `[num_experts, hidden]`
    pub gate: Linear,
    /// Fused expert weights
    pub experts: FusedExperts,
    top_k: usize,
}

impl SparseMoeBlock {
    /// Load `gate` and `experts.*` from `vb`
    pub fn load(
        hidden_size: usize,
        intermediate_size: usize,
        num_experts: usize,
        top_k: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            gate: linear(hidden_size, num_experts, false, vb.pp("gate"))?,
            experts: FusedExperts::load(num_experts, hidden_size, intermediate_size, vb.pp("experts"))?,
            top_k,
        })
    }

    /// Experts per token
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Returns the block output (`[batch, seq, hidden]`) and the router logits
    /// (`[batch * seq, num_experts]`)
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, hidden) = xs.dims3()?;
        let xs = xs.reshape((batch * seq_len, hidden))?;

        let router_logits = self.gate.forward(&xs)?;
        let routing_weights = candle_nn::ops::softmax_last_dim(&router_logits.to_dtype(DType::F32)?)?;
        let routing_weights = routing_weights.to_vec2::<f32>()?;

        // Token indices and weights per expert
        let num_experts = self.experts.num_experts();
        let mut top_x = vec![Vec::<u32>::new(); num_experts];
        let mut selected = vec![Vec::<f32>::new(); num_experts];
        for (token, weights) in routing_weights.iter().enumerate() {
            let mut order: Vec<usize> = (0..weights.len()).collect();
            order.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));
            let chosen = &order[..self.top_k.min(order.len())];
            let total: f32 = chosen.iter().map(|&e| weights[e]).sum();
            for &e in chosen {
                top_x[e].push(token as u32);
                selected[e].push(weights[e] / total);
            }
        }

        let mut ys = xs.zeros_like()?;
        for e in 0..num_experts {
            if top_x[e].is_empty() {
                continue;
            }
            let idx = Tensor::new(top_x[e].as_slice(), xs.device())?;
            let scale = Tensor::new(selected[e].as_slice(), xs.device())?
                .reshape((top_x[e].len(), 1))?
                .to_dtype(xs.dtype())?;

            let current = xs.index_select(&idx, 0)?;
            let current = self.experts.expert_forward(e, &current)?.broadcast_mul(&scale)?;
            ys = ys.index_add(&idx, &current, 0)?;
        }

        Ok((ys.reshape((batch, seq_len, hidden))?, router_logits))
    }
}

impl Parameterized for SparseMoeBlock {
    fn named_parameters(&self, prefix: &str, out: &mut StateDict) {
        self.gate.named_parameters(&join(prefix, "gate"), out);
        self.experts.named_parameters(&join(prefix, "experts"), out);
    }

    fn assign_parameters(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.gate.assign_parameters(&join(prefix, "gate"), sd)?;
        self.experts.assign_parameters(&join(prefix, "experts"), sd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::init::{shell_var_builder, WeightInit};
    use candle_core::Device;

    fn tiny_moe(top_k: usize) -> SparseMoeBlock {
        let vb = shell_var_builder(WeightInit::Random, DType::F32, &Device::Cpu);
        SparseMoeBlock::load(8, 6, 4, top_k, vb).unwrap()
    }

    #[test]
    fn test_fused_layout_and_names() {
        let moe = tiny_moe(2);
        assert_eq!(moe.experts.gate_up_proj.weight().dims(), &[4 * 2 * 6, 8]);
        assert_eq!(moe.experts.down_proj.weight().dims(), &[8, 4 * 6]);

        let names: Vec<String> = moe.to_state_dict().into_keys().collect();
        assert_eq!(
            names,
            vec!["experts.down_proj.weight", "experts.gate_up_proj.weight", "gate.weight"]
        );
    }

    #[test]
    fn test_per_expert_checkpoint_is_fused() {
        let device = Device::Cpu;
        let mut tensors = std::collections::HashMap::new();
        for e in 0..2u32 {
            let value = e as f32 + 1.0;
            tensors.insert(format!("{}.w1.weight", e), Tensor::full(value, (3, 4), &device).unwrap());
            tensors.insert(format!("{}.w3.weight", e), Tensor::full(-value, (3, 4), &device).unwrap());
            tensors.insert(format!("{}.w2.weight", e), Tensor::full(value * 10.0, (4, 3), &device).unwrap());
        }
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let experts = FusedExperts::load(2, 4, 3, vb).unwrap();

        let rows = experts.gate_up_proj.weight().to_vec2::<f32>().unwrap();
        assert_eq!(rows.len(), 12);
        assert_eq!(rows[0][0], 1.0);
        assert_eq!(rows[3][0], -1.0);
        assert_eq!(rows[6][0], 2.0);
        assert_eq!(rows[9][0], -2.0);

        let cols = experts.down_proj.weight().to_vec2::<f32>().unwrap();
        assert_eq!(cols[0][2], 10.0);
        assert_eq!(cols[0][3], 20.0);
    }

    #[test]
    fn test_forward_shapes() {
        let moe = tiny_moe(2);
        let xs = Tensor::randn(0f32, 1., (2, 3, 8), &Device::Cpu).unwrap();

        let (ys, router_logits) = moe.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[2, 3, 8]);
        assert_eq!(router_logits.dims(), &[6, 4]);
    }

    #[test]
    fn test_single_token_matches_manual_routing() {
        let moe = tiny_moe(1);
        let xs = Tensor::randn(0f32, 1., (1, 1, 8), &Device::Cpu).unwrap();

        let (ys, router_logits) = moe.forward(&xs).unwrap();
        let logits = router_logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let best = (0..logits.len())
            .max_by(|&a, &b| logits[a].total_cmp(&logits[b]))
            .unwrap();

        // top-1 renormalises to weight 1.0
        let flat = xs.reshape((1, 8)).unwrap();
        let expected = moe.experts.expert_forward(best, &flat).unwrap();
        let diff = ys
            .reshape((1, 8))
            .unwrap()
            .sub(&expected)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_expert_index_checked() {
        let moe = tiny_moe(2);
        let xs = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(moe.experts.expert_forward(4, &xs).is_err());
    }
}
