//! Rotary position embeddings

use crate::config::RopeScaling;
use crate::error::Result;
use candle_core::{DType, Device, Tensor, D};

/// Inverse-frequency table for RoPE, optionally with Llama-3.1 scaling.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// f32, shape `[head_dim / 2]`
    inv_freq: Tensor,
    head_dim: usize,
}

impl RotaryEmbedding {
    /// Build the table for `head_dim` and base `theta`
    pub fn new(head_dim: usize, theta: f64, scaling: Option<&RopeScaling>, device: &Device) -> Result<Self> {
        let mut inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();

        if let Some(scaling) = scaling.filter(|s| s.rope_type == "llama3") {
            inv_freq = llama3_scaled(&inv_freq, scaling);
        }

        let len = inv_freq.len();
        Ok(Self {
            inv_freq: Tensor::from_vec(inv_freq, len, device)?,
            head_dim,
        })
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// `(cos, sin)`, each `[batch, seq, head_dim]` in `dtype`, for integer
    /// `position_ids` of shape `[batch, seq]`
    pub fn forward(&self, position_ids: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len) = position_ids.dims2()?;
        let half = self.inv_freq.dim(0)?;

        let positions = position_ids
            .to_dtype(DType::F32)?
            .reshape((batch, seq_len, 1))?;
        let freqs = positions.broadcast_mul(&self.inv_freq.reshape((1, 1, half))?)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
    }
}

/// Llama-3.1 smoothing: long wavelengths are stretched by `factor`, short
/// ones kept, and the band in between interpolated.
fn llama3_scaled(inv_freq: &[f32], scaling: &RopeScaling) -> Vec<f32> {
    let old_ctx = scaling.original_max_position_embeddings as f64;
    let low_freq_wavelen = old_ctx / scaling.low_freq_factor;
    let high_freq_wavelen = old_ctx / scaling.high_freq_factor;

    inv_freq
        .iter()
        .map(|&freq| {
            let freq = freq as f64;
            let wavelen = 2.0 * std::f64::consts::PI / freq;
            let scaled = if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / scaling.factor
            } else {
                let smooth = (old_ctx / wavelen - scaling.low_freq_factor)
                    / (scaling.high_freq_factor - scaling.low_freq_factor);
                (1.0 - smooth) * freq / scaling.factor + smooth * freq
            };
            scaled as f32
        })
        .collect()
}

fn rotate_half(xs: &Tensor) -> Result<Tensor> {
    let last = xs.dim(D::Minus1)?;
    let x1 = xs.narrow(D::Minus1, 0, last / 2)?;
    let x2 = xs.narrow(D::Minus1, last / 2, last - last / 2)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

/// Rotate `q` and `k` (`[batch, heads, seq, head_dim]`) by `cos`/`sin`
/// (`[batch, seq, head_dim]`)
pub fn apply_rotary_pos_emb(q: &Tensor, k: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<(Tensor, Tensor)> {
    let cos = cos.unsqueeze(1)?;
    let sin = sin.unsqueeze(1)?;

    let q_embed = q.broadcast_mul(&cos)?.add(&rotate_half(q)?.broadcast_mul(&sin)?)?;
    let k_embed = k.broadcast_mul(&cos)?.add(&rotate_half(k)?.broadcast_mul(&sin)?)?;
    Ok((q_embed, k_embed))
}

/// Positions `past_len..past_len + seq_len` for every row of the batch
pub fn default_position_ids(batch: usize, seq_len: usize, past_len: usize, device: &Device) -> Result<Tensor> {
    let start = past_len as u32;
    let ids = Tensor::arange(start, start + seq_len as u32, device)?
        .unsqueeze(0)?
        .broadcast_as((batch, seq_len))?
        .contiguous()?;
    Ok(ids)
}
