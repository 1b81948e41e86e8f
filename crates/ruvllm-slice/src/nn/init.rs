//! Construction modes for model shells

use candle_core::{DType, Device};
use candle_nn::{Linear, VarBuilder, VarMap};

/// How freshly constructed parameters are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightInit {
    /// Run the default initialisation: Kaiming-normal linears, unit norms,
    /// normal embeddings
    #[default]
    Random,
    /// Allocate zeroed storage and never run an initialisation pass. The
    /// result is structurally valid but numerically meaningless until
    /// weights are copied in.
    Skip,
}

/// Var builder producing parameters according to `init`.
///
/// Random parameters live in a private [`VarMap`]; module constructors read
/// them through `get_with_hints`, so the same constructors serve checkpoint
/// loading, random init and zeroed shells.
pub fn shell_var_builder(init: WeightInit, dtype: DType, device: &Device) -> VarBuilder<'static> {
    match init {
        WeightInit::Random => {
            let varmap = VarMap::new();
            VarBuilder::from_varmap(&varmap, dtype, device)
        }
        WeightInit::Skip => VarBuilder::zeros(dtype, device),
    }
}

/// Linear projection with optional bias
pub fn linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> candle_core::Result<Linear> {
    candle_nn::linear_b(in_dim, out_dim, bias, vb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_init_is_zero() {
        let vb = shell_var_builder(WeightInit::Skip, DType::F32, &Device::Cpu);
        let layer = linear(4, 3, false, vb.pp("proj")).unwrap();

        assert_eq!(layer.weight().dims(), &[3, 4]);
        let values = layer.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_random_init_is_not_zero() {
        let vb = shell_var_builder(WeightInit::Random, DType::F32, &Device::Cpu);
        let layer = linear(16, 16, true, vb.pp("proj")).unwrap();

        let values = layer.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().any(|&v| v != 0.0));
        assert!(layer.bias().is_some());
    }
}
