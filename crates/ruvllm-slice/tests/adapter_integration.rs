//! Integration tests for the layer/model adapter contract
//!
//! Runs both adapter pairs over tiny randomly initialised models: accessor
//! order, view semantics, conversion to compressed layers and the shortcut
//! residual wiring.

use candle_core::{DType, Device, Module, Tensor};
use ruvllm_slice::{
    adapter::{DecoderBlock, LayerAdapter, ModelAdapter},
    config::{LlamaConfig, MixtralConfig},
    models::{LlamaDecoderLayer, LlamaForCausalLM, MixtralForCausalLM},
    nn::{LayerArgs, LayerOutput, WeightInit},
    state_dict::StateDict,
    Llama3ModelAdapter, MixtralModelAdapter, Result, SliceError,
};
use serde_json::json;

const HIDDEN: usize = 16;

fn llama_config() -> LlamaConfig {
    serde_json::from_value(json!({
        "vocab_size": 40,
        "hidden_size": HIDDEN,
        "intermediate_size": 24,
        "num_hidden_layers": 3,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "max_position_embeddings": 256,
        "rms_norm_eps": 1e-5,
        "rope_theta": 500000.0
    }))
    .unwrap()
}

fn mixtral_config() -> MixtralConfig {
    serde_json::from_value(json!({
        "vocab_size": 40,
        "hidden_size": HIDDEN,
        "intermediate_size": 20,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 1,
        "max_position_embeddings": 256,
        "num_local_experts": 4,
        "num_experts_per_tok": 2
    }))
    .unwrap()
}

fn llama_adapter() -> Llama3ModelAdapter {
    let model = LlamaForCausalLM::new(llama_config(), WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
    Llama3ModelAdapter::new(model)
}

fn mixtral_adapter() -> MixtralModelAdapter {
    let model = MixtralForCausalLM::new(mixtral_config(), WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
    MixtralModelAdapter::new(model)
}

fn adapters() -> Vec<Box<dyn ModelAdapter>> {
    vec![Box::new(llama_adapter()), Box::new(mixtral_adapter())]
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn random_hidden(seq_len: usize) -> Tensor {
    Tensor::randn(0f32, 1., (2, seq_len, HIDDEN), &Device::Cpu).unwrap()
}

fn random_rotation() -> Tensor {
    Tensor::randn(0f32, 0.3, (HIDDEN, HIDDEN), &Device::Cpu).unwrap()
}

fn block_address(block: &dyn DecoderBlock) -> usize {
    block as *const dyn DecoderBlock as *const u8 as usize
}

// ============================================================================
// Accessors
// ============================================================================

#[test]
fn test_accessor_counts_and_order() {
    for mut adapter in adapters() {
        let layers = adapter.get_layers();
        assert!(!layers.is_empty());

        for layer in &layers {
            let attn_inputs = layer.get_attention_inputs();
            assert_eq!(attn_inputs.len(), 3);
            // q is full width, k and v are grouped
            assert_eq!(attn_inputs[0].weight().dim(0).unwrap(), HIDDEN);
            assert_eq!(attn_inputs[1].weight().dims(), attn_inputs[2].weight().dims());
            assert_eq!(attn_inputs[1].weight().dim(1).unwrap(), HIDDEN);

            assert_eq!(layer.get_mlp_inputs().len(), 2);
            for linear in layer.get_mlp_inputs() {
                assert_eq!(linear.weight().dim(1).unwrap(), HIDDEN);
            }
            assert_eq!(layer.get_mlp_output().weight().dim(0).unwrap(), HIDDEN);
            assert_eq!(layer.get_attention_output().weight().dim(0).unwrap(), HIDDEN);
            assert_eq!(layer.hidden_states_args_position(), 0);
            assert_eq!(layer.hidden_states_output_position(), 0);
        }
    }
}

#[test]
fn test_get_layers_returns_views() {
    for mut adapter in adapters() {
        let first: Vec<usize> = adapter
            .get_layers()
            .iter()
            .map(|layer| block_address(layer.layer()))
            .collect();
        let second: Vec<usize> = adapter
            .get_layers()
            .iter()
            .map(|layer| block_address(layer.layer()))
            .collect();
        assert_eq!(first, second);

        for (i, address) in first.iter().enumerate() {
            assert_eq!(*address, block_address(adapter.get_raw_layer_at(i).unwrap()));
        }
    }
}

#[test]
fn test_mutation_through_view_reaches_model() {
    let mut adapter = llama_adapter();
    {
        let mut layers = adapter.get_layers();
        let mut inputs = layers[1].get_attention_inputs_mut();
        let zeros = inputs[0].weight().zeros_like().unwrap();
        *inputs[0] = candle_nn::Linear::new(zeros, None);
        layers[1].get_first_layernorm_mut().set_weight(Tensor::zeros(HIDDEN, DType::F32, &Device::Cpu).unwrap());
    }

    let sd = adapter.get_raw_layer_at(1).unwrap().state_dict();
    let q_sum = sd["self_attn.q_proj.weight"].abs().unwrap().sum_all().unwrap();
    assert_eq!(q_sum.to_scalar::<f32>().unwrap(), 0.0);
    let norm_sum = sd["input_layernorm.weight"].sum_all().unwrap();
    assert_eq!(norm_sum.to_scalar::<f32>().unwrap(), 0.0);
}

#[test]
fn test_pre_head_norm_embeddings_and_head() {
    for adapter in adapters() {
        let norm = adapter.get_pre_head_layernorm().unwrap();
        assert_eq!(norm.weight().dims(), &[HIDDEN]);

        let embeddings = adapter.get_embeddings();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].embeddings().dims(), &[40, HIDDEN]);
        assert_eq!(adapter.get_lm_head().weight().dims(), &[40, HIDDEN]);
        adapter.validate_config().unwrap();
    }
}

// ============================================================================
// Compressed layers
// ============================================================================

#[test]
fn test_compressed_layer_without_shortcuts_matches_original() {
    for adapter in adapters() {
        let hidden = random_hidden(5);
        let args = LayerArgs {
            use_cache: true,
            output_router_logits: true,
            ..Default::default()
        };

        for i in 0..adapter.num_layers() {
            let original = adapter.get_raw_layer_at(i).unwrap();
            let compressed = adapter.convert_layer_to_compressed(original, Some(i)).unwrap();
            assert!(compressed.shortcuts().unwrap().is_empty());

            let expected = original.forward(&hidden, &args).unwrap();
            let actual = compressed.forward(&hidden, &args).unwrap();
            assert!(max_abs_diff(&expected.hidden_states, &actual.hidden_states) < 1e-5);
            assert_eq!(expected.len(), actual.len());
        }
    }
}

#[test]
fn test_attention_shortcut_rotates_residual_llama() {
    let adapter = llama_adapter();
    let hidden = random_hidden(4);
    let q = random_rotation();
    let args = LayerArgs::default();

    let original = adapter.get_raw_layer_at(0).unwrap();
    let mut compressed = adapter.convert_layer_to_compressed(original, None).unwrap();
    compressed.shortcuts_mut().unwrap().attn_shortcut_q = Some(q.clone());
    let actual = compressed.forward(&hidden, &args).unwrap().hidden_states;

    // Reference built from the native layer's parts
    let native = original.as_any().downcast_ref::<LlamaDecoderLayer>().unwrap();
    let normed = native.input_layernorm.forward(&hidden).unwrap();
    let attn = native.self_attn.forward(&normed, &args).unwrap().hidden_states;
    let after_attn = hidden.broadcast_matmul(&q).unwrap().add(&attn).unwrap();
    let normed = native.post_attention_layernorm.forward(&after_attn).unwrap();
    let expected = after_attn.add(&native.mlp.forward(&normed).unwrap()).unwrap();

    assert!(max_abs_diff(&expected, &actual) < 1e-4);
}

#[test]
fn test_mlp_shortcut_rotates_residual_mixtral() {
    let adapter = mixtral_adapter();
    let hidden = random_hidden(3);
    let q = random_rotation();
    let args = LayerArgs::default();

    let original = adapter.get_raw_layer_at(1).unwrap();
    let mut compressed = adapter.convert_layer_to_compressed(original, None).unwrap();
    compressed.shortcuts_mut().unwrap().mlp_shortcut_q = Some(q.clone());
    let actual = compressed.forward(&hidden, &args).unwrap().hidden_states;

    let native = original
        .as_any()
        .downcast_ref::<ruvllm_slice::models::MixtralDecoderLayer>()
        .unwrap();
    let normed = native.input_layernorm.forward(&hidden).unwrap();
    let attn = native.self_attn.forward(&normed, &args).unwrap().hidden_states;
    let after_attn = hidden.add(&attn).unwrap();
    let normed = native.post_attention_layernorm.forward(&after_attn).unwrap();
    let (moe, _) = native.block_sparse_moe.forward(&normed).unwrap();
    let expected = after_attn.broadcast_matmul(&q).unwrap().add(&moe).unwrap();

    assert!(max_abs_diff(&expected, &actual) < 1e-4);
}

#[test]
fn test_mlp_shortcut_rotates_residual_llama() {
    let adapter = llama_adapter();
    let hidden = random_hidden(4);
    let q = random_rotation();
    let args = LayerArgs::default();

    let original = adapter.get_raw_layer_at(1).unwrap();
    let mut compressed = adapter.convert_layer_to_compressed(original, None).unwrap();
    compressed.shortcuts_mut().unwrap().mlp_shortcut_q = Some(q.clone());
    let actual = compressed.forward(&hidden, &args).unwrap().hidden_states;

    let native = original.as_any().downcast_ref::<LlamaDecoderLayer>().unwrap();
    let normed = native.input_layernorm.forward(&hidden).unwrap();
    let attn = native.self_attn.forward(&normed, &args).unwrap().hidden_states;
    let after_attn = hidden.add(&attn).unwrap();
    let normed = native.post_attention_layernorm.forward(&after_attn).unwrap();
    let mlp = native.mlp.forward(&normed).unwrap();
    let expected = after_attn.broadcast_matmul(&q).unwrap().add(&mlp).unwrap();

    assert!(max_abs_diff(&expected, &actual) < 1e-4);
}

#[test]
fn test_attention_shortcut_rotates_residual_mixtral() {
    let adapter = mixtral_adapter();
    let hidden = random_hidden(3);
    let q = random_rotation();
    let args = LayerArgs::default();

    let original = adapter.get_raw_layer_at(0).unwrap();
    let mut compressed = adapter.convert_layer_to_compressed(original, None).unwrap();
    compressed.shortcuts_mut().unwrap().attn_shortcut_q = Some(q.clone());
    let actual = compressed.forward(&hidden, &args).unwrap().hidden_states;

    let native = original
        .as_any()
        .downcast_ref::<ruvllm_slice::models::MixtralDecoderLayer>()
        .unwrap();
    let normed = native.input_layernorm.forward(&hidden).unwrap();
    let attn = native.self_attn.forward(&normed, &args).unwrap().hidden_states;
    let after_attn = hidden.broadcast_matmul(&q).unwrap().add(&attn).unwrap();
    let normed = native.post_attention_layernorm.forward(&after_attn).unwrap();
    let (moe, _) = native.block_sparse_moe.forward(&normed).unwrap();
    let expected = after_attn.add(&moe).unwrap();

    assert!(max_abs_diff(&expected, &actual) < 1e-4);
}

#[test]
fn test_shortcuts_are_not_interchangeable() {
    // Same Q on the other junction must give a different output
    for adapter in adapters() {
        let hidden = random_hidden(3);
        let q = random_rotation();
        let args = LayerArgs::default();
        let original = adapter.get_raw_layer_at(0).unwrap();

        let mut on_attn = adapter.convert_layer_to_compressed(original, None).unwrap();
        on_attn.shortcuts_mut().unwrap().attn_shortcut_q = Some(q.clone());
        let mut on_mlp = adapter.convert_layer_to_compressed(original, None).unwrap();
        on_mlp.shortcuts_mut().unwrap().mlp_shortcut_q = Some(q);

        let a = on_attn.forward(&hidden, &args).unwrap().hidden_states;
        let b = on_mlp.forward(&hidden, &args).unwrap().hidden_states;
        assert!(max_abs_diff(&a, &b) > 1e-3);
    }
}

#[test]
fn test_identity_shortcuts_preserve_model_logits() {
    for mut adapter in adapters() {
        let input_ids = Tensor::new(&[[1u32, 7, 3, 9, 2]], &Device::Cpu).unwrap();
        let before = adapter.compute_output_logits(&input_ids).unwrap();
        let identity = Tensor::eye(HIDDEN, DType::F32, &Device::Cpu).unwrap();

        for i in 0..adapter.num_layers() {
            let compressed = adapter
                .convert_layer_to_compressed(adapter.get_raw_layer_at(i).unwrap(), Some(i))
                .unwrap();
            adapter.set_raw_layer_at(i, compressed).unwrap();

            let shortcuts = adapter.get_raw_layer_at_mut(i).unwrap().shortcuts_mut().unwrap();
            shortcuts.attn_shortcut_q = Some(identity.clone());
            shortcuts.mlp_shortcut_q = Some(identity.clone());
        }

        assert!(adapter.get_raw_layer_at(0).unwrap().is_compressed());
        let after = adapter.compute_output_logits(&input_ids).unwrap();
        assert!(max_abs_diff(&before, &after) < 1e-4);
    }
}

#[test]
fn test_compressed_layer_keeps_output_tuple() {
    let adapter = llama_adapter();
    let hidden = random_hidden(2);
    let args = LayerArgs {
        output_attentions: true,
        use_cache: true,
        ..Default::default()
    };

    let original = adapter.get_raw_layer_at(2).unwrap();
    let compressed = adapter.convert_layer_to_compressed(original, None).unwrap();
    let out: LayerOutput = compressed.forward(&hidden, &args).unwrap();

    assert_eq!(out.len(), 3);
    assert_eq!(out.attn_weights.unwrap().dims(), &[2, 4, 2, 2]);
    assert_eq!(out.present_key_value.unwrap().key.dims(), &[2, 2, 2, 4]);
    assert!(out.router_logits.is_none());
}

// ============================================================================
// Strict transfer
// ============================================================================

/// Llama layer that hides one parameter from its state dict
#[derive(Debug)]
struct TruncatedLayer(LlamaDecoderLayer);

impl DecoderBlock for TruncatedLayer {
    fn layer_idx(&self) -> usize {
        self.0.layer_idx()
    }

    fn forward(&self, hidden_states: &Tensor, args: &LayerArgs<'_>) -> Result<LayerOutput> {
        self.0.forward(hidden_states, args)
    }

    fn state_dict(&self) -> StateDict {
        let mut sd = DecoderBlock::state_dict(&self.0);
        sd.remove("mlp.up_proj.weight");
        sd
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

#[test]
fn test_missing_parameter_aborts_conversion() {
    let adapter = llama_adapter();
    let layer = LlamaDecoderLayer::new(&llama_config(), 0, WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
    let truncated = TruncatedLayer(layer);

    match adapter.convert_layer_to_compressed(&truncated, None) {
        Err(SliceError::StateDict { missing, unexpected }) => {
            assert_eq!(missing, vec!["mlp.up_proj.weight".to_string()]);
            assert!(unexpected.is_empty());
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("conversion must fail"),
    }
}

#[test]
fn test_foreign_block_rejected_by_set_raw_layer_at() {
    let mut adapter = llama_adapter();
    let layer = LlamaDecoderLayer::new(&llama_config(), 0, WeightInit::Skip, DType::F32, &Device::Cpu).unwrap();

    let result = adapter.set_raw_layer_at(0, Box::new(TruncatedLayer(layer)));
    assert!(matches!(result, Err(SliceError::StructuralMismatch(_))));
    assert!(matches!(
        adapter.set_raw_layer_at(
            3,
            Box::new(LlamaDecoderLayer::new(&llama_config(), 3, WeightInit::Skip, DType::F32, &Device::Cpu).unwrap())
        ),
        Err(SliceError::LayerIndexOutOfRange { index: 3, len: 3 })
    ));
}

#[test]
fn test_conversion_uses_configured_dtype() {
    let mut config = llama_config();
    config.base.torch_dtype = Some("float16".to_string());
    let model = LlamaForCausalLM::new(config, WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
    let adapter = Llama3ModelAdapter::new(model);

    let compressed = adapter
        .convert_layer_to_compressed(adapter.get_raw_layer_at(0).unwrap(), None)
        .unwrap();
    for tensor in compressed.state_dict().values() {
        assert_eq!(tensor.dtype(), DType::F16);
    }
}
