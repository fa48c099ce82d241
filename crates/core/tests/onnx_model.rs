//! Needs a real segmentation model and ONNX Runtime:
//! `NEURONFLOW_TEST_MODEL=/path/model.onnx cargo test -- --ignored`

use std::path::PathBuf;

use ndarray::Array3;
use neuronflow_core::engine::TtaConfig;
use neuronflow_core::model::{ModelConfig, OnnxModel};
use neuronflow_core::{runtime, InferenceConfig, SlidingWindowInferer};

fn test_model() -> Option<OnnxModel> {
    let path = PathBuf::from(std::env::var_os("NEURONFLOW_TEST_MODEL")?);
    runtime::setup_runtime_libs();
    let config = ModelConfig {
        path,
        ..ModelConfig::default()
    };
    Some(OnnxModel::load(&config).unwrap())
}

#[test]
#[ignore]
fn onnx_model_segments_a_synthetic_image() {
    let Some(model) = test_model() else {
        eprintln!("NEURONFLOW_TEST_MODEL not set, skipping");
        return;
    };
    let inferer = SlidingWindowInferer::new(InferenceConfig {
        patch_size: (256, 256),
        batch_size: 2,
        tta: TtaConfig::disabled(),
        ..InferenceConfig::default()
    })
    .unwrap();

    let image = Array3::from_shape_fn((1, 300, 280), |(_, y, x)| ((x + y) % 17) as f32 / 16.0);
    let prediction = inferer.infer(image.view(), &model).unwrap();

    assert_eq!(prediction.dim().1, 300);
    assert_eq!(prediction.dim().2, 280);
    assert!(prediction.iter().all(|v| v.is_finite()));
}
