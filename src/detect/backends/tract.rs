#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorBackend, OutputTensor};

/// Tract-based backend for ONNX inference.
///
/// Loads a local model with a fixed `[1, 3, height, width]` input and returns
/// its first output as-is.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                f32::fact([1, 3, height as usize, width as usize]).into(),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, input: &[f32], width: u32, height: u32) -> Result<OutputTensor> {
        if width != self.width || height != self.height {
            return Err(anyhow!(
                "input size {}x{} does not match model input {}x{}",
                width,
                height,
                self.width,
                self.height
            ));
        }

        let tensor = tract_ndarray::Array4::from_shape_vec(
            (1, 3, height as usize, width as usize),
            input.to_vec(),
        )
        .context("input does not match the model's planar layout")?
        .into_tensor();

        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        Ok(OutputTensor {
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        })
    }

    fn warm_up(&mut self, width: u32, height: u32) -> Result<()> {
        let blank = vec![0.0f32; 3 * width as usize * height as usize];
        self.infer(&blank, width, height).map(|_| ())
    }
}
