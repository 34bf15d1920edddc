use anyhow::Result;

/// Raw model output: a flat row-major buffer plus its shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Inference backend behind the detection engine.
///
/// Backends receive an already normalized `[1, 3, height, width]` planar input
/// and return the model's first output tensor untouched. Decoding candidates
/// into boxes is the engine's job, so a backend never sees thresholds or
/// labels.
///
/// `infer` takes `&mut self`: native runtimes are not assumed to tolerate
/// concurrent calls, and the engine serializes access behind a mutex.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run one forward pass.
    fn infer(&mut self, input: &[f32], width: u32, height: u32) -> Result<OutputTensor>;

    /// Optional warm-up hook.
    fn warm_up(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }
}
