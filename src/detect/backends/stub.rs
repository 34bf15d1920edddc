use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectorBackend, OutputTensor};

/// Deterministic backend for tests and demo runs.
///
/// By default it reports one candidate centered in the input, covering a
/// quarter of each dimension, with objectness 0.9 and class-0 score 0.8.
/// Tests can script exact rows or make every call fail.
pub struct StubBackend {
    mode: StubMode,
}

enum StubMode {
    Centered,
    Rows { rows: Vec<Vec<f32>>, row_len: usize },
    Failing,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            mode: StubMode::Centered,
        }
    }

    /// Return exactly `rows` (in model-input coordinates) on every call.
    pub fn with_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let row_len = rows.first().map(Vec::len).unwrap_or(6);
        if rows.iter().any(|row| row.len() != row_len) {
            return Err(anyhow!("scripted rows must all have the same length"));
        }
        Ok(Self {
            mode: StubMode::Rows { rows, row_len },
        })
    }

    /// Fail every inference call.
    pub fn failing() -> Self {
        Self {
            mode: StubMode::Failing,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, input: &[f32], width: u32, height: u32) -> Result<OutputTensor> {
        let expected = 3 * width as usize * height as usize;
        if input.len() != expected {
            return Err(anyhow!(
                "stub expected {} input values, received {}",
                expected,
                input.len()
            ));
        }

        match &self.mode {
            StubMode::Centered => {
                let (w, h) = (width as f32, height as f32);
                Ok(OutputTensor {
                    shape: vec![1, 1, 6],
                    data: vec![w / 2.0, h / 2.0, w / 4.0, h / 4.0, 0.9, 0.8],
                })
            }
            StubMode::Rows { rows, row_len } => Ok(OutputTensor {
                shape: vec![1, rows.len(), *row_len],
                data: rows.iter().flatten().copied().collect(),
            }),
            StubMode::Failing => Err(anyhow!("stub inference failure")),
        }
    }
}
