//! Graph model loading and execution via `ort::Session`.
//!
//! The model artifact is a directory holding `model.onnx` (weights plus the
//! serialized graph) and an optional `model.json` manifest describing the
//! graph's I/O names and spatial alignment requirement.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use half::f16;
use ndarray::{Array4, ArrayD};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::InferenceConfig;

/// Metadata shipped next to the weights as `model.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelManifest {
    /// Graph input key. The historical artifact names its input "test".
    pub input_name: String,
    pub output_name: String,
    /// Spatial dimensions must be multiples of this before execution.
    /// Alignment padding is mirror padding, so only 1 or 2 are satisfiable.
    pub pad_align: u32,
    pub description: String,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            input_name: "test".to_string(),
            output_name: "output".to_string(),
            pad_align: 2,
            description: String::new(),
        }
    }
}

impl ModelManifest {
    /// Load the manifest, falling back to defaults when the artifact ships
    /// without one.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no model manifest, using defaults");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model manifest: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse model manifest: {}", path.display()))
    }
}

/// A loaded image-to-image generator.
///
/// Exclusively owned by the call that loaded it and released when it goes
/// out of scope; nothing caches sessions across generations.
pub struct GenerativeModel {
    session: Session,
    manifest: ModelManifest,
}

impl GenerativeModel {
    pub fn load(
        weights_path: &Path,
        manifest: ModelManifest,
        inference: &InferenceConfig,
    ) -> Result<Self> {
        let mut builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        if inference.intra_threads > 0 {
            builder = builder.with_intra_threads(inference.intra_threads)?;
        }

        let session = builder
            .commit_from_file(weights_path)
            .with_context(|| format!("failed to load model: {}", weights_path.display()))?;

        info!(path = %weights_path.display(), "model loaded");
        Ok(Self { session, manifest })
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    /// Run the generator on a `[1, h, w, 3]` tensor of `[0, 1]` values.
    ///
    /// The output keeps the graph's native `[-1, 1]` range; remapping is the
    /// caller's concern. With `reduced_precision` the tensor crosses the
    /// runtime boundary as f16, trading accuracy for memory.
    pub fn execute(&mut self, input: Array4<f32>, reduced_precision: bool) -> Result<Array4<f32>> {
        let input_name = self.manifest.input_name.clone();
        let output_name = self.manifest.output_name.clone();

        let output = if reduced_precision {
            let input_f16: ArrayD<f16> = input.into_dyn().mapv(f16::from_f32);
            let input_tensor = Tensor::from_array(input_f16)?;
            let outputs = self
                .session
                .run(ort::inputs![input_name.as_str() => &input_tensor])?;
            let output_view = outputs[output_name.as_str()].try_extract_array::<f16>()?;
            output_view.mapv(f16::to_f32)
        } else {
            let input_tensor = Tensor::from_array(input.into_dyn())?;
            let outputs = self
                .session
                .run(ort::inputs![input_name.as_str() => &input_tensor])?;
            let output_view = outputs[output_name.as_str()].try_extract_array::<f32>()?;
            output_view.to_owned()
        };

        output
            .into_dimensionality::<ndarray::Ix4>()
            .context("model output is not rank 4")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults_match_the_artifact_convention() {
        let manifest = ModelManifest::default();
        assert_eq!(manifest.input_name, "test");
        assert_eq!(manifest.output_name, "output");
        assert_eq!(manifest.pad_align, 2);
    }

    #[test]
    fn manifest_load_falls_back_when_file_is_missing() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manifest = ModelManifest::load_or_default(&dir.path().join("model.json"))
            .expect("load missing manifest");
        assert_eq!(manifest, ModelManifest::default());
    }

    #[test]
    fn manifest_partial_json_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("model.json");
        fs::write(&path, r#"{"output_name": "generated"}"#).expect("write manifest");

        let manifest = ModelManifest::load_or_default(&path).expect("load manifest");
        assert_eq!(manifest.output_name, "generated");
        assert_eq!(manifest.input_name, "test");
        assert_eq!(manifest.pad_align, 2);
    }

    #[test]
    fn manifest_rejects_malformed_json() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("model.json");
        fs::write(&path, "{not json").expect("write manifest");

        let err = ModelManifest::load_or_default(&path).err().expect("should fail");
        assert!(err.to_string().contains("failed to parse model manifest"));
    }
}
