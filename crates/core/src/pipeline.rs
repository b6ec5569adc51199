//! Image generation pipeline: decode → resize → model execution → render.
//!
//! One pipeline drives one generation at a time. Telemetry (progress and
//! bytes used) is exposed through a shared handle the host polls; every
//! pipeline owns its own handle, so independent pipelines never interfere.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use ndarray::{s, Array4};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::model::{GenerativeModel, ModelManifest};
use crate::ops::mirror_pad::PadSpec;
use crate::ops::{register_builtin_ops, OpContext, OpRegistry};
use crate::progress::TelemetryHandle;
use crate::tensor::{image_to_tensor, remap_generator_output, scaled_size, tensor_to_image};

/// How often the run monitor advances the progress estimate while the
/// session executes. The runtime reports no per-node completions, so this
/// tick is the fallback driver for the estimator's trace table.
const PROGRESS_TICK: Duration = Duration::from_millis(600);

/// Resize bucket selected by the host before generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeBucket {
    Small,
    Medium,
    Large,
    /// Keep the original resolution.
    #[default]
    None,
}

impl ResizeBucket {
    /// Parse the host's selector. The mapping is exact and case-sensitive:
    /// any value other than "s"/"m"/"l" keeps the original resolution.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "s" => Self::Small,
            "m" => Self::Medium,
            "l" => Self::Large,
            _ => Self::None,
        }
    }

    /// Target size for the image's larger dimension, if any.
    pub fn target_long_side(&self) -> Option<u32> {
        match self {
            Self::Small => Some(100),
            Self::Medium => Some(250),
            Self::Large => Some(500),
            Self::None => None,
        }
    }
}

impl std::fmt::Display for ResizeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
            Self::None => write!(f, "none"),
        }
    }
}

pub struct Pipeline {
    data_dir: PathBuf,
    config: AppConfig,
    registry: OpRegistry,
    telemetry: TelemetryHandle,
}

impl Pipeline {
    pub fn new(data_dir: PathBuf, config: AppConfig) -> Self {
        let mut registry = OpRegistry::new();
        register_builtin_ops(&mut registry);

        Self {
            data_dir,
            config,
            registry,
            telemetry: TelemetryHandle::new(),
        }
    }

    /// Handle the host polls for progress and memory readouts.
    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry.clone()
    }

    /// Load the model once and release it, forcing one-time compilation and
    /// weight-upload costs to happen before the first real generation.
    pub async fn preheat(&self) -> Result<()> {
        let manifest = ModelManifest::load_or_default(
            &self.config.model_manifest_path(&self.data_dir),
        )?;
        let weights_path = self.config.model_weights_path(&self.data_dir);
        let inference = self.config.inference.clone();

        let model = tokio::task::spawn_blocking(move || {
            GenerativeModel::load(&weights_path, manifest, &inference)
        })
        .await
        .context("model load task panicked")??;

        info!("preheat complete");
        drop(model);
        Ok(())
    }

    /// Generate a stylized image from `input_path` and write it to
    /// `output_path`.
    ///
    /// Any failure aborts the whole generation and nothing is written; the
    /// caller retries by invoking the pipeline again, which also resets the
    /// telemetry readouts.
    pub async fn generate(
        &self,
        bucket: ResizeBucket,
        reduced_precision: bool,
        input_path: &Path,
        output_path: &Path,
    ) -> Result<()> {
        self.telemetry.reset();
        info!(
            resize = %bucket,
            reduced_precision,
            input = %input_path.display(),
            "generation start"
        );

        let manifest = ModelManifest::load_or_default(
            &self.config.model_manifest_path(&self.data_dir),
        )?;
        let weights_path = self.config.model_weights_path(&self.data_dir);
        let inference = self.config.inference.clone();
        let model = tokio::task::spawn_blocking(move || {
            GenerativeModel::load(&weights_path, manifest, &inference)
        })
        .await
        .context("model load task panicked")??;

        let img = image::open(input_path)
            .with_context(|| format!("failed to decode input image: {}", input_path.display()))?
            .to_rgb8();
        let (orig_w, orig_h) = img.dimensions();
        debug!(width = orig_w, height = orig_h, "original image size");

        let img = match bucket.target_long_side() {
            Some(target) => {
                let (w, h) = scaled_size(orig_w, orig_h, target);
                debug!(width = w, height = h, "scaling to resize bucket");
                image::imageops::resize(&img, w, h, FilterType::Triangle)
            }
            None => img,
        };
        let (w, h) = img.dimensions();

        let input = image_to_tensor(&img);
        self.telemetry
            .set_bytes_used((input.len() * std::mem::size_of::<f32>()) as u64);

        let ctx = OpContext::new(self.telemetry.clone());
        let pad = alignment_pad_spec(h as usize, w as usize, model.manifest().pad_align)?;
        let input = match pad {
            Some(spec) => {
                let op = self.registry.get("MirrorPad")?;
                let padded = op.apply(input.into_dyn(), &pad_attrs(&spec), &ctx)?;
                padded
                    .into_dimensionality::<ndarray::Ix4>()
                    .context("padded input is not rank 4")?
            }
            None => input,
        };
        let (padded_h, padded_w) = (input.shape()[1], input.shape()[2]);

        let started = Instant::now();
        let output = run_with_progress_monitor(model, input, reduced_precision, &ctx).await?;
        info!(
            elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
            "image generated"
        );

        let output = crop_alignment(output, h as usize, w as usize, padded_h, padded_w);
        self.telemetry
            .set_bytes_used((output.len() * std::mem::size_of::<f32>()) as u64);

        let output = remap_generator_output(output);
        let rendered = tensor_to_image(&output)?;
        rendered
            .save(output_path)
            .with_context(|| format!("failed to write output image: {}", output_path.display()))?;

        self.telemetry.set_progress(1.0);
        info!(output = %output_path.display(), "generation complete");
        Ok(())
    }
}

/// Execute the model on a blocking thread while a monitor thread advances
/// the progress estimate at a fixed interval.
async fn run_with_progress_monitor(
    mut model: GenerativeModel,
    input: Array4<f32>,
    reduced_precision: bool,
    ctx: &OpContext,
) -> Result<Array4<f32>> {
    let (stop_tx, stop_rx) = channel::<()>();
    let estimator = ctx.estimator.clone();
    let telemetry = ctx.telemetry.clone();

    let monitor = thread::spawn(move || loop {
        match stop_rx.recv_timeout(PROGRESS_TICK) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let estimate = estimator
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .next();
                telemetry.set_progress(estimate);
            }
        }
    });

    let run_result =
        tokio::task::spawn_blocking(move || model.execute(input, reduced_precision)).await;

    let _ = stop_tx.send(());
    let _ = monitor.join();

    run_result.context("model execution task panicked")?
}

/// Pad spec aligning spatial dimensions to `pad_align` multiples.
///
/// Mirror padding caps pad amounts at 1 per side, so only alignments of 1
/// (never pad) and 2 (pad odd dimensions by one on the far side) are
/// satisfiable. Returns `None` when no padding is needed.
pub fn alignment_pad_spec(h: usize, w: usize, pad_align: u32) -> Result<Option<PadSpec>> {
    let align = pad_align.max(1) as usize;
    let pad_h = (align - h % align) % align;
    let pad_w = (align - w % align) % align;

    if pad_h == 0 && pad_w == 0 {
        return Ok(None);
    }
    if pad_h > 1 || pad_w > 1 {
        bail!(
            "pad_align {align} cannot be satisfied by mirror padding for a {w}x{h} input"
        );
    }

    Ok(Some([[0, 0], [0, pad_h], [0, pad_w], [0, 0]]))
}

fn pad_attrs(spec: &PadSpec) -> std::collections::HashMap<String, serde_json::Value> {
    let mut attrs = std::collections::HashMap::new();
    attrs.insert("mode".to_string(), serde_json::json!("reflect"));
    attrs.insert("paddings".to_string(), serde_json::json!(spec));
    attrs
}

/// Undo alignment padding on a same-resolution output. Models that change
/// resolution pass through untouched.
fn crop_alignment(
    output: Array4<f32>,
    h: usize,
    w: usize,
    padded_h: usize,
    padded_w: usize,
) -> Array4<f32> {
    let shape = output.shape();
    if (padded_h, padded_w) != (h, w) && shape[1] == padded_h && shape[2] == padded_w {
        output.slice(s![.., ..h, ..w, ..]).to_owned()
    } else {
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn resize_bucket_mapping_matches_host_selectors() {
        assert_eq!(ResizeBucket::from_str_lossy("s"), ResizeBucket::Small);
        assert_eq!(ResizeBucket::from_str_lossy("m"), ResizeBucket::Medium);
        assert_eq!(ResizeBucket::from_str_lossy("l"), ResizeBucket::Large);
        assert_eq!(ResizeBucket::from_str_lossy("xl"), ResizeBucket::None);
        assert_eq!(ResizeBucket::from_str_lossy(""), ResizeBucket::None);

        assert_eq!(ResizeBucket::Small.target_long_side(), Some(100));
        assert_eq!(ResizeBucket::Medium.target_long_side(), Some(250));
        assert_eq!(ResizeBucket::Large.target_long_side(), Some(500));
        assert_eq!(ResizeBucket::None.target_long_side(), None);
    }

    #[test]
    fn resize_bucket_aliases_and_case_variants_keep_original_resolution() {
        for selector in ["small", "medium", "large", "S", "M", "L", "LARGE", " s"] {
            assert_eq!(
                ResizeBucket::from_str_lossy(selector),
                ResizeBucket::None,
                "selector {selector:?} must not resize"
            );
        }
    }

    #[test]
    fn alignment_pad_spec_pads_odd_dimensions_on_the_far_side() {
        let spec = alignment_pad_spec(5, 8, 2).expect("valid align").expect("needs pad");
        assert_eq!(spec, [[0, 0], [0, 1], [0, 0], [0, 0]]);

        let spec = alignment_pad_spec(4, 7, 2).expect("valid align").expect("needs pad");
        assert_eq!(spec, [[0, 0], [0, 0], [0, 1], [0, 0]]);
    }

    #[test]
    fn alignment_pad_spec_is_none_when_already_aligned() {
        assert_eq!(alignment_pad_spec(4, 8, 2).expect("valid align"), None);
        assert_eq!(alignment_pad_spec(5, 7, 1).expect("valid align"), None);
        assert_eq!(alignment_pad_spec(5, 7, 0).expect("valid align"), None);
    }

    #[test]
    fn alignment_pad_spec_rejects_unsatisfiable_alignments() {
        let err = alignment_pad_spec(5, 8, 4).err().expect("should fail");
        assert!(err.to_string().contains("cannot be satisfied"));
    }

    #[test]
    fn pad_attrs_carry_reflect_mode_and_spec() {
        let spec: PadSpec = [[0, 0], [0, 1], [0, 1], [0, 0]];
        let attrs = pad_attrs(&spec);
        assert_eq!(attrs["mode"], serde_json::json!("reflect"));
        assert_eq!(
            attrs["paddings"],
            serde_json::json!([[0, 0], [0, 1], [0, 1], [0, 0]])
        );
    }

    #[test]
    fn crop_alignment_restores_pre_pad_dimensions() {
        let output = Array4::<f32>::zeros((1, 6, 8, 3));
        let cropped = crop_alignment(output, 5, 8, 6, 8);
        assert_eq!(cropped.shape(), &[1, 5, 8, 3]);
    }

    #[test]
    fn crop_alignment_leaves_resolution_changing_output_alone() {
        // A 2x-upscaling model: output dims are neither padded nor original.
        let output = Array4::<f32>::zeros((1, 12, 16, 3));
        let untouched = crop_alignment(output, 5, 8, 6, 8);
        assert_eq!(untouched.shape(), &[1, 12, 16, 3]);
    }

    #[test]
    fn pipeline_exposes_a_shared_telemetry_handle() {
        let pipeline = Pipeline::new(PathBuf::from("data"), AppConfig::default());
        let handle = pipeline.telemetry();
        pipeline.telemetry.set_progress(0.25);
        assert_eq!(handle.snapshot().progress, 0.25);
    }
}
