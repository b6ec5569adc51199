//! MirrorPad operator: reflect-style edge padding for rank-4 tensors.
//!
//! The converted graph pads feature maps with `MirrorPad` nodes the runtime
//! does not implement, so the op is provided here. Padding is realized by
//! slicing a 1-thick edge plane and concatenating it back onto the tensor,
//! one axis at a time. That technique caps the supported pad amount at 1 per
//! side; wider reflection would need a loop per unit of padding.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use ndarray::{concatenate, ArrayD, Axis, Slice};

use super::{OpContext, TensorOp};

/// One `[before, after]` pair per axis of a rank-4 tensor.
pub type PadSpec = [[usize; 2]; 4];

pub const RANK: usize = 4;

/// Largest pad amount the slice-and-concat technique supports per side.
pub const MAX_PAD: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadMode {
    Reflect,
}

impl PadMode {
    /// Parse a graph attribute value. The match is exact and case-sensitive;
    /// everything but "reflect" is rejected with the mode the graph asked
    /// for.
    pub fn parse(s: &str) -> Result<Self, PadError> {
        match s {
            "reflect" => Ok(Self::Reflect),
            _ => Err(PadError::UnsupportedMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PadError {
    #[error("only reflect mode is supported, got: {0}")]
    UnsupportedMode(String),

    #[error("only input of rank 4 is supported, got rank {0}")]
    UnsupportedRank(usize),

    #[error("only pad amounts of 0 or 1 are supported, got: {0:?}")]
    UnsupportedPadding(PadSpec),
}

/// Pad `input` by reflecting its edges according to `pad`.
///
/// Axes are processed in order 0..4 so padding applied to a later axis sees
/// the rows added by earlier axes. Only the final array escapes; the
/// per-axis intermediates are freed as each iteration replaces them.
pub fn mirror_pad(
    input: &ArrayD<f32>,
    pad: &PadSpec,
    mode: PadMode,
) -> Result<ArrayD<f32>, PadError> {
    // Reflect is the only mode that parses; others fail in PadMode::parse.
    let PadMode::Reflect = mode;
    if input.ndim() != RANK {
        return Err(PadError::UnsupportedRank(input.ndim()));
    }
    if pad.iter().flatten().any(|&amount| amount > MAX_PAD) {
        return Err(PadError::UnsupportedPadding(*pad));
    }

    let mut current = input.to_owned();
    for (axis, &[before, after]) in pad.iter().enumerate() {
        if before == 0 && after == 0 {
            continue;
        }

        let axis = Axis(axis);
        let len = current.len_of(axis);
        if len == 0 {
            // An empty axis has no edge plane to reflect.
            return Err(PadError::UnsupportedPadding(*pad));
        }

        let mut parts = Vec::with_capacity(3);
        if before == 1 {
            parts.push(current.slice_axis(axis, Slice::from(..1)));
        }
        parts.push(current.view());
        if after == 1 {
            parts.push(current.slice_axis(axis, Slice::from(len - 1..)));
        }

        // Edge slices match the tensor on every other axis, so the only way
        // concatenation can fail is an inconsistent pad spec.
        let padded =
            concatenate(axis, &parts).map_err(|_| PadError::UnsupportedPadding(*pad))?;
        current = padded;
    }

    Ok(current)
}

/// The registered `TensorOp` wrapper around [`mirror_pad`].
///
/// Each invocation also advances the progress estimate and refreshes the
/// bytes-used readout, this being the only hook that fires while a model
/// executes.
pub struct MirrorPadOp;

impl TensorOp for MirrorPadOp {
    fn op_type(&self) -> &str {
        "MirrorPad"
    }

    fn apply(
        &self,
        input: ArrayD<f32>,
        attrs: &HashMap<String, serde_json::Value>,
        ctx: &OpContext,
    ) -> Result<ArrayD<f32>> {
        let estimate = ctx
            .estimator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next();
        ctx.telemetry.set_progress(estimate);

        let mode_attr = attrs
            .get("mode")
            .and_then(|v| v.as_str())
            .context("MirrorPad: missing string attribute 'mode'")?;
        let mode = PadMode::parse(mode_attr)?;

        let pad = parse_pad_attr(attrs)?;
        let output = mirror_pad(&input, &pad, mode)?;

        let live_elements = input.len() + output.len();
        ctx.telemetry
            .set_bytes_used((live_elements * std::mem::size_of::<f32>()) as u64);

        Ok(output)
    }
}

fn parse_pad_attr(attrs: &HashMap<String, serde_json::Value>) -> Result<PadSpec> {
    let rows = attrs
        .get("paddings")
        .and_then(|v| v.as_array())
        .context("MirrorPad: missing array attribute 'paddings'")?;

    if rows.len() != RANK {
        bail!(
            "MirrorPad: 'paddings' must have {RANK} rows, got {}",
            rows.len()
        );
    }

    let mut pad: PadSpec = [[0, 0]; RANK];
    for (i, row) in rows.iter().enumerate() {
        let pair = row
            .as_array()
            .with_context(|| format!("MirrorPad: 'paddings' row {i} is not an array"))?;
        if pair.len() != 2 {
            bail!("MirrorPad: 'paddings' row {i} must have 2 entries");
        }
        for (j, value) in pair.iter().enumerate() {
            pad[i][j] = value
                .as_u64()
                .with_context(|| format!("MirrorPad: 'paddings'[{i}][{j}] is not a non-negative integer"))?
                as usize;
        }
    }

    Ok(pad)
}
