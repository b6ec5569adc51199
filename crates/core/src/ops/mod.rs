//! Custom tensor operators layered on top of the inference runtime.
//!
//! The runtime executes the serialized graph; anything the graph needs that
//! the runtime does not provide is registered here by op type and applied by
//! the pipeline. Operator attributes travel as loose JSON values, matching
//! how they appear in graph descriptors.

pub mod mirror_pad;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use ndarray::ArrayD;

use crate::progress::{ProgressEstimator, TelemetryHandle};

/// Shared state an operator invocation can observe.
///
/// Operator invocations are the only instrumented hook inside a model run,
/// so the progress estimator and the telemetry readouts ride along here.
pub struct OpContext {
    pub telemetry: TelemetryHandle,
    pub estimator: Arc<Mutex<ProgressEstimator>>,
}

impl OpContext {
    pub fn new(telemetry: TelemetryHandle) -> Self {
        Self {
            telemetry,
            estimator: Arc::new(Mutex::new(ProgressEstimator::new())),
        }
    }
}

/// A host-side tensor operator keyed by graph op type.
pub trait TensorOp: Send + Sync {
    fn op_type(&self) -> &str;

    fn apply(
        &self,
        input: ArrayD<f32>,
        attrs: &HashMap<String, serde_json::Value>,
        ctx: &OpContext,
    ) -> Result<ArrayD<f32>>;
}

pub struct OpRegistry {
    ops: HashMap<String, Arc<dyn TensorOp>>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }

    pub fn register(&mut self, op: Arc<dyn TensorOp>) {
        self.ops.insert(op.op_type().to_string(), op);
    }

    pub fn get(&self, op_type: &str) -> Result<Arc<dyn TensorOp>> {
        self.ops
            .get(op_type)
            .cloned()
            .ok_or_else(|| anyhow!("unknown op type: {op_type}"))
    }

    pub fn list_op_types(&self) -> Vec<&str> {
        let mut op_types: Vec<&str> = self.ops.keys().map(|v| v.as_str()).collect();
        op_types.sort_unstable();
        op_types
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every built-in operator from this crate.
pub fn register_builtin_ops(registry: &mut OpRegistry) {
    registry.register(Arc::new(mirror_pad::MirrorPadOp));
}
