//! Process-wide fmha configuration.
//!
//! The environment is read once, either by [`FmhaConfig::global`] or explicitly via
//! [`FmhaConfig::from_env`], and the resulting value is carried by each
//! [`crate::FmhaClient`]. Kernels never consult the environment themselves.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Environment variable enabling 32-bit accumulation of query/key/value gradients.
pub const ENV_USE_FP32_QKV_GRAD: &str = "USE_FP32_QKV_GRAD";
/// Environment variable choosing the inference pipeline (`auto`, `tiled`, `device_op`).
pub const ENV_INFER_PIPELINE: &str = "FMHA_INFER_PIPELINE";

/// Which implementation serves inference calls (no log-sum-exp, no dropout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferPipeline {
    /// Tile pipeline when the head dims have a tile instance, device op otherwise.
    #[default]
    Auto,
    /// Always the tile pipeline; unsupported head dims fail.
    Tiled,
    /// Always the GEMM-based device op.
    DeviceOp,
}

impl InferPipeline {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(InferPipeline::Auto),
            "tiled" | "tile" => Some(InferPipeline::Tiled),
            "device_op" | "deviceop" | "legacy" => Some(InferPipeline::DeviceOp),
            _ => None,
        }
    }
}

/// fmha configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FmhaConfig {
    /// Accumulate Q/K/V gradients in f32 buffers and cast back afterwards.
    pub use_fp32_qkv_grad: bool,
    /// Pipeline serving inference calls; see [`InferPipeline`].
    pub infer_pipeline: InferPipeline,
    /// Log per-launch wall time at debug level.
    pub time_kernel: bool,
}

impl Default for FmhaConfig {
    fn default() -> Self {
        Self {
            use_fp32_qkv_grad: false,
            infer_pipeline: InferPipeline::Auto,
            time_kernel: false,
        }
    }
}

impl FmhaConfig {
    /// Set [`use_fp32_qkv_grad`](Self::use_fp32_qkv_grad).
    pub fn with_fp32_qkv_grad(mut self, enabled: bool) -> Self {
        self.use_fp32_qkv_grad = enabled;
        self
    }

    /// Set [`infer_pipeline`](Self::infer_pipeline).
    pub fn with_infer_pipeline(mut self, pipeline: InferPipeline) -> Self {
        self.infer_pipeline = pipeline;
        self
    }

    /// Set [`time_kernel`](Self::time_kernel).
    pub fn with_time_kernel(mut self, enabled: bool) -> Self {
        self.time_kernel = enabled;
        self
    }

    /// Read the environment now.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unparsable values keep the default
    /// and are reported at warn level.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_USE_FP32_QKV_GRAD) {
            match raw.trim().parse::<i64>() {
                Ok(v) => config.use_fp32_qkv_grad = v > 0,
                Err(_) => tracing::warn!(
                    var = ENV_USE_FP32_QKV_GRAD,
                    value = %raw,
                    "expected an integer, ignoring"
                ),
            }
        }
        if let Some(raw) = lookup(ENV_INFER_PIPELINE) {
            match InferPipeline::parse(&raw) {
                Some(p) => config.infer_pipeline = p,
                None => tracing::warn!(
                    var = ENV_INFER_PIPELINE,
                    value = %raw,
                    "expected auto, tiled or device_op, ignoring"
                ),
            }
        }
        config
    }

    /// The process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static FmhaConfig {
        static GLOBAL: OnceLock<FmhaConfig> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = Self::from_env();
            tracing::debug!(?config, "fmha configuration initialized");
            config
        })
    }
}
