//! Backend handle carrying the device, stream and configuration of a caller.

use super::Stream;
use crate::config::FmhaConfig;
use crate::error::Result;
use crate::tensor::Device;

/// A device plus the stream all of its work is issued on.
///
/// Clones share the stream.
#[derive(Clone)]
pub struct FmhaClient {
    device: Device,
    stream: Stream,
    config: FmhaConfig,
}

impl FmhaClient {
    /// Client on `device` using the process-wide configuration.
    pub fn new(device: Device) -> Self {
        Self::with_config(device, FmhaConfig::global().clone())
    }

    pub fn with_config(device: Device, config: FmhaConfig) -> Self {
        tracing::debug!(%device, ?config, "creating fmha client");
        Self {
            device,
            stream: Stream::new(),
            config,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn config(&self) -> &FmhaConfig {
        &self.config
    }

    /// Wait for all queued work; surfaces any device fault.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }
}

impl std::fmt::Debug for FmhaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FmhaClient")
            .field("device", &self.device)
            .field("stream", &self.stream.id())
            .field("config", &self.config)
            .finish()
    }
}
