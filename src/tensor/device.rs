use std::fmt;

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory; readable by host-side code such as the legacy grouped layout builder.
    Host,
    /// Accelerator memory, identified by ordinal.
    Accelerator(usize),
}

impl Device {
    /// The default accelerator.
    pub const fn accelerator() -> Self {
        Device::Accelerator(0)
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::accelerator()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Accelerator(id) => write!(f, "accelerator:{id}"),
        }
    }
}
