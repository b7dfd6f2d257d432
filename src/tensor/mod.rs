//! Strided, typed device arrays.
//!
//! A small stand-in for a host tensor framework: enough to hold framework-owned
//! memory, describe strided views over it, and hand raw device addresses to the
//! kernel layer. Storage is shared (`Arc`) so views, aliases and in-flight kernel
//! jobs all keep the same allocation alive.

mod device;
mod dtype;
mod storage;
#[allow(clippy::module_inception)]
mod tensor;

pub use device::Device;
pub use dtype::{DType, Element};
pub use storage::{DevicePtr, Storage};
pub use tensor::Tensor;

pub(crate) use dtype::{read_f32, read_i32, write_f32};
