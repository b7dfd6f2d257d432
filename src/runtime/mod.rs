//! Execution runtime: streams, launch configuration, scratch memory and the
//! client handle.

mod client;
mod memory;
mod stream;

pub use client::FmhaClient;
pub(crate) use memory::ReadSet;
pub use memory::SimpleDeviceMem;
pub use stream::{Stream, StreamConfig};
