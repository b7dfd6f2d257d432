//! Parity of the fused attention kernels against a dense f64 reference.

pub mod helpers;

#[cfg(not(feature = "disable-backward"))]
pub mod backward;
pub mod forward;
pub mod grouped;
