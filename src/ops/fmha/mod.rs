//! Operator entry points: forward, backward and decoder forward.
//!
//! Each entry point validates its inputs, allocates outputs, packs a parameter
//! struct and hands it to [`crate::ops::dispatch`]. Nothing here touches tensor
//! data; all device work is queued on the caller's stream.

pub mod backward;
pub mod decoder;
pub mod forward;
pub mod reduce;
pub mod validate;

pub use backward::{efficient_attention_backward, BackwardOptions, BackwardOutput};
pub use decoder::{efficient_attention_forward_decoder, DECODER_MAX_K, DECODER_MAX_PADDING};
pub use forward::{efficient_attention_forward, ForwardOptions, ForwardOutput};
pub use validate::AttentionDims;
