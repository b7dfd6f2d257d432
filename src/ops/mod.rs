pub mod client;
pub mod device_op;
pub mod dispatch;
pub mod fmha;
pub mod layout;
pub mod params;
pub mod tile;
pub mod traits;

pub use fmha::{
    efficient_attention_backward, efficient_attention_forward, efficient_attention_forward_decoder,
    BackwardOptions, BackwardOutput, ForwardOptions, ForwardOutput,
};
pub use traits::MemoryEfficientAttentionOps;
