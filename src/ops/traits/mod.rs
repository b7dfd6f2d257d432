pub mod attention;

pub use attention::MemoryEfficientAttentionOps;
