//! Tile-level building blocks shared by the tile kernel and the device ops.
//!
//! Everything here runs "on the device": inside a stream job, one call per
//! thread-block, over bounds-checked views of framework memory.

pub mod bwd_pipeline;
pub mod dropout;
pub mod kernel;
pub mod mask;
pub mod partitioner;
pub mod pipeline;
pub mod view;

pub use bwd_pipeline::{dot_do_o, BlockFmhaBwdPipeline, BwdBlockInputs};
pub use dropout::{BlockDropout, DropoutCoords};
pub use kernel::{
    ColumnMajor, FmhaFwdKargs, FmhaFwdKernel, FmhaShapeHdim128, FmhaShapeHdim64, RowMajor,
    TileShape, VLayout,
};
pub use mask::GenericAttentionMask;
pub use partitioner::{FmhaFwdTilePartitioner, GridSize};
pub use pipeline::{BlockFmhaPipelineQrKsVs, BlockTile, FwdBlockInputs};
pub use view::{TensorView, Tile, TileWindow, ViewDesc};
