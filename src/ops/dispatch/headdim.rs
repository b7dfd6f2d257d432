//! Head-dim bucketing and memory-transfer vector width selection.

use crate::error::{Error, Result};

/// A-matrix (Q) K1 slice per thread: `AK1 / ABlockTransferThreadClusterLengths_K1`.
const AB_THREAD_SLICE_K1: usize = 8;
/// Threads along Gemm1-N in the B1 (V) block transfer cluster.
const B1_CLUSTER_N: usize = 16;
/// Threads along N in the C-shuffle block transfer cluster.
const CSHUFFLE_CLUSTER_N: usize = 8;

pub const AB_MAX_VECTOR: usize = 8;
pub const C_SHUFFLE_MAX_VECTOR: usize = 4;
/// B1 vector cap for the grouped device ops.
pub const B1_MAX_VECTOR_GROUPED: usize = 2;
/// B1 vector cap for the batched device ops.
pub const B1_MAX_VECTOR_BATCHED: usize = 4;

/// Head-dim bucket of the GEMM-based device ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadDimBucket {
    D32,
    D64,
    D128,
}

impl HeadDimBucket {
    pub const ALL: [HeadDimBucket; 3] = [
        HeadDimBucket::D32,
        HeadDimBucket::D64,
        HeadDimBucket::D128,
    ];

    /// Both `K` and `Kv` have to fit the bucket; anything above 64 is served by the
    /// general 128 configuration, which tiles wider heads.
    pub fn select(k: usize, kv: usize) -> Self {
        if k <= 32 && kv <= 32 {
            HeadDimBucket::D32
        } else if k <= 64 && kv <= 64 {
            HeadDimBucket::D64
        } else {
            HeadDimBucket::D128
        }
    }

    pub const fn gemm1_n_per_block(self) -> usize {
        match self {
            HeadDimBucket::D32 => 32,
            HeadDimBucket::D64 => 64,
            HeadDimBucket::D128 => 128,
        }
    }

    pub const fn gemm1_n_xdl_per_wave(self) -> usize {
        match self {
            HeadDimBucket::D32 => 1,
            HeadDimBucket::D64 => 2,
            HeadDimBucket::D128 => 4,
        }
    }

    pub const fn cshuffle_n_xdl_per_wave_per_shuffle(self) -> usize {
        match self {
            HeadDimBucket::D32 => 1,
            HeadDimBucket::D64 => 2,
            HeadDimBucket::D128 => 4,
        }
    }

    /// Largest vector the B1 (V) transfer may use, before alignment.
    pub fn b1_max_vector(self, cap: usize) -> usize {
        cap.min(self.gemm1_n_per_block() / B1_CLUSTER_N)
    }

    /// Largest vector the C-shuffle (output) transfer may use, before alignment.
    pub fn c_shuffle_max_vector(self) -> usize {
        let slice = self.cshuffle_n_xdl_per_wave_per_shuffle() * self.gemm1_n_per_block()
            / self.gemm1_n_xdl_per_wave()
            / CSHUFFLE_CLUSTER_N;
        C_SHUFFLE_MAX_VECTOR.min(slice)
    }
}

/// Vector widths (in elements) of the three block transfers that share alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferVectors {
    /// Q and K loads along the head dim.
    pub ab: usize,
    /// V loads along the value head dim.
    pub b1: usize,
    /// Output stores along the value head dim.
    pub c_shuffle: usize,
}

impl TransferVectors {
    /// All-scalar transfers; always feasible.
    pub const SCALAR: TransferVectors = TransferVectors {
        ab: 1,
        b1: 1,
        c_shuffle: 1,
    };
}

/// Widest width in `{max, max/2, max/4, .., 1}` that divides `length`.
pub fn align_switch(max: usize, length: usize) -> usize {
    let mut width = max.max(1);
    while width > 1 && length % width != 0 {
        width /= 2;
    }
    width
}

/// Pick vector widths for a problem with head dims `(k, kv)`.
///
/// B1 and C-shuffle both move `Kv`-wide rows, so whichever stage has the larger cap
/// is aligned against `Kv` first and the other takes the minimum of its own cap and
/// that width.
pub fn select_transfer_vectors(
    bucket: HeadDimBucket,
    k: usize,
    kv: usize,
    b1_cap: usize,
) -> TransferVectors {
    let ab_max = AB_MAX_VECTOR.min(AB_THREAD_SLICE_K1);
    let b1_max = bucket.b1_max_vector(b1_cap);
    let c_max = bucket.c_shuffle_max_vector();
    let ab = align_switch(ab_max, k);
    if b1_max >= c_max {
        let b1 = align_switch(b1_max, kv);
        TransferVectors {
            ab,
            b1,
            c_shuffle: b1.min(c_max),
        }
    } else {
        let c_shuffle = align_switch(c_max, kv);
        TransferVectors {
            ab,
            b1: c_shuffle.min(b1_max),
            c_shuffle,
        }
    }
}

/// Head-dim instances of the tile pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileHeadDim {
    Hdim64,
    Hdim128,
}

impl TileHeadDim {
    pub fn select(k: usize, kv: usize) -> Result<Self> {
        match (k, kv) {
            (64, 64) => Ok(TileHeadDim::Hdim64),
            (128, 128) => Ok(TileHeadDim::Hdim128),
            _ => Err(Error::UnmappedDispatchValue {
                what: "Head-dim sizes not supported!",
                value: format!("K={k}, Kv={kv}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bucket_thresholds() {
        assert_eq!(HeadDimBucket::select(32, 32), HeadDimBucket::D32);
        assert_eq!(HeadDimBucket::select(32, 33), HeadDimBucket::D64);
        assert_eq!(HeadDimBucket::select(64, 8), HeadDimBucket::D64);
        assert_eq!(HeadDimBucket::select(65, 64), HeadDimBucket::D128);
        assert_eq!(HeadDimBucket::select(256, 256), HeadDimBucket::D128);
    }

    #[test]
    fn test_stage_caps() {
        assert_eq!(HeadDimBucket::D32.b1_max_vector(B1_MAX_VECTOR_GROUPED), 2);
        assert_eq!(HeadDimBucket::D32.b1_max_vector(B1_MAX_VECTOR_BATCHED), 2);
        assert_eq!(HeadDimBucket::D128.b1_max_vector(B1_MAX_VECTOR_BATCHED), 4);
        for bucket in HeadDimBucket::ALL {
            assert_eq!(bucket.c_shuffle_max_vector(), 4);
        }
    }

    #[test]
    fn test_align_switch() {
        assert_eq!(align_switch(8, 64), 8);
        assert_eq!(align_switch(8, 36), 4);
        assert_eq!(align_switch(8, 6), 2);
        assert_eq!(align_switch(8, 7), 1);
        assert_eq!(align_switch(4, 0), 4);
    }

    #[test]
    fn test_chain_of_minimums() {
        // grouped, bucket 128: b1 cap 2 < c cap 4, so C aligns first
        let v = select_transfer_vectors(HeadDimBucket::D128, 128, 100, B1_MAX_VECTOR_GROUPED);
        assert_eq!(v, TransferVectors { ab: 8, b1: 2, c_shuffle: 4 });
        // batched, bucket 128: b1 cap 4 == c cap 4, so B1 aligns first
        let v = select_transfer_vectors(HeadDimBucket::D128, 96, 98, B1_MAX_VECTOR_BATCHED);
        assert_eq!(v, TransferVectors { ab: 8, b1: 2, c_shuffle: 2 });
    }

    #[test]
    fn test_tile_head_dims() {
        assert_eq!(TileHeadDim::select(64, 64).unwrap(), TileHeadDim::Hdim64);
        assert_eq!(TileHeadDim::select(128, 128).unwrap(), TileHeadDim::Hdim128);
        let err = TileHeadDim::select(64, 128).unwrap_err();
        assert!(err.to_string().contains("Head-dim sizes not supported!"));
        assert!(TileHeadDim::select(32, 32).is_err());
    }

    proptest! {
        #[test]
        fn prop_vectors_divide_head_dims(
            k in 1usize..300,
            kv in 1usize..300,
            batched in any::<bool>(),
        ) {
            let cap = if batched { B1_MAX_VECTOR_BATCHED } else { B1_MAX_VECTOR_GROUPED };
            let bucket = HeadDimBucket::select(k, kv);
            let v = select_transfer_vectors(bucket, k, kv, cap);
            prop_assert_eq!(k % v.ab, 0);
            prop_assert_eq!(kv % v.b1, 0);
            prop_assert_eq!(kv % v.c_shuffle, 0);
            prop_assert!(v.b1 <= bucket.b1_max_vector(cap));
            prop_assert!(v.c_shuffle <= bucket.c_shuffle_max_vector());
            prop_assert!(v.ab <= AB_MAX_VECTOR);
        }
    }
}
