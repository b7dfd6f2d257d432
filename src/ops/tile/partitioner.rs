//! Grid partitioning of the forward tile kernel.

/// Launch grid `(x, y, z)`: `x` enumerates `(query tile, value-feature tile)`
/// pairs, `y` heads, `z` batches (or sequences in group mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl GridSize {
    pub fn num_blocks(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Linear block id to `(x, y, z)`, with `x` fastest.
    pub fn block_index(&self, id: usize) -> [usize; 3] {
        [id % self.x, (id / self.x) % self.y, id / (self.x * self.y)]
    }
}

/// Coordinates of one block's work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCoord {
    pub i_tile_m: usize,
    pub i_tile_n: usize,
    pub i_nhead: usize,
    pub i_batch: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct FmhaFwdTilePartitioner {
    m0: usize,
    n1: usize,
}

impl FmhaFwdTilePartitioner {
    pub fn new(m0: usize, n1: usize) -> Self {
        Self { m0, n1 }
    }

    /// In group mode `seqlen_q` is the longest sequence; shorter ones leave the
    /// trailing blocks idle.
    pub fn grid_size(
        &self,
        batch_size: usize,
        nhead: usize,
        seqlen_q: usize,
        hdim_v: usize,
    ) -> GridSize {
        GridSize {
            x: seqlen_q.div_ceil(self.m0) * hdim_v.div_ceil(self.n1),
            y: nhead,
            z: batch_size,
        }
    }

    pub fn coord(&self, block: [usize; 3], hdim_v: usize) -> BlockCoord {
        let num_tile_n1 = hdim_v.div_ceil(self.n1).max(1);
        let i_tile_m = block[0] / num_tile_n1;
        BlockCoord {
            i_tile_m,
            i_tile_n: block[0] - i_tile_m * num_tile_n1,
            i_nhead: block[1],
            i_batch: block[2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_covers_every_tile_once() {
        let p = FmhaFwdTilePartitioner::new(128, 64);
        let grid = p.grid_size(3, 2, 300, 128);
        assert_eq!(grid, GridSize { x: 6, y: 2, z: 3 });
        let mut seen = std::collections::HashSet::new();
        for id in 0..grid.num_blocks() {
            let c = p.coord(grid.block_index(id), 128);
            assert!(c.i_tile_m < 3 && c.i_tile_n < 2 && c.i_nhead < 2 && c.i_batch < 3);
            assert!(seen.insert((c.i_tile_m, c.i_tile_n, c.i_nhead, c.i_batch)));
        }
        assert_eq!(seen.len(), 36);
    }
}
