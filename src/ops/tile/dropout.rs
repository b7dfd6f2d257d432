//! Counter-based dropout.
//!
//! Every `(batch-or-sequence, head, query row, key column)` element draws its own
//! Philox4x32-10 output, so forward and backward regenerate the identical mask from
//! `(seed, offset)` alone, in any block order.

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;

#[inline]
fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let product = a as u64 * b as u64;
    ((product >> 32) as u32, product as u32)
}

/// Ten rounds of Philox4x32.
pub fn philox4x32_10(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut c = counter;
    let mut k = key;
    for round in 0..10 {
        if round > 0 {
            k[0] = k[0].wrapping_add(PHILOX_W0);
            k[1] = k[1].wrapping_add(PHILOX_W1);
        }
        let (hi0, lo0) = mulhilo(PHILOX_M0, c[0]);
        let (hi1, lo1) = mulhilo(PHILOX_M1, c[2]);
        c = [hi1 ^ c[1] ^ k[0], lo1, hi0 ^ c[3] ^ k[1], lo0];
    }
    c
}

/// Uniform in `[0, 1)` from the top 24 bits.
#[inline]
fn to_uniform(bits: u32) -> f32 {
    (bits >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockDropout {
    p_drop: f32,
    rp_undrop: f32,
    key: [u32; 2],
    offset: u64,
}

impl BlockDropout {
    pub fn new(p_drop: f32, seed: u64, offset: u64) -> Self {
        Self {
            p_drop,
            rp_undrop: 1.0 / (1.0 - p_drop),
            key: [seed as u32, (seed >> 32) as u32],
            offset,
        }
    }

    /// The random value of one attention-matrix element.
    pub fn random_value(&self, batch: usize, head: usize, row: usize, col: usize) -> f32 {
        let counter = [
            col as u32,
            row as u32,
            (head as u32).wrapping_add(self.offset as u32),
            (batch as u32).wrapping_add((self.offset >> 32) as u32),
        ];
        to_uniform(philox4x32_10(counter, self.key)[0])
    }

    /// Multiplier applied to the probability: `1 / (1 - p)` when kept, else 0.
    #[inline]
    pub fn factor(&self, batch: usize, head: usize, row: usize, col: usize) -> f32 {
        if self.random_value(batch, head, row, col) >= self.p_drop {
            self.rp_undrop
        } else {
            0.0
        }
    }
}

/// Dropout state bound to one `(batch-or-sequence, head)` pair.
#[derive(Debug, Clone, Copy)]
pub struct DropoutCoords {
    pub dropout: BlockDropout,
    pub batch: usize,
    pub head: usize,
}

impl DropoutCoords {
    #[inline]
    pub fn factor(&self, row: usize, col: usize) -> f32 {
        self.dropout.factor(self.batch, self.head, row, col)
    }
}
