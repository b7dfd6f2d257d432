//! Attention mask geometry.
//!
//! A mask is stored as the `(y, x)` extents of a band around the diagonal: query
//! row `i` may attend to key columns in `[i + 1 - y, i + x)`, clipped to the key
//! length. Causal masks drop the lower bound; unmasked attention only clips to
//! the key length.

use crate::ops::dispatch::CustomMaskType;

/// Band coordinates `(y, x)` for a window of `left` keys before and `right` keys
/// after the diagonal. Negative half-widths are unbounded. With `is_top_left` the
/// diagonal starts at `(0, 0)`; otherwise it ends at `(y_total - 1, x_total - 1)`.
pub fn coordinates_from_lr_window(
    left: isize,
    right: isize,
    y_total: isize,
    x_total: isize,
    is_top_left: bool,
) -> (isize, isize) {
    let left_unbounded = if is_top_left { y_total - 1 } else { x_total - 1 };
    let right_unbounded = if is_top_left { x_total - 1 } else { y_total - 1 };
    let left = if left < 0 { left_unbounded } else { left };
    let right = if right < 0 { right_unbounded } else { right };
    let x_shift = if is_top_left { 0 } else { x_total - y_total };
    let y_shift = if is_top_left { 0 } else { y_total - x_total };
    (left + 1 + y_shift, 1 + right + x_shift)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericAttentionMask {
    masking: bool,
    local: bool,
    y: isize,
    x: isize,
    x_total: isize,
}

impl GenericAttentionMask {
    /// Only clips to the key length.
    pub fn no_mask(x_total: usize) -> Self {
        Self {
            masking: false,
            local: false,
            y: 0,
            x: 0,
            x_total: x_total as isize,
        }
    }

    pub fn from_lr_window(
        left: isize,
        right: isize,
        y_total: usize,
        x_total: usize,
        is_top_left: bool,
        local: bool,
    ) -> Self {
        let (y_total, x_total) = (y_total as isize, x_total as isize);
        let (y, x) = coordinates_from_lr_window(left, right, y_total, x_total, is_top_left);
        Self {
            masking: true,
            local,
            y,
            x,
            x_total,
        }
    }

    /// The mask a launch with `(mask_type, window_size)` applies to a
    /// `seqlen_q × seqlen_k` problem.
    pub fn from_mask_type(
        mask_type: CustomMaskType,
        window_size: usize,
        seqlen_q: usize,
        seqlen_k: usize,
    ) -> Self {
        if window_size > 0 {
            let half = (window_size / 2) as isize;
            let (left, right, top_left) = match mask_type {
                CustomMaskType::NoMask => (half, half, true),
                CustomMaskType::CausalFromTopLeft => (half, 0, true),
                CustomMaskType::CausalFromBottomRight => (half, 0, false),
            };
            return Self::from_lr_window(left, right, seqlen_q, seqlen_k, top_left, true);
        }
        match mask_type {
            CustomMaskType::NoMask => Self::no_mask(seqlen_k),
            CustomMaskType::CausalFromTopLeft => {
                Self::from_lr_window(-1, 0, seqlen_q, seqlen_k, true, false)
            }
            CustomMaskType::CausalFromBottomRight => {
                Self::from_lr_window(-1, 0, seqlen_q, seqlen_k, false, false)
            }
        }
    }

    pub fn is_masking(&self) -> bool {
        self.masking
    }

    /// Whether `(i_y, i_x)` is excluded.
    #[inline]
    pub fn is_out_of_bound(&self, i_y: usize, i_x: usize) -> bool {
        let (i_y, i_x) = (i_y as isize, i_x as isize);
        if !self.masking {
            return i_x >= self.x_total;
        }
        let x_start = -self.y + i_y + 1;
        let x_end = (i_y + self.x).min(self.x_total);
        if self.local {
            i_x < x_start || i_x >= x_end
        } else {
            i_x >= x_end
        }
    }

    /// Key range `[start, end)` a query tile of `y_tile` rows starting at `i_y` has
    /// to visit. `start` is aligned down to `x_tile`; an empty range means every
    /// row of the tile is fully masked.
    pub fn tile_range_along_x(&self, i_y: usize, y_tile: usize, x_tile: usize) -> (usize, usize) {
        if !self.masking {
            return (0, self.x_total.max(0) as usize);
        }
        let i_y = i_y as isize;
        let start = if self.local {
            let s = (-self.y + i_y + 1).max(0) as usize;
            (s / x_tile) * x_tile
        } else {
            0
        };
        let end = (i_y + y_tile as isize - 1 + self.x).min(self.x_total).max(0) as usize;
        (start.min(end), end)
    }

    /// Whether any element of the `y_tile × x_tile` tile at `(i_y, i_x)` is visible.
    pub fn tile_has_visible(&self, i_y: usize, i_x: usize, y_tile: usize, x_tile: usize) -> bool {
        let (start, end) = self.tile_range_along_x(i_y, y_tile, x_tile);
        i_x + x_tile > start && i_x < end
    }
}
