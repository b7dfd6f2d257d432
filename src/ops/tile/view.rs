//! Tensor views, tile windows and register tiles.
//!
//! A [`ViewDesc`] is an `(origin, lengths, strides)` triple in elements. It is
//! bounds-checked against the backing buffer once, at construction of a
//! [`TensorView`]; element accesses after that cannot leave the allocation. Reads
//! past the logical lengths (into the padded region) yield zero, writes there are
//! dropped.

use crate::error::{Error, Result};
use crate::tensor::{read_i32, DType, DevicePtr, Element};
use std::marker::PhantomData;

/// Two-dimensional strided window onto a flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDesc {
    pub origin: usize,
    pub lengths: [usize; 2],
    pub strides: [usize; 2],
}

impl ViewDesc {
    pub const fn new(origin: usize, lengths: [usize; 2], strides: [usize; 2]) -> Self {
        Self {
            origin,
            lengths,
            strides,
        }
    }

    #[inline]
    pub fn offset(&self, i: usize, j: usize) -> usize {
        self.origin + i * self.strides[0] + j * self.strides[1]
    }

    pub fn is_empty(&self) -> bool {
        self.lengths[0] == 0 || self.lengths[1] == 0
    }

    /// Swap the two axes.
    pub fn transpose(self) -> Self {
        Self {
            origin: self.origin,
            lengths: [self.lengths[1], self.lengths[0]],
            strides: [self.strides[1], self.strides[0]],
        }
    }

    /// Fail with a device fault if any addressed element is at or past `capacity`.
    pub fn check(&self, capacity: usize, what: &str) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let last = self.offset(self.lengths[0] - 1, self.lengths[1] - 1);
        if last >= capacity {
            return Err(Error::DeviceFault {
                reason: format!(
                    "out-of-bounds {what} view: element {last} of {capacity} \
                     (origin {}, lengths {:?}, strides {:?})",
                    self.origin, self.lengths, self.strides
                ),
            });
        }
        Ok(())
    }

    /// Write the in-bounds part of `tile`, placed at `origin`, into `bytes`.
    /// With `accumulate`, add to the existing values instead of overwriting.
    pub fn store<T: Element>(
        &self,
        bytes: &mut [u8],
        origin: [usize; 2],
        tile: &Tile,
        accumulate: bool,
    ) {
        let rows = tile.rows().min(self.lengths[0].saturating_sub(origin[0]));
        let cols = tile.cols().min(self.lengths[1].saturating_sub(origin[1]));
        for r in 0..rows {
            for c in 0..cols {
                let at = self.offset(origin[0] + r, origin[1] + c);
                let v = if accumulate {
                    T::read(bytes, at).to_f32() + tile.get(r, c)
                } else {
                    tile.get(r, c)
                };
                T::from_f32(v).write(bytes, at);
            }
        }
    }
}

/// Element origin of `ptr`, checking that its allocation holds `T`.
pub fn typed_origin<T: Element>(ptr: &DevicePtr, what: &str) -> Result<usize> {
    let dtype = ptr.storage().dtype();
    if dtype != T::DTYPE {
        return Err(Error::DeviceFault {
            reason: format!("{what}: kernel reads {} from a {dtype} allocation", T::DTYPE),
        });
    }
    ptr.element_offset()
}

/// Entry `i` of the i32 table at `ptr`.
pub fn load_i32(bytes: &[u8], ptr: &DevicePtr, i: usize, what: &str) -> Result<i32> {
    if ptr.storage().dtype() != DType::I32 {
        return Err(Error::DeviceFault {
            reason: format!("{what}: expected an i32 table, found {}", ptr.storage().dtype()),
        });
    }
    let at = ptr.element_offset()? + i;
    if (at + 1) * 4 > bytes.len() {
        return Err(Error::DeviceFault {
            reason: format!("{what}: entry {i} is past the end of the table"),
        });
    }
    Ok(read_i32(bytes, at))
}

/// A checked view over device bytes, with optional padding of each axis up to a
/// tile multiple.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a, T: Element> {
    bytes: &'a [u8],
    desc: ViewDesc,
    padded: [usize; 2],
    _marker: PhantomData<T>,
}

impl<'a, T: Element> TensorView<'a, T> {
    pub fn new(bytes: &'a [u8], desc: ViewDesc, what: &str) -> Result<Self> {
        desc.check(bytes.len() / T::DTYPE.size_in_bytes(), what)?;
        Ok(Self {
            bytes,
            desc,
            padded: desc.lengths,
            _marker: PhantomData,
        })
    }

    /// Round the lengths selected by `need` up to multiples of `tile`.
    pub fn pad(mut self, tile: [usize; 2], need: [bool; 2]) -> Self {
        for d in 0..2 {
            if need[d] && tile[d] > 0 {
                self.padded[d] = self.desc.lengths[d].div_ceil(tile[d]) * tile[d];
            }
        }
        self
    }

    pub fn transpose(self) -> Self {
        Self {
            bytes: self.bytes,
            desc: self.desc.transpose(),
            padded: [self.padded[1], self.padded[0]],
            _marker: PhantomData,
        }
    }

    pub fn lengths(&self) -> [usize; 2] {
        self.desc.lengths
    }

    pub fn padded_lengths(&self) -> [usize; 2] {
        self.padded
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        if i < self.desc.lengths[0] && j < self.desc.lengths[1] {
            T::read(self.bytes, self.desc.offset(i, j)).to_f32()
        } else {
            0.0
        }
    }
}

/// A fixed-extent window that slides over a [`TensorView`].
#[derive(Debug, Clone, Copy)]
pub struct TileWindow<'a, T: Element> {
    view: TensorView<'a, T>,
    extent: [usize; 2],
    origin: [usize; 2],
}

impl<'a, T: Element> TileWindow<'a, T> {
    pub fn new(view: TensorView<'a, T>, extent: [usize; 2], origin: [usize; 2]) -> Self {
        Self {
            view,
            extent,
            origin,
        }
    }

    pub fn origin(&self) -> [usize; 2] {
        self.origin
    }

    pub fn move_by(&mut self, step: [usize; 2]) {
        self.origin[0] += step[0];
        self.origin[1] += step[1];
    }

    /// Copy the window into a register tile; out-of-range elements read as zero.
    pub fn load(&self) -> Tile {
        let mut tile = Tile::zeros(self.extent[0], self.extent[1]);
        for r in 0..self.extent[0] {
            for c in 0..self.extent[1] {
                tile.set(r, c, self.view.get(self.origin[0] + r, self.origin[1] + c));
            }
        }
        tile
    }
}

/// Dense row-major f32 accumulator tile.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tile {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Columns `[start, start + len)` as a new tile, zero past the right edge.
    pub fn columns(&self, start: usize, len: usize) -> Tile {
        let mut out = Tile::zeros(self.rows, len);
        for r in 0..self.rows {
            for c in 0..len.min(self.cols.saturating_sub(start)) {
                out.set(r, c, self.get(r, start + c));
            }
        }
        out
    }

    /// `self += a · bᵗ`, with `a: rows × k` and `b: cols × k`.
    pub fn gemm_nt_acc(&mut self, a: &Tile, b: &Tile) {
        debug_assert_eq!(a.cols, b.cols);
        for r in 0..self.rows {
            let ar = a.row(r);
            for c in 0..self.cols {
                let br = b.row(c);
                let dot: f32 = ar.iter().zip(br).map(|(x, y)| x * y).sum();
                self.data[r * self.cols + c] += dot;
            }
        }
    }

    /// `self += a · b`, with `a: rows × k` and `b: k × cols`.
    pub fn gemm_nn_acc(&mut self, a: &Tile, b: &Tile) {
        debug_assert_eq!(a.cols, b.rows);
        for r in 0..self.rows {
            for kk in 0..a.cols {
                let x = a.get(r, kk);
                if x == 0.0 {
                    continue;
                }
                let br = b.row(kk);
                let out = self.row_mut(r);
                for (o, y) in out.iter_mut().zip(br) {
                    *o += x * y;
                }
            }
        }
    }

    /// `self += aᵗ · b`, with `a: k × rows` and `b: k × cols`.
    pub fn gemm_tn_acc(&mut self, a: &Tile, b: &Tile) {
        debug_assert_eq!(a.rows, b.rows);
        for kk in 0..a.rows {
            let br = b.row(kk);
            for r in 0..self.rows {
                let x = a.get(kk, r);
                if x == 0.0 {
                    continue;
                }
                let out = self.row_mut(r);
                for (o, y) in out.iter_mut().zip(br) {
                    *o += x * y;
                }
            }
        }
    }

    pub fn scale(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|x| *x *= factor);
    }
}
