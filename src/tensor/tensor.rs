use super::dtype::{read_i32, write_i32};
use super::{read_f32, write_f32, DType, Device, DevicePtr, Element, Storage};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// A strided view over a shared [`Storage`].
///
/// Strides and offsets are in elements. Cloning a tensor clones the view, not the
/// data.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

pub(crate) fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1].max(1);
    }
    strides
}

/// Elements a view needs its storage to hold, counting from element 0.
fn required_len(shape: &[usize], strides: &[usize], offset: usize) -> usize {
    if shape.iter().any(|&s| s == 0) {
        return offset;
    }
    offset
        + shape
            .iter()
            .zip(strides)
            .map(|(&s, &st)| (s - 1) * st)
            .sum::<usize>()
        + 1
}

impl Tensor {
    /// Build a view over existing storage, checking it stays in bounds.
    pub fn from_parts(
        storage: Arc<Storage>,
        shape: Vec<usize>,
        strides: Vec<usize>,
        offset: usize,
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(Error::invalid_argument(
                "strides",
                format!("rank {} does not match shape rank {}", strides.len(), shape.len()),
            ));
        }
        let needed = required_len(&shape, &strides, offset);
        if needed > storage.len() {
            return Err(Error::invalid_argument(
                "shape",
                format!(
                    "view {:?}/{:?}+{} needs {} elements, storage holds {}",
                    shape,
                    strides,
                    offset,
                    needed,
                    storage.len()
                ),
            ));
        }
        Ok(Self {
            storage,
            shape,
            strides,
            offset,
        })
    }

    /// Zero-filled contiguous tensor.
    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Self {
        let numel = shape.iter().product();
        Self {
            storage: Storage::zeroed(numel, dtype, device),
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            offset: 0,
        }
    }

    /// Zero-filled tensor with an explicit stride layout (broadcast strides allowed).
    pub fn empty_strided(
        shape: &[usize],
        strides: &[usize],
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        let needed = required_len(shape, strides, 0);
        Self::from_parts(
            Storage::zeroed(needed, dtype, device),
            shape.to_vec(),
            strides.to_vec(),
            0,
        )
    }

    /// Contiguous tensor from f32 values, rounded into `dtype`.
    pub fn from_f32(data: &[f32], shape: &[usize], dtype: DType, device: Device) -> Result<Self> {
        if !dtype.is_float() {
            return Err(Error::invalid_argument(
                "dtype",
                format!("{dtype} is not a floating type"),
            ));
        }
        Self::check_len(data.len(), shape)?;
        let mut bytes = vec![0u8; data.len() * dtype.size_in_bytes()];
        for (i, &v) in data.iter().enumerate() {
            write_f32(dtype, &mut bytes, i, v);
        }
        Self::from_parts(
            Storage::from_bytes(bytes, dtype, device),
            shape.to_vec(),
            contiguous_strides(shape),
            0,
        )
    }

    /// Contiguous tensor from typed values.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize], device: Device) -> Result<Self> {
        Self::check_len(data.len(), shape)?;
        let mut bytes = vec![0u8; data.len() * T::DTYPE.size_in_bytes()];
        for (i, &v) in data.iter().enumerate() {
            v.write(&mut bytes, i);
        }
        Self::from_parts(
            Storage::from_bytes(bytes, T::DTYPE, device),
            shape.to_vec(),
            contiguous_strides(shape),
            0,
        )
    }

    /// Contiguous i32 tensor, e.g. a prefix-sum offset table.
    pub fn from_i32(data: &[i32], shape: &[usize], device: Device) -> Result<Self> {
        Self::check_len(data.len(), shape)?;
        let mut bytes = vec![0u8; data.len() * 4];
        for (i, &v) in data.iter().enumerate() {
            write_i32(&mut bytes, i, v);
        }
        Self::from_parts(
            Storage::from_bytes(bytes, DType::I32, device),
            shape.to_vec(),
            contiguous_strides(shape),
            0,
        )
    }

    fn check_len(len: usize, shape: &[usize]) -> Result<()> {
        let numel: usize = shape.iter().product();
        if len != numel {
            return Err(Error::invalid_argument(
                "data",
                format!("{len} values for shape {shape:?} ({numel} elements)"),
            ));
        }
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    /// Size of axis `d`. Callers check `dim()` first.
    pub fn size(&self, d: usize) -> usize {
        self.shape[d]
    }

    /// Stride of axis `d`, in elements.
    pub fn stride(&self, d: usize) -> usize {
        self.strides[d]
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Offset of the first element, in elements.
    pub fn storage_offset(&self) -> usize {
        self.offset
    }

    /// Raw address of the first element.
    pub fn data_ptr(&self) -> DevicePtr {
        DevicePtr::new(
            Arc::clone(&self.storage),
            self.offset * self.dtype().size_in_bytes(),
        )
    }

    /// Row-major dense layout; size-1 axes may carry any stride.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1usize;
        for d in (0..self.dim()).rev() {
            if self.shape[d] != 1 && self.strides[d] != expected {
                return false;
            }
            expected *= self.shape[d];
        }
        true
    }

    /// Innermost axis has unit stride (or a single element).
    pub fn is_last_dim_contiguous(&self) -> bool {
        match self.dim() {
            0 => true,
            n => self.shape[n - 1] == 1 || self.strides[n - 1] == 1,
        }
    }

    /// Both views address the same allocation.
    pub fn is_alias_of(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Identical shape and strides.
    pub fn same_layout(&self, other: &Tensor) -> bool {
        self.shape == other.shape && self.strides == other.strides
    }

    fn check_dim(&self, d: usize, op: &str) -> Result<()> {
        if d >= self.dim() {
            return Err(Error::invalid_argument(
                "dim",
                format!("{op}: dim {d} out of range for rank {}", self.dim()),
            ));
        }
        Ok(())
    }

    /// Drop axis `d`, fixing it at `index`.
    pub fn select(&self, d: usize, index: usize) -> Result<Tensor> {
        self.check_dim(d, "select")?;
        if index >= self.shape[d] {
            return Err(Error::invalid_argument(
                "index",
                format!("select: index {index} out of range for size {}", self.shape[d]),
            ));
        }
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        let offset = self.offset + index * strides[d];
        shape.remove(d);
        strides.remove(d);
        Tensor::from_parts(Arc::clone(&self.storage), shape, strides, offset)
    }

    /// Keep `len` entries of axis `d` starting at `start`.
    pub fn narrow(&self, d: usize, start: usize, len: usize) -> Result<Tensor> {
        self.check_dim(d, "narrow")?;
        if start + len > self.shape[d] {
            return Err(Error::invalid_argument(
                "len",
                format!(
                    "narrow: [{start}, {}) exceeds size {}",
                    start + len,
                    self.shape[d]
                ),
            ));
        }
        let mut shape = self.shape.clone();
        shape[d] = len;
        let offset = if len == 0 {
            self.offset
        } else {
            self.offset + start * self.strides[d]
        };
        Tensor::from_parts(Arc::clone(&self.storage), shape, self.strides.clone(), offset)
    }

    /// Insert a size-1 axis at `d`.
    pub fn unsqueeze(&self, d: usize) -> Result<Tensor> {
        if d > self.dim() {
            return Err(Error::invalid_argument(
                "dim",
                format!("unsqueeze: dim {d} out of range for rank {}", self.dim()),
            ));
        }
        let stride = if d < self.dim() {
            self.strides[d] * self.shape[d]
        } else {
            1
        };
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        shape.insert(d, 1);
        strides.insert(d, stride);
        Tensor::from_parts(Arc::clone(&self.storage), shape, strides, self.offset)
    }

    /// Broadcast size-1 axes to `shape` (stride 0). Rank must match.
    pub fn expand(&self, shape: &[usize]) -> Result<Tensor> {
        if shape.len() != self.dim() {
            return Err(Error::invalid_argument(
                "shape",
                format!("expand: rank {} to {:?}", self.dim(), shape),
            ));
        }
        let mut strides = self.strides.clone();
        for (d, (&from, &to)) in self.shape.iter().zip(shape).enumerate() {
            if from == to {
                continue;
            }
            if from != 1 {
                return Err(Error::invalid_argument(
                    "shape",
                    format!("expand: axis {d} of size {from} cannot become {to}"),
                ));
            }
            strides[d] = 0;
        }
        Tensor::from_parts(
            Arc::clone(&self.storage),
            shape.to_vec(),
            strides,
            self.offset,
        )
    }

    /// Split axis `d` into `sizes`, whose product must equal its size.
    pub fn unflatten(&self, d: usize, sizes: &[usize]) -> Result<Tensor> {
        self.check_dim(d, "unflatten")?;
        let product: usize = sizes.iter().product();
        if product != self.shape[d] {
            return Err(Error::invalid_argument(
                "sizes",
                format!("unflatten: {:?} does not cover size {}", sizes, self.shape[d]),
            ));
        }
        let mut split_strides = vec![0usize; sizes.len()];
        let mut stride = self.strides[d];
        for i in (0..sizes.len()).rev() {
            split_strides[i] = stride;
            stride *= sizes[i];
        }
        let mut shape = self.shape[..d].to_vec();
        shape.extend_from_slice(sizes);
        shape.extend_from_slice(&self.shape[d + 1..]);
        let mut strides = self.strides[..d].to_vec();
        strides.extend_from_slice(&split_strides);
        strides.extend_from_slice(&self.strides[d + 1..]);
        Tensor::from_parts(Arc::clone(&self.storage), shape, strides, self.offset)
    }

    /// Storage element index of every logical element, in row-major order.
    pub(crate) fn storage_indices(&self) -> Vec<usize> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }
        let rank = self.dim();
        let mut idx = vec![0usize; rank];
        let mut at = self.offset;
        for _ in 0..numel {
            out.push(at);
            for d in (0..rank).rev() {
                idx[d] += 1;
                at += self.strides[d];
                if idx[d] < self.shape[d] {
                    break;
                }
                at -= self.strides[d] * idx[d];
                idx[d] = 0;
            }
        }
        out
    }

    /// Copy out the logical elements as f32, in row-major order.
    ///
    /// Reads whatever the storage holds now; synchronize the stream first if work
    /// writing this tensor may still be in flight.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        let dtype = self.dtype();
        if !dtype.is_float() {
            return Err(Error::invalid_argument(
                "dtype",
                format!("to_vec_f32 on {dtype} tensor"),
            ));
        }
        let bytes = self.storage.read()?;
        Ok(self
            .storage_indices()
            .into_iter()
            .map(|i| read_f32(dtype, &bytes, i))
            .collect())
    }

    /// Copy out the logical elements of an i32 tensor.
    pub fn to_vec_i32(&self) -> Result<Vec<i32>> {
        if self.dtype() != DType::I32 {
            return Err(Error::invalid_argument(
                "dtype",
                format!("to_vec_i32 on {} tensor", self.dtype()),
            ));
        }
        let bytes = self.storage.read()?;
        Ok(self
            .storage_indices()
            .into_iter()
            .map(|i| read_i32(&bytes, i))
            .collect())
    }

    /// Dense copy on `device`.
    pub fn to_device(&self, device: Device) -> Result<Tensor> {
        let size = self.dtype().size_in_bytes();
        let src = self.storage.read()?;
        let mut bytes = Vec::with_capacity(self.numel() * size);
        for i in self.storage_indices() {
            bytes.extend_from_slice(&src[i * size..(i + 1) * size]);
        }
        Tensor::from_parts(
            Storage::from_bytes(bytes, self.dtype(), device),
            self.shape.clone(),
            contiguous_strides(&self.shape),
            0,
        )
    }

    /// Dense copy on the same device.
    pub fn contiguous(&self) -> Result<Tensor> {
        self.to_device(self.device())
    }

    /// Zero every element this view addresses.
    pub fn fill_zero(&self) -> Result<()> {
        let size = self.dtype().size_in_bytes();
        let mut bytes = self.storage.write()?;
        for i in self.storage_indices() {
            bytes[i * size..(i + 1) * size].fill(0);
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .field("dtype", &self.dtype())
            .field("device", &self.device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        Tensor::from_f32(&data, shape, DType::F32, Device::accelerator()).unwrap()
    }

    #[test]
    fn test_select_and_narrow() {
        let t = iota(&[2, 3, 4]);
        let s = t.select(1, 2).unwrap();
        assert_eq!(s.shape(), &[2, 4]);
        assert_eq!(s.to_vec_f32().unwrap(), vec![8., 9., 10., 11., 20., 21., 22., 23.]);
        let n = t.narrow(2, 1, 2).unwrap();
        assert!(!n.is_contiguous());
        assert!(n.is_last_dim_contiguous());
        assert_eq!(n.to_vec_f32().unwrap()[..4], [1., 2., 5., 6.]);
        assert!(t.select(1, 3).is_err());
    }

    #[test]
    fn test_unflatten_and_expand() {
        let t = iota(&[2, 6]);
        let u = t.unflatten(1, &[3, 2]).unwrap();
        assert_eq!(u.shape(), &[2, 3, 2]);
        assert_eq!(u.strides(), &[6, 2, 1]);
        let row = iota(&[1, 3]);
        let e = row.expand(&[4, 3]).unwrap();
        assert_eq!(e.strides(), &[0, 1]);
        assert_eq!(e.to_vec_f32().unwrap()[9..], [0., 1., 2.]);
        assert!(iota(&[2, 3]).expand(&[4, 3]).is_err());
    }

    #[test]
    fn test_unsqueeze() {
        let t = iota(&[3, 4]);
        let u = t.unsqueeze(0).unwrap();
        assert_eq!(u.shape(), &[1, 3, 4]);
        assert!(u.is_contiguous());
        let v = t.unsqueeze(2).unwrap();
        assert_eq!(v.shape(), &[3, 4, 1]);
        assert!(v.is_contiguous());
    }

    #[test]
    fn test_alias_and_empty_strided() {
        let chunk = Tensor::zeros(&[2, 5, 3, 4, 8], DType::F16, Device::accelerator());
        let q = chunk.select(2, 0).unwrap();
        let k = chunk.select(2, 1).unwrap();
        assert!(q.is_alias_of(&k));
        assert_eq!(q.strides(), &[480, 96, 8, 1]);
        let like = Tensor::empty_strided(q.shape(), q.strides(), DType::F16, q.device()).unwrap();
        assert!(like.same_layout(&q));
        assert!(!like.is_alias_of(&q));
    }

    #[test]
    fn test_from_parts_bounds() {
        let s = Storage::zeroed(10, DType::F32, Device::accelerator());
        assert!(Tensor::from_parts(s.clone(), vec![2, 5], vec![5, 1], 0).is_ok());
        assert!(Tensor::from_parts(s, vec![2, 5], vec![5, 1], 1).is_err());
    }

    #[test]
    fn test_fill_zero_only_touches_view() {
        let t = iota(&[2, 4]);
        t.narrow(1, 1, 2).unwrap().fill_zero().unwrap();
        assert_eq!(t.to_vec_f32().unwrap(), vec![0., 0., 0., 3., 4., 0., 0., 7.]);
    }

    #[test]
    fn test_to_device_roundtrip_bf16() {
        let t = Tensor::from_f32(&[1.0, 2.5, -3.0], &[3], DType::BF16, Device::Host).unwrap();
        let d = t.to_device(Device::accelerator()).unwrap();
        assert_eq!(d.device(), Device::accelerator());
        assert_eq!(d.to_vec_f32().unwrap(), vec![1.0, 2.5, -3.0]);
    }
}
