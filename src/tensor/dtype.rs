use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    BF16,
    F32,
    I32,
}

impl DType {
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
        }
    }

    pub const fn is_float(self) -> bool {
        !matches!(self, DType::I32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::I32 => "i32",
        };
        f.write_str(name)
    }
}

/// Floating element types a kernel can be specialized on.
///
/// Values are stored little-endian in the byte buffer of a [`super::Storage`];
/// `index` is an element index, not a byte offset.
pub trait Element: Copy + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;
    /// Widest vector (in elements) a single 16-byte transfer can carry.
    const MAX_VECTOR_SIZE: usize = 16 / Self::DTYPE.size_in_bytes();

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
    fn read(bytes: &[u8], index: usize) -> Self;
    fn write(self, bytes: &mut [u8], index: usize);
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    fn read(bytes: &[u8], index: usize) -> Self {
        let at = index * 2;
        f16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn write(self, bytes: &mut [u8], index: usize) {
        let at = index * 2;
        bytes[at..at + 2].copy_from_slice(&self.to_le_bytes());
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }

    fn read(bytes: &[u8], index: usize) -> Self {
        let at = index * 2;
        bf16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn write(self, bytes: &mut [u8], index: usize) {
        let at = index * 2;
        bytes[at..at + 2].copy_from_slice(&self.to_le_bytes());
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(v: f32) -> Self {
        v
    }

    fn read(bytes: &[u8], index: usize) -> Self {
        let at = index * 4;
        f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    fn write(self, bytes: &mut [u8], index: usize) {
        let at = index * 4;
        bytes[at..at + 4].copy_from_slice(&self.to_le_bytes());
    }
}

/// Read one floating element whose type is only known at run time.
pub(crate) fn read_f32(dtype: DType, bytes: &[u8], index: usize) -> f32 {
    match dtype {
        DType::F16 => f16::read(bytes, index).to_f32(),
        DType::BF16 => bf16::read(bytes, index).to_f32(),
        DType::F32 => f32::read(bytes, index),
        DType::I32 => read_i32(bytes, index) as f32,
    }
}

/// Write one floating element whose type is only known at run time.
pub(crate) fn write_f32(dtype: DType, bytes: &mut [u8], index: usize, v: f32) {
    match dtype {
        DType::F16 => f16::from_f32(v).write(bytes, index),
        DType::BF16 => bf16::from_f32(v).write(bytes, index),
        DType::F32 => v.write(bytes, index),
        DType::I32 => write_i32(bytes, index, v as i32),
    }
}

pub(crate) fn read_i32(bytes: &[u8], index: usize) -> i32 {
    let at = index * 4;
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn write_i32(bytes: &mut [u8], index: usize, v: i32) {
    let at = index * 4;
    bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_size_per_type() {
        assert_eq!(<f16 as Element>::MAX_VECTOR_SIZE, 8);
        assert_eq!(<bf16 as Element>::MAX_VECTOR_SIZE, 8);
        assert_eq!(<f32 as Element>::MAX_VECTOR_SIZE, 4);
    }

    #[test]
    fn test_runtime_read_write() {
        let mut buf = vec![0u8; 16];
        write_f32(DType::F16, &mut buf, 3, 1.5);
        assert_eq!(read_f32(DType::F16, &buf, 3), 1.5);
        write_f32(DType::BF16, &mut buf, 0, -2.0);
        assert_eq!(read_f32(DType::BF16, &buf, 0), -2.0);
        write_i32(&mut buf, 2, -7);
        assert_eq!(read_i32(&buf, 2), -7);
    }
}
