use super::{DType, Device};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A flat, typed allocation on one device.
pub struct Storage {
    id: u64,
    dtype: DType,
    device: Device,
    len: usize,
    data: RwLock<Vec<u8>>,
}

impl Storage {
    /// Zero-filled allocation of `len` elements.
    pub fn zeroed(len: usize, dtype: DType, device: Device) -> Arc<Self> {
        Self::from_bytes(vec![0u8; len * dtype.size_in_bytes()], dtype, device)
    }

    /// Wrap raw little-endian bytes. Trailing bytes that do not form a whole element
    /// are kept but never addressed.
    pub fn from_bytes(bytes: Vec<u8>, dtype: DType, device: Device) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            dtype,
            device,
            len: bytes.len() / dtype.size_in_bytes(),
            data: RwLock::new(bytes),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len * self.dtype.size_in_bytes()
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<u8>>> {
        self.data.read().map_err(|_| Error::DeviceFault {
            reason: format!("storage {} poisoned by a failed writer", self.id),
        })
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>> {
        self.data.write().map_err(|_| Error::DeviceFault {
            reason: format!("storage {} poisoned by a failed writer", self.id),
        })
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("len", &self.len)
            .finish()
    }
}

/// A raw device address: an allocation plus a byte offset into it.
///
/// This is the only place byte offsets live. Kernels turn a `DevicePtr` into an
/// element origin with [`DevicePtr::element_offset`] and then build bounds-checked
/// views from it.
#[derive(Clone)]
pub struct DevicePtr {
    storage: Arc<Storage>,
    byte_offset: usize,
}

impl DevicePtr {
    pub fn new(storage: Arc<Storage>, byte_offset: usize) -> Self {
        Self {
            storage,
            byte_offset,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Same allocation, `bytes` further along.
    pub fn offset_bytes(&self, bytes: usize) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            byte_offset: self.byte_offset + bytes,
        }
    }

    /// Element index this address points at, rejecting misaligned addresses.
    pub fn element_offset(&self) -> Result<usize> {
        let size = self.storage.dtype().size_in_bytes();
        if self.byte_offset % size != 0 {
            return Err(Error::DeviceFault {
                reason: format!(
                    "misaligned address: byte offset {} for {} elements",
                    self.byte_offset,
                    self.storage.dtype()
                ),
            });
        }
        Ok(self.byte_offset / size)
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DevicePtr(storage={}, +{}B)",
            self.storage.id(),
            self.byte_offset
        )
    }
}
