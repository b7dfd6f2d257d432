//! Scratch allocations and host-side access to device memory from inside jobs.

use crate::error::{Error, Result};
use crate::tensor::{DType, Device, DevicePtr, Storage};
use std::sync::{Arc, RwLockReadGuard};

/// Per-call scratch workspace.
///
/// The owner drops at the end of the launching call; any job holding the
/// [`DevicePtr`] handed out by [`SimpleDeviceMem::device_buffer`] keeps the
/// allocation alive until it has run, so reuse is ordered behind the stream.
pub struct SimpleDeviceMem {
    buffer: Option<Arc<Storage>>,
}

impl SimpleDeviceMem {
    pub fn new(size_in_bytes: usize, device: Device) -> Self {
        let buffer = (size_in_bytes > 0).then(|| {
            let words = size_in_bytes.div_ceil(4);
            Storage::zeroed(words, DType::F32, device)
        });
        Self { buffer }
    }

    /// `None` for a zero-sized workspace.
    pub fn device_buffer(&self) -> Option<DevicePtr> {
        self.buffer
            .as_ref()
            .map(|storage| DevicePtr::new(Arc::clone(storage), 0))
    }
}

/// Read guards over a set of storages, one per distinct allocation.
///
/// Taking guards in storage-id order keeps concurrent jobs from deadlocking, and
/// deduplicating avoids re-entrant read locks when tensors alias.
pub(crate) struct ReadSet<'a> {
    guards: Vec<(u64, RwLockReadGuard<'a, Vec<u8>>)>,
}

impl<'a> ReadSet<'a> {
    pub(crate) fn lock<I>(storages: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Storage>,
    {
        let mut distinct: Vec<&'a Storage> = storages.into_iter().collect();
        distinct.sort_by_key(|s| s.id());
        distinct.dedup_by_key(|s| s.id());
        let guards = distinct
            .into_iter()
            .map(|s| s.read().map(|guard| (s.id(), guard)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { guards })
    }

    pub(crate) fn bytes(&self, storage: &Storage) -> Result<&[u8]> {
        self.guards
            .binary_search_by_key(&storage.id(), |(id, _)| *id)
            .map(|at| self.guards[at].1.as_slice())
            .map_err(|_| Error::DeviceFault {
                reason: format!("storage {} was not mapped for this launch", storage.id()),
            })
    }
}
