/*
Copyright 2025  The mhi-rs Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::ops::Range;
use std::sync::Mutex;

use super::{DmaError, DmaOps};

/// A contiguous heap allocation presented to the modem at a fixed bus
/// address.
///
/// Every access takes an internal lock, so a single `read` or `write` is
/// never torn by a concurrent access from the other side.
#[derive(Debug)]
pub struct CoherentMemory {
    base: u64,
    storage: Mutex<Vec<u8>>,
}

impl CoherentMemory {
    /// Allocate `size` zeroed bytes visible at bus address `base`
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            storage: Mutex::new(vec![0u8; size]),
        }
    }

    /// Bus address of the first byte
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the allocation in bytes
    pub fn size(&self) -> usize {
        self.storage.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn range(&self, addr: u64, len: usize, size: usize) -> Result<Range<usize>, DmaError> {
        let oob = DmaError::OutOfBounds { addr, len };
        let start = addr.checked_sub(self.base).ok_or(oob)?;
        let start = usize::try_from(start).map_err(|_| oob)?;
        let end = start.checked_add(len).ok_or(oob)?;
        if end > size {
            return Err(oob);
        }
        Ok(start..end)
    }
}

impl DmaOps for CoherentMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), DmaError> {
        let storage = self.storage.lock().map_err(|_| DmaError::Backend(addr))?;
        let range = self.range(addr, dst.len(), storage.len())?;
        dst.copy_from_slice(&storage[range]);
        Ok(())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<(), DmaError> {
        let mut storage = self.storage.lock().map_err(|_| DmaError::Backend(addr))?;
        let range = self.range(addr, src.len(), storage.len())?;
        storage[range].copy_from_slice(src);
        Ok(())
    }
}
