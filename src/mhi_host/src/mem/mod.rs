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

//! DMA-visible memory access.
//!
//! Everything the modem reads or writes (contexts, ring elements and client
//! buffers) is addressed by the device-visible bus address. [`DmaOps`]
//! abstracts the backing so the engine works the same over a real coherent
//! allocation or over the heap-backed [`CoherentMemory`] used by hosts
//! without an IOMMU and by tests.

use bytemuck::Pod;
use thiserror::Error;

/// Heap-backed coherent memory
pub mod coherent;
/// Placement of contexts and rings inside the control segment
pub mod layout;

pub use coherent::CoherentMemory;
pub use layout::ControlLayout;

/// Errors returned by a [`DmaOps`] backend
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// The access is not fully inside the backing region
    #[error("Access of {len} bytes at {addr:#x} is outside the mapped region")]
    OutOfBounds {
        /// Device-visible address of the access
        addr: u64,
        /// Length of the access in bytes
        len: usize,
    },
    /// The backend failed for another reason
    #[error("Backend failure at {0:#x}")]
    Backend(u64),
}

/// Backend-provided access to memory shared with the modem.
///
/// Implementations must make a completed `write` visible to the modem
/// before returning, and a `read` must observe every modem write that
/// completed before the call.
pub trait DmaOps: Send + Sync {
    /// Read `dst.len()` bytes starting at `addr`.
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), DmaError>;

    /// Write all of `src` starting at `addr`.
    fn write(&self, addr: u64, src: &[u8]) -> Result<(), DmaError>;
}

/// Typed access on top of [`DmaOps`].
pub trait DmaOpsExt {
    /// Read a Pod value at `addr`.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, DmaError>;

    /// Write a Pod value at `addr`.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), DmaError>;
}

impl<D: DmaOps + ?Sized> DmaOpsExt for D {
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, DmaError> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), DmaError> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)
    }
}
