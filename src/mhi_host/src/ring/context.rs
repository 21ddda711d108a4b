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

//! Context layouts in the control segment.
//!
//! The modem reads ring geometry and cursors from these packed 44-byte
//! records. The host writes them at bring-up and mirrors its write cursor
//! into `wp` on every doorbell; the modem owns `rp`.

use bytemuck::{Pod, Zeroable};

use crate::mem::{DmaError, DmaOps, DmaOpsExt};

/// Offset of `rp`, shared by all three context kinds
pub const RP_OFFSET: u64 = 28;
/// Offset of `wp`, shared by all three context kinds
pub const WP_OFFSET: u64 = 36;

/// Overwrite both cursors of the context at `ctxt_addr`
pub(crate) fn write_cursors(
    dma: &dyn DmaOps,
    ctxt_addr: u64,
    rp: u64,
    wp: u64,
) -> Result<(), DmaError> {
    dma.write_val(ctxt_addr + RP_OFFSET, rp)?;
    dma.write_val(ctxt_addr + WP_OFFSET, wp)
}

/// Channel context
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct ChannelContext {
    /// Raw [`ChannelState`](crate::ChannelState)
    pub state: u32,
    /// Raw [`Direction`](crate::Direction)
    pub chan_type: u32,
    /// Event ring receiving this channel's completions
    pub ev_ring_index: u32,
    /// Transfer ring base
    pub base: u64,
    /// Transfer ring length in bytes
    pub len: u64,
    /// Modem read pointer
    pub rp: u64,
    /// Host write pointer
    pub wp: u64,
}

/// Event ring context
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct EventContext {
    /// Interrupt moderation timer in bits [31:16]
    pub intmodt: u32,
    /// Event ring type
    pub er_type: u32,
    /// MSI vector raised for new events
    pub msi_vector: u32,
    /// Event ring base
    pub base: u64,
    /// Event ring length in bytes
    pub len: u64,
    /// Modem write position, named rp in the modem's view
    pub rp: u64,
    /// Last slot the host has returned
    pub wp: u64,
}

/// Command ring context
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct CommandContext {
    /// Reserved
    pub reserved: [u32; 3],
    /// Command ring base
    pub base: u64,
    /// Command ring length in bytes
    pub len: u64,
    /// Modem read pointer
    pub rp: u64,
    /// Host write pointer
    pub wp: u64,
}

const _: () = assert!(core::mem::size_of::<ChannelContext>() == 44);
const _: () = assert!(core::mem::size_of::<EventContext>() == 44);
const _: () = assert!(core::mem::size_of::<CommandContext>() == 44);
const _: () = assert!(
    ChannelContext::RP_OFFSET == RP_OFFSET as usize
        && ChannelContext::WP_OFFSET == WP_OFFSET as usize
);
const _: () = assert!(
    EventContext::RP_OFFSET == RP_OFFSET as usize && EventContext::WP_OFFSET == WP_OFFSET as usize
);
const _: () = assert!(
    CommandContext::RP_OFFSET == RP_OFFSET as usize
        && CommandContext::WP_OFFSET == WP_OFFSET as usize
);

impl ChannelContext {
    /// Size of the context in bytes
    pub const SIZE: usize = core::mem::size_of::<Self>();
    /// Offset of the state word
    pub const STATE_OFFSET: usize = core::mem::offset_of!(Self, state);
    /// Offset of the read pointer
    pub const RP_OFFSET: usize = core::mem::offset_of!(Self, rp);
    /// Offset of the write pointer
    pub const WP_OFFSET: usize = core::mem::offset_of!(Self, wp);
}

impl EventContext {
    /// Size of the context in bytes
    pub const SIZE: usize = core::mem::size_of::<Self>();
    /// Offset of the read pointer
    pub const RP_OFFSET: usize = core::mem::offset_of!(Self, rp);
    /// Offset of the write pointer
    pub const WP_OFFSET: usize = core::mem::offset_of!(Self, wp);

    const INTMOD_SHIFT: u32 = 16;

    /// Interrupt moderation timer value
    pub fn intmod(&self) -> u16 {
        (self.intmodt >> Self::INTMOD_SHIFT) as u16
    }

    /// Set the interrupt moderation timer value
    pub fn set_intmod(&mut self, value: u16) {
        let intmodt = self.intmodt;
        self.intmodt = (intmodt & 0xFFFF) | ((value as u32) << Self::INTMOD_SHIFT);
    }
}

impl CommandContext {
    /// Size of the context in bytes
    pub const SIZE: usize = core::mem::size_of::<Self>();
    /// Offset of the read pointer
    pub const RP_OFFSET: usize = core::mem::offset_of!(Self, rp);
    /// Offset of the write pointer
    pub const WP_OFFSET: usize = core::mem::offset_of!(Self, wp);
}

/// Host-local properties of an event ring: polling bit 0, initialised
/// bit 1, MSI vector in bits [5:2].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventRingProperties(u32);

impl EventRingProperties {
    const POLLING: u32 = 1 << 0;
    const INITIALISED: u32 = 1 << 1;
    const MSI_SHIFT: u32 = 2;
    const MSI_MASK: u32 = 0xF;

    /// Properties of an interrupt-driven ring on `msi_vector`
    pub fn new(msi_vector: u32) -> Self {
        Self((msi_vector & Self::MSI_MASK) << Self::MSI_SHIFT)
    }

    /// Raw property word
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// MSI vector
    pub fn msi_vector(&self) -> u32 {
        (self.0 >> Self::MSI_SHIFT) & Self::MSI_MASK
    }

    /// Whether the ring is polled instead of interrupt driven
    pub fn polling(&self) -> bool {
        self.0 & Self::POLLING != 0
    }

    /// Whether the ring has been filled and handed to the modem
    pub fn initialised(&self) -> bool {
        self.0 & Self::INITIALISED != 0
    }

    /// Set or clear the initialised bit
    pub fn set_initialised(&mut self, on: bool) {
        if on {
            self.0 |= Self::INITIALISED;
        } else {
            self.0 &= !Self::INITIALISED;
        }
    }
}
