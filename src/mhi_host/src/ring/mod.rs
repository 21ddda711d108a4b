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

//! Ring cursors shared by transfer, event and command rings.
//!
//! A [`Ring`] is the host's local shadow of one circular buffer living in
//! DMA memory. It only tracks slot indices; the elements themselves are
//! read and written through [`DmaOps`](crate::DmaOps) at the addresses the
//! ring hands out.
//!
//! Cursor rules:
//! - `wp` is where the next element is produced
//! - `rp` is the next element to consume
//! - `ack_rp` trails `rp` on rings whose consumed elements are released
//!   later (inbound channels polled by clients), and equals `rp` otherwise
//! - at most `capacity - 1` slots are live, so `rp == wp` means empty

use thiserror::Error;

/// Context layouts shared with the modem
pub mod context;
/// Transfer, command and event element layouts
pub mod elements;

/// Size in bytes of every ring element
pub const ELEMENT_SIZE: usize = 16;
/// Number of event rings allocated per device
pub const NUM_EVENT_RINGS: usize = 4;
/// Elements per event ring
pub const EVENT_RING_ELEMENTS: usize = 256 + 16;
/// Elements in the command ring
pub const CMD_RING_ELEMENTS: usize = 128;
/// Event ring for command completions, state and execution environment events
pub const PRIMARY_EVENT_RING: usize = 0;
/// Event ring shared by all software channels
pub const SOFTWARE_EVENT_RING: usize = 1;
/// Event ring of the hardware outbound channel
pub const IPA_OUT_EVENT_RING: usize = 2;
/// Event ring of the hardware inbound channel
pub const IPA_IN_EVENT_RING: usize = 3;
/// Length given to inbound buffers when they are handed back to the modem
pub const TRB_MAX_DATA_SIZE: u16 = 0x1000;

/// Ring cursor errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// No free slot is left
    #[error("Ring is full")]
    Full,
    /// No element is available to consume
    #[error("Ring is empty")]
    Empty,
    /// The address is not inside the ring
    #[error("Address {0:#x} is outside the ring")]
    AddressOutOfRange(u64),
    /// The address is inside the ring but not on an element boundary
    #[error("Address {0:#x} is not on an element boundary")]
    Misaligned(u64),
    /// The slot index is past the end of the ring
    #[error("Slot {0} is past the end of the ring")]
    IndexOutOfRange(usize),
    /// The ring geometry is unusable
    #[error("Invalid ring layout")]
    InvalidLayout,
}

/// Local cursors of one ring.
#[derive(Debug, Clone)]
pub struct Ring {
    base: u64,
    el_size: usize,
    capacity: usize,
    rp: usize,
    wp: usize,
    ack_rp: usize,
    track_acks: bool,
    overwrite: bool,
    db_pending: bool,
}

impl Ring {
    /// Create an empty ring of `capacity` elements of `el_size` bytes at `base`.
    pub fn new(base: u64, el_size: usize, capacity: usize) -> Result<Self, RingError> {
        if el_size == 0 || capacity < 2 {
            return Err(RingError::InvalidLayout);
        }
        let len = (el_size as u64)
            .checked_mul(capacity as u64)
            .ok_or(RingError::InvalidLayout)?;
        base.checked_add(len).ok_or(RingError::InvalidLayout)?;

        Ok(Self {
            base,
            el_size,
            capacity,
            rp: 0,
            wp: 0,
            ack_rp: 0,
            track_acks: false,
            overwrite: false,
            db_pending: false,
        })
    }

    /// Keep consumed elements reserved until [`Ring::acknowledge`] releases them.
    pub fn with_ack_tracking(mut self) -> Self {
        self.track_acks = true;
        self
    }

    /// Let [`Ring::add_element`] discard the oldest element instead of
    /// failing on a full ring.
    pub fn set_overwrite(&mut self, overwrite: bool) {
        self.overwrite = overwrite;
    }

    /// Bus address of slot 0
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the ring in bytes
    pub fn len_bytes(&self) -> u64 {
        (self.el_size * self.capacity) as u64
    }

    /// Number of slots, including the one that is always kept free
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read cursor slot index
    pub fn rp(&self) -> usize {
        self.rp
    }

    /// Write cursor slot index
    pub fn wp(&self) -> usize {
        self.wp
    }

    /// Acknowledged read cursor slot index
    pub fn ack_rp(&self) -> usize {
        self.ack_rp
    }

    /// Bus address of the read cursor
    pub fn rp_addr(&self) -> u64 {
        self.slot_addr(self.rp)
    }

    /// Bus address of the write cursor
    pub fn wp_addr(&self) -> u64 {
        self.slot_addr(self.wp)
    }

    /// Bus address of the acknowledged read cursor
    pub fn ack_addr(&self) -> u64 {
        self.slot_addr(self.ack_rp)
    }

    fn slot_addr(&self, idx: usize) -> u64 {
        self.base + (idx * self.el_size) as u64
    }

    fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.capacity
    }

    /// Whether nothing is left to consume
    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    /// Whether adding an element would overrun the oldest unreleased one
    pub fn is_full(&self) -> bool {
        self.next(self.wp) == self.ack_rp
    }

    /// Reserve the slot at the write cursor and advance it.
    ///
    /// Returns the bus address of the reserved slot for the caller to fill.
    pub fn add_element(&mut self) -> Result<u64, RingError> {
        if self.is_full() {
            if !self.overwrite {
                return Err(RingError::Full);
            }
            let dropped = self.ack_rp;
            self.ack_rp = self.next(self.ack_rp);
            if self.rp == dropped {
                self.rp = self.ack_rp;
            }
        }
        let addr = self.slot_addr(self.wp);
        self.wp = self.next(self.wp);
        Ok(addr)
    }

    /// Consume the element at the read cursor and advance it.
    pub fn delete_element(&mut self) -> Result<u64, RingError> {
        if self.is_empty() {
            return Err(RingError::Empty);
        }
        let addr = self.slot_addr(self.rp);
        self.rp = self.next(self.rp);
        if !self.track_acks {
            self.ack_rp = self.rp;
        }
        Ok(addr)
    }

    /// Release the oldest consumed element.
    pub fn acknowledge(&mut self) -> Result<u64, RingError> {
        if self.ack_rp == self.rp {
            return Err(RingError::Empty);
        }
        let addr = self.slot_addr(self.ack_rp);
        self.ack_rp = self.next(self.ack_rp);
        Ok(addr)
    }

    /// Release every consumed element at once.
    pub fn release_consumed(&mut self) -> usize {
        let released = self.nr_enclosed(self.ack_rp, self.rp);
        self.ack_rp = self.rp;
        released
    }

    /// Slot index of `addr`.
    pub fn addr_to_index(&self, addr: u64) -> Result<usize, RingError> {
        if addr < self.base || addr >= self.base + self.len_bytes() {
            return Err(RingError::AddressOutOfRange(addr));
        }
        let offset = addr - self.base;
        if offset % self.el_size as u64 != 0 {
            return Err(RingError::Misaligned(addr));
        }
        Ok((offset / self.el_size as u64) as usize)
    }

    /// Bus address of slot `idx`.
    pub fn index_to_addr(&self, idx: usize) -> Result<u64, RingError> {
        if idx >= self.capacity {
            return Err(RingError::IndexOutOfRange(idx));
        }
        Ok(self.slot_addr(idx))
    }

    /// Number of live slots between `rp` and `wp`, allowing wraparound.
    pub fn nr_enclosed(&self, rp: usize, wp: usize) -> usize {
        if wp >= rp {
            wp - rp
        } else {
            self.capacity - rp + wp
        }
    }

    /// Number of elements that can still be added
    pub fn nr_avail(&self) -> usize {
        self.capacity - self.nr_enclosed(self.ack_rp, self.wp) - 1
    }

    /// Number of elements produced but not yet consumed
    pub fn nr_pending(&self) -> usize {
        self.nr_enclosed(self.rp, self.wp)
    }

    /// Return every cursor to slot 0 and drop any deferred doorbell.
    pub fn reset(&mut self) {
        self.rp = 0;
        self.wp = 0;
        self.ack_rp = 0;
        self.db_pending = false;
    }

    /// Move the read cursor to `addr` without consuming elements. Used when
    /// the modem's view is authoritative, such as after a channel reset.
    pub fn set_rp_addr(&mut self, addr: u64) -> Result<(), RingError> {
        self.rp = self.addr_to_index(addr)?;
        if !self.track_acks {
            self.ack_rp = self.rp;
        }
        Ok(())
    }

    /// Note that a doorbell write was skipped
    pub fn mark_db_pending(&mut self) {
        self.db_pending = true;
    }

    /// Clear and return the deferred doorbell flag
    pub fn take_db_pending(&mut self) -> bool {
        std::mem::take(&mut self.db_pending)
    }

    /// Whether a doorbell write is owed to the modem
    pub fn db_pending(&self) -> bool {
        self.db_pending
    }
}
