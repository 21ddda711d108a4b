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

use crate::channel::{MAX_CHANNELS, is_valid, ring_elements};
use crate::ring::context::{ChannelContext, CommandContext, EventContext};
use crate::ring::{CMD_RING_ELEMENTS, ELEMENT_SIZE, EVENT_RING_ELEMENTS, NUM_EVENT_RINGS};
use crate::{MhiError, Result, new_error};

const ALIGN: u64 = 16;

const fn align_up(v: u64) -> u64 {
    (v + ALIGN - 1) & !(ALIGN - 1)
}

// The control segment is laid out as
//
// +-------------------------------------------+
// |  transfer rings (valid channels, by id)   |
// +-------------------------------------------+
// |  command ring                             |
// +-------------------------------------------+
// |  event rings 0..4                         |
// +-------------------------------------------+
// |  command context                          |
// +-------------------------------------------+
// |  event contexts 0..4                      |
// +-------------------------------------------+
// |  channel contexts 0..102                  |
// +-------------------------------------------+ 0x0 (base)
//
// Every section starts on a 16 byte boundary.

/// Placement of every context and ring inside the control segment
#[derive(Debug, Clone)]
pub struct ControlLayout {
    base: u64,
    size: usize,
    ev_ctxt_offset: u64,
    cmd_ctxt_offset: u64,
    ev_rings_offset: u64,
    cmd_ring_offset: u64,
    xfer_ring_offsets: Vec<Option<u64>>,
}

impl ControlLayout {
    const EV_RING_BYTES: u64 = (EVENT_RING_ELEMENTS * ELEMENT_SIZE) as u64;

    /// Bytes needed for the whole control segment
    pub fn query_size() -> usize {
        let (end, _) = Self::offsets();
        end as usize
    }

    // Returns the total size and the per-section offsets
    fn offsets() -> (u64, [u64; 5]) {
        let chan_ctxt = 0;
        let ev_ctxt = align_up(chan_ctxt + MAX_CHANNELS as u64 * ChannelContext::SIZE as u64);
        let cmd_ctxt = align_up(ev_ctxt + NUM_EVENT_RINGS as u64 * EventContext::SIZE as u64);
        let ev_rings = align_up(cmd_ctxt + CommandContext::SIZE as u64);
        let cmd_ring = align_up(ev_rings + NUM_EVENT_RINGS as u64 * Self::EV_RING_BYTES);
        let xfer_rings = align_up(cmd_ring + (CMD_RING_ELEMENTS * ELEMENT_SIZE) as u64);

        let xfer_bytes: u64 = (0..MAX_CHANNELS)
            .filter(|&c| is_valid(c))
            .map(|c| align_up((ring_elements(c) * ELEMENT_SIZE) as u64))
            .sum();

        (
            xfer_rings + xfer_bytes,
            [chan_ctxt, ev_ctxt, cmd_ctxt, ev_rings, cmd_ring],
        )
    }

    /// Lay out the control segment in `size` bytes at bus address `base`
    pub fn new(base: u64, size: usize) -> Result<Self> {
        let needed = Self::query_size();
        if size < needed {
            return Err(MhiError::AllocError(size, needed));
        }
        if base % ALIGN != 0 {
            return Err(new_error!("Control segment base {:#x} is not 16 byte aligned", base));
        }
        base.checked_add(size as u64)
            .ok_or_else(|| new_error!("Control segment at {:#x} wraps the address space", base))?;

        let (_, [_, ev_ctxt, cmd_ctxt, ev_rings, cmd_ring]) = Self::offsets();

        let mut next = align_up(cmd_ring + (CMD_RING_ELEMENTS * ELEMENT_SIZE) as u64);
        let xfer_ring_offsets = (0..MAX_CHANNELS)
            .map(|c| {
                if !is_valid(c) {
                    return None;
                }
                let offset = next;
                next = align_up(next + (ring_elements(c) * ELEMENT_SIZE) as u64);
                Some(offset)
            })
            .collect();

        Ok(Self {
            base,
            size,
            ev_ctxt_offset: ev_ctxt,
            cmd_ctxt_offset: cmd_ctxt,
            ev_rings_offset: ev_rings,
            cmd_ring_offset: cmd_ring,
            xfer_ring_offsets,
        })
    }

    /// Bus address of the segment
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the segment in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Last byte of the segment, as programmed into MHICTRLLIMIT
    pub fn limit(&self) -> u64 {
        self.base + self.size as u64 - 1
    }

    /// Whether `len` bytes at `addr` are inside the segment
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.base + self.size as u64)
    }

    /// Base of the channel context array (CCABAP)
    pub fn chan_ctxt_base(&self) -> u64 {
        self.base
    }

    /// Base of the event context array (ECABAP)
    pub fn ev_ctxt_base(&self) -> u64 {
        self.base + self.ev_ctxt_offset
    }

    /// Address of the command context (CRCBAP)
    pub fn cmd_ctxt_addr(&self) -> u64 {
        self.base + self.cmd_ctxt_offset
    }

    /// Address of the context of channel `chan`
    pub fn chan_ctxt_addr(&self, chan: u32) -> u64 {
        self.chan_ctxt_base() + chan as u64 * ChannelContext::SIZE as u64
    }

    /// Address of the context of event ring `idx`
    pub fn ev_ctxt_addr(&self, idx: usize) -> u64 {
        self.ev_ctxt_base() + (idx * EventContext::SIZE) as u64
    }

    /// Base of event ring `idx`
    pub fn ev_ring_addr(&self, idx: usize) -> u64 {
        self.base + self.ev_rings_offset + idx as u64 * Self::EV_RING_BYTES
    }

    /// Base of the command ring
    pub fn cmd_ring_addr(&self) -> u64 {
        self.base + self.cmd_ring_offset
    }

    /// Base of the transfer ring of `chan`, `None` for invalid channels
    pub fn xfer_ring_addr(&self, chan: u32) -> Option<u64> {
        self.xfer_ring_offsets
            .get(chan as usize)
            .copied()
            .flatten()
            .map(|off| self.base + off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{HW_IN_CHANNEL, HW_OUT_CHANNEL};

    const BASE: u64 = 0x4000_0000;

    #[test]
    fn too_small_region_is_an_alloc_error() {
        let needed = ControlLayout::query_size();
        match ControlLayout::new(BASE, needed - 1) {
            Err(MhiError::AllocError(got, want)) => {
                assert_eq!(got, needed - 1);
                assert_eq!(want, needed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ControlLayout::new(BASE + 4, needed).is_err());
    }

    #[test]
    fn sections_do_not_overlap() {
        let size = ControlLayout::query_size();
        let l = ControlLayout::new(BASE, size).unwrap();

        assert_eq!(l.chan_ctxt_addr(0), BASE);
        assert!(l.chan_ctxt_addr(101) + 44 <= l.ev_ctxt_base());
        assert!(l.ev_ctxt_addr(3) + 44 <= l.cmd_ctxt_addr());
        assert!(l.cmd_ctxt_addr() + 44 <= l.ev_ring_addr(0));
        assert!(l.ev_ring_addr(3) + ControlLayout::EV_RING_BYTES <= l.cmd_ring_addr());
        assert!(l.cmd_ring_addr() + 128 * 16 <= l.xfer_ring_addr(0).unwrap());

        let mut prev_end = 0;
        for chan in (0..MAX_CHANNELS).filter(|&c| is_valid(c)) {
            let addr = l.xfer_ring_addr(chan).unwrap();
            assert_eq!(addr % 16, 0);
            assert!(addr >= prev_end);
            prev_end = addr + (ring_elements(chan) * ELEMENT_SIZE) as u64;
            assert!(l.contains(addr, ring_elements(chan) * ELEMENT_SIZE));
        }
        assert!(prev_end <= BASE + size as u64);
    }

    #[test]
    fn invalid_channels_have_no_ring() {
        let l = ControlLayout::new(BASE, ControlLayout::query_size()).unwrap();
        assert!(l.xfer_ring_addr(46).is_none());
        assert!(l.xfer_ring_addr(99).is_none());
        assert!(l.xfer_ring_addr(102).is_none());
        assert!(l.xfer_ring_addr(HW_OUT_CHANNEL).is_some());
        assert!(l.xfer_ring_addr(HW_IN_CHANNEL).is_some());
    }

    #[test]
    fn containment_is_half_open() {
        let l = ControlLayout::new(BASE, 0x1_0000).unwrap();
        assert!(l.contains(BASE, 0x1_0000));
        assert!(!l.contains(BASE, 0x1_0001));
        assert!(!l.contains(BASE - 1, 1));
        assert_eq!(l.limit(), BASE + 0xFFFF);
    }
}
