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

//! The static channel map and per-channel runtime state.
//!
//! Channel ids `0..46` are software channels and `100`/`101` are the
//! hardware data path. Even ids carry host-to-modem traffic, odd ids
//! modem-to-host traffic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::client::Client;
use crate::mem::{DmaOps, DmaOpsExt};
use crate::ring::context::ChannelContext;
use crate::ring::{
    IPA_IN_EVENT_RING, IPA_OUT_EVENT_RING, Ring, SOFTWARE_EVENT_RING,
};
use crate::{MhiError, Result};

/// One past the highest channel id
pub const MAX_CHANNELS: u32 = 102;
/// One past the highest software channel id
pub const SOFTWARE_CHANNELS: u32 = 46;
/// Hardware (IP_HW_0) outbound channel
pub const HW_OUT_CHANNEL: u32 = 100;
/// Hardware (IP_HW_0) inbound channel
pub const HW_IN_CHANNEL: u32 = 101;
/// Transfer ring elements of a software channel
pub const SOFTWARE_RING_ELEMENTS: usize = 10;
/// Transfer ring elements of a hardware channel
pub const HARDWARE_RING_ELEMENTS: usize = 144;

/// Well-known channel ids
pub mod ids {
    #![allow(missing_docs)]
    pub const LOOPBACK_OUT: u32 = 0;
    pub const LOOPBACK_IN: u32 = 1;
    pub const SAHARA_OUT: u32 = 2;
    pub const SAHARA_IN: u32 = 3;
    pub const DIAG_OUT: u32 = 4;
    pub const DIAG_IN: u32 = 5;
    pub const SSR_OUT: u32 = 6;
    pub const SSR_IN: u32 = 7;
    pub const QDSS_OUT: u32 = 8;
    pub const QDSS_IN: u32 = 9;
    pub const EFS_OUT: u32 = 10;
    pub const EFS_IN: u32 = 11;
    pub const MBIM_OUT: u32 = 12;
    pub const MBIM_IN: u32 = 13;
    pub const QMI_OUT: u32 = 14;
    pub const QMI_IN: u32 = 15;
    /// First of the eight IP_CTRL pairs, 16..=31
    pub const IP_CTRL_0_OUT: u32 = 16;
    pub const IP_CTRL_0_IN: u32 = 17;
    pub const DUN_OUT: u32 = 32;
    pub const DUN_IN: u32 = 33;
    /// First of the four IP_SW pairs, 34..=41
    pub const IP_SW_0_OUT: u32 = 34;
    pub const IP_SW_0_IN: u32 = 35;
    pub const CSVT_OUT: u32 = 42;
    pub const CSVT_IN: u32 = 43;
    pub const SMCT_OUT: u32 = 44;
    pub const SMCT_IN: u32 = 45;
    pub const IP_HW_0_OUT: u32 = super::HW_OUT_CHANNEL;
    pub const IP_HW_0_IN: u32 = super::HW_IN_CHANNEL;
}

/// Whether `chan` is a channel this host supports
pub fn is_valid(chan: u32) -> bool {
    chan < SOFTWARE_CHANNELS || chan == HW_OUT_CHANNEL || chan == HW_IN_CHANNEL
}

/// Whether `chan` belongs to the hardware data path
pub fn is_hardware(chan: u32) -> bool {
    chan == HW_OUT_CHANNEL || chan == HW_IN_CHANNEL
}

/// Every valid channel id in ascending order
pub fn valid_channels() -> impl Iterator<Item = u32> {
    (0..MAX_CHANNELS).filter(|&c| is_valid(c))
}

/// Transfer ring size of a valid channel
pub fn ring_elements(chan: u32) -> usize {
    if is_hardware(chan) {
        HARDWARE_RING_ELEMENTS
    } else {
        SOFTWARE_RING_ELEMENTS
    }
}

/// Event ring receiving completions of a valid channel
pub fn event_ring_for(chan: u32) -> usize {
    match chan {
        HW_OUT_CHANNEL => IPA_OUT_EVENT_RING,
        HW_IN_CHANNEL => IPA_IN_EVENT_RING,
        _ => SOFTWARE_EVENT_RING,
    }
}

/// Transfer direction of a channel
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to modem
    Outbound = 1,
    /// Modem to host
    Inbound = 2,
}

impl Direction {
    /// Direction of `chan`
    pub fn of(chan: u32) -> Self {
        if chan % 2 == 0 {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

/// Channel state as stored in the channel context
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not usable
    Disabled = 0,
    /// Configured, waiting for START
    Enabled = 1,
    /// Moving data
    Running = 2,
    /// Suspended by the modem
    Suspended = 3,
    /// Stopped by the host
    Stop = 4,
    /// The modem reported a ring error
    Error = 5,
}

impl ChannelState {
    /// Decode a context state word
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ChannelState::Disabled,
            1 => ChannelState::Enabled,
            2 => ChannelState::Running,
            3 => ChannelState::Suspended,
            4 => ChannelState::Stop,
            5 => ChannelState::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-channel state guarded by the channel lock
#[derive(Debug)]
pub(crate) struct ChannelInner {
    pub(crate) state: ChannelState,
    pub(crate) client: Option<Arc<Client>>,
    pub(crate) generation: u64,
}

/// Runtime state of one valid channel.
///
/// The transfer ring sits behind a spin lock that also orders doorbell
/// writes. State and client registration sit behind the channel lock,
/// which is never taken while the ring lock is held.
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) id: u32,
    pub(crate) direction: Direction,
    pub(crate) ev_ring: usize,
    pub(crate) ctxt_addr: u64,
    pub(crate) ring: spin::Mutex<Ring>,
    inner: Mutex<ChannelInner>,
    db_mode: AtomicBool,
    outbound_acks: AtomicU64,
    since_db: AtomicU32,
    pkts_xferd: AtomicU64,
}

impl Channel {
    pub(crate) fn new(id: u32, ctxt_addr: u64, ring: Ring) -> Self {
        let direction = Direction::of(id);
        let ring = match direction {
            Direction::Inbound => ring.with_ack_tracking(),
            Direction::Outbound => ring,
        };
        Self {
            id,
            direction,
            ev_ring: event_ring_for(id),
            ctxt_addr,
            ring: spin::Mutex::new(ring),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Disabled,
                client: None,
                generation: 0,
            }),
            db_mode: AtomicBool::new(false),
            outbound_acks: AtomicU64::new(0),
            since_db: AtomicU32::new(0),
            pkts_xferd: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, ChannelInner>> {
        Ok(self.inner.lock()?)
    }

    pub(crate) fn state(&self) -> Result<ChannelState> {
        Ok(self.lock()?.state)
    }

    /// Update the host state and mirror it into the device-visible context.
    pub(crate) fn set_state(&self, dma: &dyn DmaOps, state: ChannelState) -> Result<()> {
        let mut inner = self.lock()?;
        log::debug!("Channel {} {} -> {}", self.id, inner.state, state);
        dma.write_val(self.ctxt_addr + ChannelContext::STATE_OFFSET as u64, state as u32)?;
        inner.state = state;
        Ok(())
    }

    /// The registered client, if any
    pub(crate) fn client(&self) -> Result<Option<Arc<Client>>> {
        Ok(self.lock()?.client.clone())
    }

    /// The registered client if it still carries `generation`
    pub(crate) fn client_for(&self, generation: u64) -> Result<Arc<Client>> {
        let inner = self.lock()?;
        match &inner.client {
            Some(c) if inner.generation == generation => Ok(c.clone()),
            _ => Err(MhiError::BadHandle(self.id)),
        }
    }

    pub(crate) fn is_hardware(&self) -> bool {
        is_hardware(self.id)
    }

    pub(crate) fn db_mode(&self) -> bool {
        self.db_mode.load(Ordering::Acquire)
    }

    pub(crate) fn set_db_mode(&self, on: bool) {
        self.db_mode.store(on, Ordering::Release);
    }

    pub(crate) fn outbound_acks(&self) -> u64 {
        self.outbound_acks.load(Ordering::Acquire)
    }

    pub(crate) fn add_outbound_ack(&self) {
        self.outbound_acks.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one outstanding ack. Returns false if none was outstanding.
    pub(crate) fn complete_outbound_ack(&self) -> bool {
        self.outbound_acks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Forget every outstanding ack, returning how many there were
    pub(crate) fn clear_outbound_acks(&self) -> u64 {
        self.outbound_acks.swap(0, Ordering::AcqRel)
    }

    /// Count one enqueue toward the doorbell batch and return the count
    pub(crate) fn bump_since_db(&self) -> u32 {
        self.since_db.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub(crate) fn reset_since_db(&self) {
        self.since_db.store(0, Ordering::Release);
    }

    pub(crate) fn count_packet(&self) {
        self.pkts_xferd.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn packets_transferred(&self) -> u64 {
        self.pkts_xferd.load(Ordering::Relaxed)
    }
}
