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

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::channel::{Channel, ChannelState};
use crate::counters::Counters;
use crate::device::DeviceContext;
use crate::event::EventRingState;
use crate::mem::DmaOpsExt;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::mmio::regs;
use crate::power::MhiState;
use crate::power::deferred::Job;
use crate::ring::Ring;
use crate::ring::context::{ChannelContext, CommandContext, EventContext};
use crate::Result;

/// Doorbell register offsets read from CHDBOFF and ERDBOFF
#[derive(Debug, Default)]
pub(crate) struct DoorbellBases {
    chdb: AtomicU32,
    erdb: AtomicU32,
}

impl DoorbellBases {
    pub(crate) fn set_bases(&self, chdb: u32, erdb: u32) {
        self.chdb.store(chdb, Ordering::Release);
        self.erdb.store(erdb, Ordering::Release);
    }

    pub(crate) fn channel(&self, chan: u32) -> u32 {
        self.chdb.load(Ordering::Acquire) + 8 * chan
    }

    pub(crate) fn event(&self, idx: usize) -> u32 {
        self.erdb.load(Ordering::Acquire) + 8 * idx as u32
    }
}

#[derive(Debug, Clone, Copy)]
enum DoorbellKind {
    Channel,
    Event,
    Command,
}

impl DoorbellKind {
    fn label(self) -> &'static str {
        match self {
            DoorbellKind::Channel => "channel",
            DoorbellKind::Event => "event",
            DoorbellKind::Command => "command",
        }
    }
}

fn write_db(dev: &DeviceContext, kind: DoorbellKind, offset: u32, value: u64) {
    log::trace!("{} doorbell {offset:#x} <- {value:#x}", kind.label());
    dev.regs.write_doorbell(offset, value);
    Counters::inc(&dev.counters.doorbell_writes);
    CounterMetric::doorbell_write(kind.label()).emit();
}

/// Publish the write cursor of a channel ring. Caller holds the ring lock.
pub(crate) fn ring_channel_db(dev: &DeviceContext, chan: &Channel, ring: &mut Ring) -> Result<()> {
    let wp = ring.wp_addr();
    dev.dma
        .write_val(chan.ctxt_addr + ChannelContext::WP_OFFSET as u64, wp)?;
    write_db(dev, DoorbellKind::Channel, dev.doorbells.channel(chan.id), wp);
    ring.take_db_pending();
    chan.set_db_mode(false);
    chan.reset_since_db();
    Ok(())
}

/// Return consumed slots of an event ring to the modem. Caller holds the
/// ring lock.
pub(crate) fn ring_event_db(dev: &DeviceContext, ctxt_addr: u64, idx: usize, st: &mut EventRingState) -> Result<()> {
    let wp = st.ring.wp_addr();
    dev.dma
        .write_val(ctxt_addr + EventContext::WP_OFFSET as u64, wp)?;
    write_db(dev, DoorbellKind::Event, dev.doorbells.event(idx), wp);
    st.ring.take_db_pending();
    st.since_db = 0;
    Ok(())
}

/// Publish the command ring write cursor. Caller holds the command lock.
pub(crate) fn ring_cmd_db(dev: &DeviceContext, ring: &mut Ring) -> Result<()> {
    let wp = ring.wp_addr();
    dev.dma
        .write_val(dev.layout.cmd_ctxt_addr() + CommandContext::WP_OFFSET as u64, wp)?;
    write_db(dev, DoorbellKind::Command, regs::CRDB, wp);
    ring.take_db_pending();
    Ok(())
}

/// Whether a doorbell may be written right now. When it may not, the
/// device is nudged toward M0: the wake line is asserted from M1/M2 and an
/// M0 entry is scheduled from M3.
pub(crate) fn doorbell_gate(dev: &DeviceContext) -> Result<bool> {
    let mut st = dev.power.lock()?;
    if st.can_ring_doorbells() {
        return Ok(true);
    }
    if st.pending_m3 || st.state == MhiState::M3 {
        log::debug!("Doorbell deferred in {:?}, scheduling M0 entry", st.state);
        dev.deferred.schedule(Job::EnterM0, Duration::ZERO);
    } else if st.link_up && matches!(st.state, MhiState::M1 | MhiState::M2) {
        log::debug!("Doorbell deferred in {:?}, asserting wake", st.state);
        dev.power.assert_wake(&mut st)?;
    }
    Ok(false)
}

fn can_ring(dev: &DeviceContext) -> Result<bool> {
    Ok(dev.power.lock()?.can_ring_doorbells())
}

/// Ring every running channel whose doorbell was deferred
pub(crate) fn ring_all_channel_dbs(dev: &DeviceContext) -> Result<()> {
    if !can_ring(dev)? {
        return Ok(());
    }
    for chan in dev.channels() {
        if chan.state()? != ChannelState::Running {
            continue;
        }
        let mut ring = chan.ring.lock();
        if ring.db_pending() {
            ring_channel_db(dev, chan, &mut ring)?;
        }
    }
    Ok(())
}

/// Ring every event ring whose doorbell was deferred
pub(crate) fn ring_all_event_dbs(dev: &DeviceContext) -> Result<()> {
    if !can_ring(dev)? {
        return Ok(());
    }
    for er in &dev.event_rings {
        let mut st = er.state.lock();
        if st.ring.db_pending() {
            ring_event_db(dev, er.ctxt_addr, er.index, &mut st)?;
        }
    }
    Ok(())
}

/// Ring the command doorbell if it was deferred
pub(crate) fn ring_pending_cmd_db(dev: &DeviceContext) -> Result<()> {
    if !can_ring(dev)? {
        return Ok(());
    }
    let mut cmds = dev.commands.lock()?;
    if cmds.ring.db_pending() {
        ring_cmd_db(dev, &mut cmds.ring)?;
    }
    Ok(())
}

/// Everything deferred, in event, channel, command order
pub(crate) fn ring_all(dev: &DeviceContext) -> Result<()> {
    ring_all_event_dbs(dev)?;
    ring_all_channel_dbs(dev)?;
    ring_pending_cmd_db(dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_offsets_are_eight_bytes_apart() {
        let bases = DoorbellBases::default();
        bases.set_bases(0x400, 0x800);
        assert_eq!(bases.channel(0), 0x400);
        assert_eq!(bases.channel(101), 0x400 + 808);
        assert_eq!(bases.event(3), 0x818);
    }
}
