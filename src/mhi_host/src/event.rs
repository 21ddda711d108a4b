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

//! Event ring processing.
//!
//! An MSI wakes the event worker, which drains the signalled ring up to the
//! modem's write position. Each element is returned to the modem as soon as
//! it is read; the event doorbell is batched. Client callbacks are collected
//! while locks are held and invoked once the ring is released.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_channel::{Receiver, Sender, unbounded};
use smallvec::SmallVec;

use crate::channel::{Channel, ChannelState, Direction};
use crate::client::{CallbackReason, PendingCallback, TransferResult, TransferStatus};
use crate::command::{self, Command};
use crate::counters::Counters;
use crate::device::DeviceContext;
use crate::doorbell::{doorbell_gate, ring_channel_db, ring_event_db};
use crate::mem::DmaOpsExt;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::power::{ExecEnv, MhiState, StateTransition};
use crate::ring::context::{EventContext, EventRingProperties, write_cursors};
use crate::ring::elements::{CompletionCode, EventElement, PacketType, TransferElement};
use crate::ring::{Ring, TRB_MAX_DATA_SIZE};
use crate::{MhiError, Result, new_error};

type Callbacks = SmallVec<[PendingCallback; 8]>;

/// Event ring cursors and host-local properties, behind the ring lock
#[derive(Debug)]
pub(crate) struct EventRingState {
    pub(crate) ring: Ring,
    pub(crate) props: EventRingProperties,
    /// Elements consumed since the last doorbell
    pub(crate) since_db: u32,
}

#[derive(Debug)]
pub(crate) struct EventRing {
    pub(crate) index: usize,
    pub(crate) ctxt_addr: u64,
    pub(crate) intmod: u16,
    pub(crate) state: spin::Mutex<EventRingState>,
}

impl EventRing {
    pub(crate) fn new(index: usize, ctxt_addr: u64, intmod: u16, ring: Ring) -> Self {
        Self {
            index,
            ctxt_addr,
            intmod,
            state: spin::Mutex::new(EventRingState {
                ring,
                props: EventRingProperties::new(index as u32),
                since_db: 0,
            }),
        }
    }

    pub(crate) fn msi_vector(&self) -> u32 {
        self.state.lock().props.msi_vector()
    }
}

#[derive(Debug)]
pub(crate) enum EventWork {
    Msi(u32),
    Stop,
}

/// Sending side of the event worker
#[derive(Debug, Clone)]
pub(crate) struct EventQueue {
    tx: Sender<EventWork>,
}

impl EventQueue {
    pub(crate) fn new() -> (Self, Receiver<EventWork>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub(crate) fn signal(&self, msi_vector: u32) {
        if self.tx.send(EventWork::Msi(msi_vector)).is_err() {
            log::debug!("Event worker is gone, dropping MSI {msi_vector}");
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(EventWork::Stop);
    }
}

/// Event worker loop
pub(crate) fn run(dev: Arc<DeviceContext>, rx: Receiver<EventWork>) {
    for work in rx.iter() {
        match work {
            EventWork::Msi(vector) => process_event_ring(&dev, vector as usize),
            EventWork::Stop => break,
        }
    }
    log::debug!("Event worker stopped");
}

fn escalate(dev: &DeviceContext, e: &MhiError) {
    if let Some(next) = e.escalation() {
        if let Err(post_err) = dev.transitions.post(next) {
            log::error!("Could not post {next}: {post_err}");
        }
    }
}

/// Drain up to the event quota from ring `idx`. If the quota is reached the
/// MSI is re-signalled so the rest is picked up on the next pass.
pub(crate) fn process_event_ring(dev: &DeviceContext, idx: usize) {
    let Some(er) = dev.event_rings.get(idx) else {
        log::warn!("MSI {idx} has no event ring");
        return;
    };
    let quota = dev.config.event_quota() as usize;
    let mut callbacks = Callbacks::new();
    let mut processed = 0;

    while processed < quota {
        let el = match next_event(dev, er) {
            Ok(Some(el)) => el,
            Ok(None) => break,
            Err(e) => {
                log::error!("Event ring {idx}: {e}");
                escalate(dev, &e);
                break;
            }
        };
        processed += 1;
        Counters::inc(&dev.counters.events_processed);
        if let Err(e) = dispatch(dev, idx, &el, &mut callbacks) {
            log::error!("Event {:#x} on ring {idx} failed: {e}", el.raw_type());
            escalate(dev, &e);
        }
    }

    if processed == quota {
        log::trace!("Event quota reached on ring {idx}");
        dev.events.signal(er.msi_vector());
    }

    for cb in callbacks {
        cb.invoke();
    }
}

/// Take the next element the modem wrote, if any, and give its slot back
fn next_event(dev: &DeviceContext, er: &EventRing) -> Result<Option<EventElement>> {
    let mut st = er.state.lock();
    if !st.props.initialised() {
        return Ok(None);
    }
    let dev_rp: u64 = dev
        .dma
        .read_val(er.ctxt_addr + EventContext::RP_OFFSET as u64)?;
    st.ring.addr_to_index(dev_rp)?;
    if st.ring.rp_addr() == dev_rp {
        return Ok(None);
    }

    let el: EventElement = dev.dma.read_val(st.ring.rp_addr())?;
    st.ring.delete_element()?;
    st.ring.add_element()?;
    st.since_db += 1;

    if st.since_db >= dev.config.event_db_interval() as u32
        && dev.power.lock()?.can_ring_doorbells()
    {
        ring_event_db(dev, er.ctxt_addr, er.index, &mut st)?;
    } else {
        st.ring.mark_db_pending();
    }
    Ok(Some(el))
}

fn dispatch(dev: &DeviceContext, idx: usize, el: &EventElement, cbs: &mut Callbacks) -> Result<()> {
    match el.packet_type() {
        Some(PacketType::TxEvent) => handle_transfer_event(dev, el, cbs),
        Some(PacketType::CmdCompletionEvent) => handle_command_completion(dev, el, cbs),
        Some(PacketType::StateChangeEvent) => {
            let t = match MhiState::from_raw(el.state()) {
                Some(MhiState::M0) => StateTransition::M0,
                Some(MhiState::M1) => StateTransition::M1,
                Some(MhiState::M2) => StateTransition::M2,
                Some(MhiState::M3) => StateTransition::M3,
                Some(MhiState::Ready) => StateTransition::Ready,
                Some(MhiState::SysErr) => StateTransition::SysErr,
                Some(MhiState::Bhi) => StateTransition::Bhi,
                other => {
                    log::warn!("Ignoring state change to {other:?} ({:#x})", el.state());
                    return Ok(());
                }
            };
            log::debug!("Device reported state {t}");
            dev.transitions.post(t)
        }
        Some(PacketType::EeEvent) => match ExecEnv::from_raw(el.env()) {
            Some(ExecEnv::Sbl) => dev.transitions.post(StateTransition::Sbl),
            Some(ExecEnv::Amss) => dev.transitions.post(StateTransition::Amss),
            None => {
                log::warn!("Ignoring unknown execution environment {:#x}", el.env());
                Ok(())
            }
        },
        _ => {
            log::warn!("Unexpected element type {:#x} on event ring {idx}", el.raw_type());
            Ok(())
        }
    }
}

fn handle_transfer_event(dev: &DeviceContext, el: &EventElement, cbs: &mut Callbacks) -> Result<()> {
    let chan = dev.channel(el.channel())?;
    match el.code() {
        Some(
            CompletionCode::Success
            | CompletionCode::Eot
            | CompletionCode::Eob
            | CompletionCode::Overflow,
        ) => process_completions(dev, chan, el, cbs),
        Some(CompletionCode::Oob | CompletionCode::DbMode) => {
            log::debug!("Channel {} switched to doorbell mode", chan.id);
            chan.set_db_mode(true);
            dev.counters.offload_enabled.store(true, Ordering::Release);
            if chan.state()? != ChannelState::Running {
                return Ok(());
            }
            let mut ring = chan.ring.lock();
            if ring.nr_pending() > 0 || ring.db_pending() {
                if doorbell_gate(dev)? {
                    ring_channel_db(dev, chan, &mut ring)?;
                } else {
                    ring.mark_db_pending();
                }
            }
            Ok(())
        }
        _ => {
            Counters::inc(&dev.counters.transfer_errors);
            log::error!(
                "Transfer error {:#x} on channel {} at {:#x}",
                el.raw_code(),
                chan.id,
                el.ptr
            );
            if let Some(client) = chan.client()? {
                let buf_addr = dev
                    .dma
                    .read_val::<TransferElement>(el.ptr)
                    .map(|tre| tre.buffer_ptr)
                    .unwrap_or(0);
                cbs.push(PendingCallback::new(
                    client,
                    chan.id,
                    CallbackReason::TransferError,
                    Some(TransferResult {
                        buf_addr,
                        bytes: 0,
                        status: TransferStatus::Error,
                    }),
                ));
            }
            Ok(())
        }
    }
}

/// Consume transfer elements up to and including the one the event points
/// at. Inbound channels report the event length on the last element.
fn process_completions(
    dev: &DeviceContext,
    chan: &Channel,
    el: &EventElement,
    cbs: &mut Callbacks,
) -> Result<()> {
    let client = chan.client()?;
    let mut empty_inbound = false;
    {
        let mut ring = chan.ring.lock();
        let target = ring.addr_to_index(el.ptr)?;
        if ring.is_empty() {
            match chan.direction {
                Direction::Inbound => empty_inbound = true,
                Direction::Outbound => {
                    log::warn!("Completion on empty outbound channel {}", chan.id);
                    return Ok(());
                }
            }
        } else {
            let consumed = ring.nr_enclosed(ring.rp(), target) + 1;
            if consumed > ring.nr_pending() {
                return Err(new_error!(
                    "Completion at {:#x} on channel {} is past the write cursor",
                    el.ptr,
                    chan.id
                ));
            }

            let mut recycled = false;
            for i in 0..consumed {
                let addr = ring.rp_addr();
                let mut tre: TransferElement = dev.dma.read_val(addr)?;
                let bytes = match chan.direction {
                    Direction::Inbound if i + 1 == consumed => el.xfer_len(),
                    _ => tre.buf_len(),
                };
                ring.delete_element()?;
                Counters::inc(&dev.counters.transfer_completions);
                CounterMetric::transfer_completion(chan.id).emit();
                chan.count_packet();

                let in_window = dev.config.buffer_in_window(tre.buffer_ptr, bytes as usize);
                if !in_window {
                    log::error!(
                        "Channel {} completed buffer {:#x} outside the DMA window",
                        chan.id,
                        tre.buffer_ptr
                    );
                }

                match chan.direction {
                    Direction::Outbound => {
                        if chan.complete_outbound_ack() {
                            dev.activity.complete_acks(1);
                        }
                    }
                    Direction::Inbound => {
                        if bytes != tre.buf_len() {
                            tre.set_len(bytes);
                            dev.dma.write_val(addr, tre)?;
                        }
                        if client.is_none() && chan.is_hardware() {
                            ring.acknowledge()?;
                            tre.set_len(TRB_MAX_DATA_SIZE);
                            let wp = ring.add_element()?;
                            dev.dma.write_val(wp, tre)?;
                            recycled = true;
                            continue;
                        }
                    }
                }

                if let Some(client) = &client {
                    if client.should_notify() {
                        let status = match (in_window, el.code()) {
                            (false, _) => TransferStatus::Error,
                            (true, Some(CompletionCode::Overflow)) => TransferStatus::Overflow,
                            (true, _) => TransferStatus::Success,
                        };
                        let reason = match status {
                            TransferStatus::Error => CallbackReason::TransferError,
                            _ => CallbackReason::TransferSuccess,
                        };
                        cbs.push(PendingCallback::new(
                            client.clone(),
                            chan.id,
                            reason,
                            Some(TransferResult {
                                buf_addr: tre.buffer_ptr,
                                bytes: bytes as usize,
                                status,
                            }),
                        ));
                    }
                }
            }

            if recycled {
                if doorbell_gate(dev)? {
                    ring_channel_db(dev, chan, &mut ring)?;
                } else {
                    ring.mark_db_pending();
                }
            }
        }
    }

    if empty_inbound {
        Counters::inc(&dev.counters.empty_ring_removals);
        log::warn!("Completion on empty inbound channel {}, resetting it", chan.id);
        command::send_command(dev, Command::Reset, chan.id, false)?;
    }
    Ok(())
}

fn handle_command_completion(
    dev: &DeviceContext,
    el: &EventElement,
    cbs: &mut Callbacks,
) -> Result<()> {
    let (cmd_el, pending) = command::take_completed(dev, el.ptr)?;
    let chan_id = cmd_el.channel();
    let Some(cmd) = cmd_el.packet_type().and_then(Command::from_packet_type) else {
        log::warn!("Completion for a non-command element at {:#x}", el.ptr);
        return Ok(());
    };
    let bulk = pending.is_some_and(|p| p.bulk_start);

    if el.code() != Some(CompletionCode::Success) {
        log::error!(
            "{cmd:?} on channel {chan_id} failed with code {:#x}",
            el.raw_code()
        );
        if bulk {
            dev.starts.complete();
        }
        return Ok(());
    }
    log::debug!("{cmd:?} on channel {chan_id} completed");

    match cmd {
        Command::Noop => {}
        Command::Start => {
            let chan = dev.channel(chan_id)?;
            chan.set_state(dev.dma.as_ref(), ChannelState::Running)?;
            if bulk {
                dev.starts.complete();
            }
            let mut ring = chan.ring.lock();
            if ring.db_pending() && doorbell_gate(dev)? {
                ring_channel_db(dev, chan, &mut ring)?;
            }
        }
        Command::Stop => dev
            .channel(chan_id)?
            .set_state(dev.dma.as_ref(), ChannelState::Stop)?,
        Command::Reset => {
            let chan = dev.channel(chan_id)?;
            {
                let mut ring = chan.ring.lock();
                ring.reset();
                let base = ring.base();
                write_cursors(dev.dma.as_ref(), chan.ctxt_addr, base, base)?;
            }
            chan.set_state(dev.dma.as_ref(), ChannelState::Enabled)?;
            chan.set_db_mode(false);
            chan.reset_since_db();
            let dropped = chan.clear_outbound_acks();
            dev.activity.complete_acks(dropped);
            command::send_command(dev, Command::Start, chan_id, false)?;
            if let Some(client) = chan.client()? {
                cbs.push(PendingCallback::new(
                    client,
                    chan_id,
                    CallbackReason::ChannelResetComplete,
                    None,
                ));
            }
        }
    }
    Ok(())
}
