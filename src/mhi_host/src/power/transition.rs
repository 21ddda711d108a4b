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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use super::deferred::Job;
use super::{ExecEnv, MhiState};
use crate::channel::{ChannelState, valid_channels};
use crate::client::{CallbackReason, notify_clients};
use crate::command::{self, Command};
use crate::counters::Counters;
use crate::device::DeviceContext;
use crate::doorbell;
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::mmio::init::{init_mmio, test_for_device_ready};
use crate::ring::context::write_cursors;
use crate::ring::{IPA_IN_EVENT_RING, IPA_OUT_EVENT_RING, PRIMARY_EVENT_RING, SOFTWARE_EVENT_RING};
use crate::{MhiError, Result};

/// A lifecycle step processed by the transition worker, in posting order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// Re-synchronise every ring and wait for READY
    Reset,
    /// Program the register space and request M0
    Ready,
    /// The device entered M0
    M0,
    /// The device entered M1
    M1,
    /// The device entered M2
    M2,
    /// The device entered M3
    M3,
    /// The device entered its boot host interface
    Bhi,
    /// The secondary boot loader is running
    Sbl,
    /// The main modem image is running
    Amss,
    /// The link was lost
    LinkDown,
    /// The link came back
    Wake,
    /// The device reported a fatal error
    SysErr,
}

impl StateTransition {
    /// Stable lower-case name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            StateTransition::Reset => "reset",
            StateTransition::Ready => "ready",
            StateTransition::M0 => "m0",
            StateTransition::M1 => "m1",
            StateTransition::M2 => "m2",
            StateTransition::M3 => "m3",
            StateTransition::Bhi => "bhi",
            StateTransition::Sbl => "sbl",
            StateTransition::Amss => "amss",
            StateTransition::LinkDown => "link_down",
            StateTransition::Wake => "wake",
            StateTransition::SysErr => "sys_err",
        }
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub(crate) enum TransitionWork {
    Transition(StateTransition),
    Stop,
}

/// Bounded FIFO feeding the transition worker
#[derive(Debug, Clone)]
pub(crate) struct TransitionQueue {
    tx: Sender<TransitionWork>,
}

impl TransitionQueue {
    pub(crate) fn new(depth: usize) -> (Self, Receiver<TransitionWork>) {
        let (tx, rx) = bounded(depth);
        (Self { tx }, rx)
    }

    /// Append a transition without blocking
    pub(crate) fn post(&self, t: StateTransition) -> Result<()> {
        log::debug!("Posting transition {t}");
        match self.tx.try_send(TransitionWork::Transition(t)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::error!("Transition queue is full, dropping {t}");
                Err(MhiError::TransitionQueueFull(t))
            }
            Err(TrySendError::Disconnected(_)) => Err(MhiError::WorkerUnavailable),
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(TransitionWork::Stop);
    }
}

/// Transition worker loop
pub(crate) fn run(dev: Arc<DeviceContext>, rx: Receiver<TransitionWork>) {
    for work in rx.iter() {
        let t = match work {
            TransitionWork::Transition(t) => t,
            TransitionWork::Stop => break,
        };
        match dev.power.lock() {
            Ok(st) if st.stop => continue,
            Ok(_) => {}
            Err(e) => {
                log::error!("Transition worker cannot read power state: {e}");
                break;
            }
        }
        process(&dev, t);
    }
    log::debug!("Transition worker stopped");
}

fn process(dev: &DeviceContext, t: StateTransition) {
    let span = tracing::info_span!("mhi_transition", transition = t.as_str());
    let _entered = span.enter();
    tracing::info!(transition = t.as_str(), "Processing state transition");
    CounterMetric::state_transition(t.as_str()).emit();

    let result = HistogramMetric::time_and_emit_transition(t.as_str(), || handle(dev, t));
    if let Err(e) = result {
        tracing::error!(transition = t.as_str(), error = %e, "State transition failed");
        if let Some(next) = e.escalation() {
            if next != t {
                if let Err(post_err) = dev.transitions.post(next) {
                    log::error!("Could not escalate to {next}: {post_err}");
                }
            }
        }
    }
}

fn handle(dev: &DeviceContext, t: StateTransition) -> Result<()> {
    match t {
        StateTransition::Reset => handle_reset(dev),
        StateTransition::Ready => handle_ready(dev),
        StateTransition::M0 => handle_m0(dev),
        StateTransition::M1 => handle_m1(dev),
        StateTransition::M2 => record_state(dev, MhiState::M2),
        StateTransition::M3 => handle_m3(dev),
        StateTransition::Bhi => handle_bhi(dev),
        StateTransition::Sbl => handle_sbl(dev),
        StateTransition::Amss => handle_amss(dev),
        StateTransition::LinkDown => handle_link_down(dev),
        StateTransition::Wake => handle_wake(dev),
        StateTransition::SysErr => handle_sys_err(dev),
    }
}

fn record_state(dev: &DeviceContext, state: MhiState) -> Result<()> {
    dev.power.lock()?.state = state;
    dev.power.notify();
    Ok(())
}

/// Return every ring to empty and publish `rp == wp == base` in its context
fn resync_rings(dev: &DeviceContext) -> Result<()> {
    {
        let mut cmds = dev.commands.lock()?;
        cmds.reset();
        let base = cmds.ring.base();
        write_cursors(dev.dma.as_ref(), dev.layout.cmd_ctxt_addr(), base, base)?;
    }
    dev.starts.reset();

    for er in &dev.event_rings {
        let mut st = er.state.lock();
        st.ring.reset();
        st.props.set_initialised(false);
        st.since_db = 0;
        let base = st.ring.base();
        write_cursors(dev.dma.as_ref(), er.ctxt_addr, base, base)?;
    }

    for chan in dev.channels() {
        let mut ring = chan.ring.lock();
        ring.reset();
        chan.set_db_mode(false);
        chan.reset_since_db();
        chan.clear_outbound_acks();
        let base = ring.base();
        write_cursors(dev.dma.as_ref(), chan.ctxt_addr, base, base)?;
    }
    dev.activity.clear_acks();
    Ok(())
}

fn handle_reset(dev: &DeviceContext) -> Result<()> {
    let count = {
        let mut st = dev.power.lock()?;
        if st.faulted {
            log::warn!("Device is faulted, ignoring RESET");
            return Ok(());
        }
        st.reset_count += 1;
        st.state = MhiState::Reset;
        st.exec_env = None;
        st.reset_count
    };
    Counters::inc(&dev.counters.device_resets);
    CounterMetric::device_reset().emit();

    if count >= dev.config.max_resets() {
        let err = MhiError::UnrecoverableReset(count as u32);
        dev.power.lock()?.faulted = true;
        log::error!("{err}, giving up");
        dev.power.platform().report_unrecoverable(&err);
        return Err(err);
    }

    resync_rings(dev)?;

    match test_for_device_ready(&dev.regs, &dev.config) {
        Ok(()) => {
            {
                let mut st = dev.power.lock()?;
                st.reset_count = 0;
                st.state = MhiState::Ready;
            }
            dev.power.notify();
            dev.transitions.post(StateTransition::Ready)
        }
        Err(MhiError::DeviceNotReady) => {
            log::warn!("Device not ready after reset {count}, retrying");
            dev.transitions.post(StateTransition::Reset)
        }
        Err(MhiError::LinkDown) => {
            log::error!("Link is down while waiting for READY");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Fill an event ring with free slots and hand it to the modem. A ring
/// already handed over only has its doorbell rung.
fn prefill_event_ring(dev: &DeviceContext, idx: usize) -> Result<()> {
    let Some(er) = dev.event_rings.get(idx) else {
        return Ok(());
    };
    let mut st = er.state.lock();
    if !st.props.initialised() {
        st.ring.reset();
        for _ in 0..st.ring.capacity() - 1 {
            st.ring.add_element()?;
        }
        let base = st.ring.base();
        let wp = st.ring.wp_addr();
        write_cursors(dev.dma.as_ref(), er.ctxt_addr, base, wp)?;
        st.props.set_initialised(true);
    }
    doorbell::ring_event_db(dev, er.ctxt_addr, er.index, &mut st)
}

fn handle_ready(dev: &DeviceContext) -> Result<()> {
    record_state(dev, MhiState::Ready)?;
    init_mmio(dev)?;
    for idx in [PRIMARY_EVENT_RING, SOFTWARE_EVENT_RING] {
        prefill_event_ring(dev, idx)?;
    }
    dev.regs.set_mhi_state(MhiState::M0)
}

fn handle_m0(dev: &DeviceContext) -> Result<()> {
    dev.deferred.cancel(Job::EnterM3);
    {
        let mut st = dev.power.lock()?;
        st.m3_work_queued = false;
        match st.state {
            MhiState::M1 => Counters::inc(&dev.counters.m1_m0),
            MhiState::M2 => Counters::inc(&dev.counters.m2_m0),
            MhiState::M3 => Counters::inc(&dev.counters.m3_m0),
            MhiState::Ready | MhiState::M0 => {}
            other => log::warn!("M0 reported from {other:?}"),
        }
        st.state = MhiState::M0;
        dev.power.assert_wake(&mut st)?;
    }

    doorbell::ring_all(dev)?;

    {
        let mut st = dev.power.lock()?;
        st.pending_m0 = false;
        st.m3_deferred_in_m1 = false;
    }
    dev.power.notify();
    dev.deferred
        .schedule(Job::IdleTimer, dev.config.m1_entry_delay());
    Ok(())
}

fn handle_m1(dev: &DeviceContext) -> Result<()> {
    Counters::inc(&dev.counters.m0_m1);
    dev.deferred.cancel(Job::IdleTimer);

    let mut st = dev.power.lock()?;
    if !st.link_up {
        return Err(MhiError::LinkDown);
    }
    st.state = MhiState::M1;
    if st.pending_m3 {
        st.m3_deferred_in_m1 = true;
    } else {
        st.state = MhiState::M2;
        dev.regs.set_mhi_state(MhiState::M2)?;
        Counters::inc(&dev.counters.m1_m2);
    }
    if !st.m3_work_queued {
        st.m3_work_queued = true;
        dev.deferred
            .schedule(Job::EnterM3, dev.config.m3_entry_delay());
    }
    drop(st);
    dev.power.notify();
    Ok(())
}

fn handle_m3(dev: &DeviceContext) -> Result<()> {
    dev.deferred.cancel(Job::IdleTimer);
    {
        let mut st = dev.power.lock()?;
        st.state = MhiState::M3;
        st.pending_m3 = false;
    }
    Counters::inc(&dev.counters.m0_m3);
    dev.power.notify();
    Ok(())
}

fn handle_bhi(dev: &DeviceContext) -> Result<()> {
    {
        let mut st = dev.power.lock()?;
        st.state = MhiState::Bhi;
        st.exec_env = None;
    }
    log::info!("Device entered BHI");
    dev.power.notify();
    Ok(())
}

/// Send START to every ENABLED channel in `chans` and wait for all of them
fn start_channels(dev: &DeviceContext, chans: impl Iterator<Item = u32>) -> Result<()> {
    for chan in chans {
        if dev.channel(chan)?.state()? != ChannelState::Enabled {
            continue;
        }
        dev.starts.add();
        if let Err(e) = command::send_command(dev, Command::Start, chan, true) {
            dev.starts.complete();
            log::warn!("Could not start channel {chan}: {e}");
        }
    }
    dev.starts.wait(dev.config.channel_start_timeout())
}

fn handle_sbl(dev: &DeviceContext) -> Result<()> {
    dev.power.lock()?.exec_env = Some(ExecEnv::Sbl);
    log::info!("Device is running SBL");
    start_channels(dev, 0..=3)
}

fn handle_amss(dev: &DeviceContext) -> Result<()> {
    let _data = dev.activity.begin_data();
    {
        let mut st = dev.power.lock()?;
        st.exec_env = Some(ExecEnv::Amss);
        dev.power.assert_wake(&mut st)?;
    }
    log::info!("Device is running AMSS");

    for idx in [SOFTWARE_EVENT_RING, IPA_OUT_EVENT_RING, IPA_IN_EVENT_RING] {
        prefill_event_ring(dev, idx)?;
    }
    let started = start_channels(dev, valid_channels());

    let first = {
        let mut st = dev.power.lock()?;
        let first = !st.initialized;
        st.initialized = true;
        first
    };
    if first {
        doorbell::ring_all(dev)?;
        notify_clients(dev, CallbackReason::MhiEnabled)?;
    }
    started
}

fn handle_link_down(dev: &DeviceContext) -> Result<()> {
    log::error!("Link down, quiescing the device");
    notify_clients(dev, CallbackReason::MhiDisabled)?;
    {
        let mut st = dev.power.lock()?;
        st.initialized = false;
        st.state = MhiState::Reset;
        st.pending_m0 = false;
        st.m3_work_queued = false;
        dev.power.deassert_wake(&mut st, true)?;
    }
    dev.deferred.cancel_all();

    dev.power.platform().link_off()?;
    dev.power.lock()?.link_up = false;
    Counters::inc(&dev.counters.link_down);
    dev.activity.clear_data_pending();
    dev.power.notify();
    Ok(())
}

fn handle_wake(dev: &DeviceContext) -> Result<()> {
    dev.power.platform().link_on()?;
    let initialized = {
        let mut st = dev.power.lock()?;
        st.link_up = true;
        st.initialized
    };
    if initialized {
        dev.deferred.schedule(Job::EnterM0, Duration::ZERO);
        Ok(())
    } else {
        dev.transitions.post(StateTransition::Reset)
    }
}

fn handle_sys_err(dev: &DeviceContext) -> Result<()> {
    Counters::inc(&dev.counters.sys_err);
    log::error!("Device reported SYS_ERR");
    let was_initialized = {
        let mut st = dev.power.lock()?;
        let was = st.initialized;
        st.initialized = false;
        st.state = MhiState::Reset;
        was
    };
    if was_initialized {
        notify_clients(dev, CallbackReason::MhiDisabled)?;
    }
    dev.power.notify();
    dev.transitions.post(StateTransition::Reset)
}
