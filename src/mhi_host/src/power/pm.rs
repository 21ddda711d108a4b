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

//! Host-initiated M0 and M3 entry.
//!
//! Both run outside the transition worker, either on the deferred executor
//! or on the caller of suspend/resume, because they wait for M-state
//! changes that only the transition worker can record.

use tracing::{Span, instrument};

use super::MhiState;
use super::deferred::Job;
use crate::counters::Counters;
use crate::device::DeviceContext;
use crate::doorbell;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::{MhiError, Result};

fn record_timeout(dev: &DeviceContext, target: MhiState) {
    let (counter, label) = match target {
        MhiState::M3 => (&dev.counters.m3_event_timeouts, "m3"),
        _ => (&dev.counters.m0_event_timeouts, "m0"),
    };
    Counters::inc(counter);
    CounterMetric::power_wait_timeout(label).emit();
    log::warn!("Timed out waiting for {target:?}");
}

/// Bring the device to M0 from M3, or hold it in M0 from M1/M2.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn initiate_m0(dev: &DeviceContext) -> Result<()> {
    let timeout = dev.config.power_wait_timeout();
    let st = dev.power.lock()?;
    // let an in-flight M-state change land first
    let (mut st, settled) = dev.power.wait_for(st, timeout, |s| {
        matches!(
            s.state,
            MhiState::M0 | MhiState::M1 | MhiState::M2 | MhiState::M3
        )
    })?;
    if st.stop {
        return Err(MhiError::WorkerUnavailable);
    }
    if !settled {
        record_timeout(dev, MhiState::M0);
        return Err(MhiError::DeviceNotReady);
    }

    if matches!(st.state, MhiState::M0 | MhiState::M1 | MhiState::M2) {
        if st.link_up {
            dev.power.assert_wake(&mut st)?;
        }
        return Ok(());
    }

    if !st.link_up {
        dev.power.platform().link_on()?;
        st.link_up = true;
    }
    if st.pending_m3 {
        return Err(MhiError::NotPermitted("M3 entry is in progress"));
    }

    st.pending_m0 = true;
    dev.power.assert_wake(&mut st)?;
    if let Err(e) = dev.regs.set_mhi_state(MhiState::M0) {
        st.pending_m0 = false;
        return Err(e);
    }

    let (mut st, reached) = dev
        .power
        .wait_for(st, timeout, |s| s.state == MhiState::M0)?;
    if !reached {
        st.pending_m0 = false;
        record_timeout(dev, MhiState::M0);
        return Err(MhiError::PowerStateTimeout(MhiState::M0));
    }
    log::info!("Device is in M0");
    Ok(())
}

/// Suspend the device to M3 and power the link down.
///
/// Refused with [`MhiError::ActivityPending`] while outbound buffers or
/// enqueues are in flight; in that case deferred doorbells are flushed so
/// the work can drain.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn initiate_m3(dev: &DeviceContext) -> Result<()> {
    {
        let mut st = dev.power.lock()?;
        match st.state {
            MhiState::M3 => {
                st.m3_work_queued = false;
                return if st.link_up {
                    Err(MhiError::NotPermitted("M3 entry is in progress"))
                } else {
                    Ok(())
                };
            }
            MhiState::Reset => {
                dev.power.platform().link_off()?;
                st.link_up = false;
                st.m3_work_queued = false;
                return Ok(());
            }
            MhiState::M0 | MhiState::M1 | MhiState::M2 => {}
            _ => return Err(MhiError::NotPermitted("device is not in an active state")),
        }
        if st.pending_m0 {
            return Err(MhiError::NotPermitted("M0 entry is in progress"));
        }
        if st.pending_m3 {
            return Err(MhiError::NotPermitted("M3 entry is in progress"));
        }
        st.pending_m3 = true;
    }

    let result = enter_m3(dev);

    let mut st = dev.power.lock()?;
    st.m3_work_queued = false;
    st.pending_m3 = false;
    dev.power.notify();
    result
}

fn enter_m3(dev: &DeviceContext) -> Result<()> {
    let timeout = dev.config.power_wait_timeout();
    let mut st = dev.power.lock()?;

    if matches!(st.state, MhiState::M1 | MhiState::M2) {
        dev.power.assert_wake(&mut st)?;
        let (guard, active) = dev.power.wait_for(st, timeout, |s| s.is_active())?;
        st = guard;
        if !active {
            record_timeout(dev, MhiState::M0);
            return Err(MhiError::PowerStateTimeout(MhiState::M0));
        }
    }

    let acks = dev.activity.outbound_acks();
    let pending = dev.activity.data_pending();
    if acks > 0 || pending > 0 {
        log::info!("M3 aborted, {acks} outbound acks and {pending} pending transfers");
        drop(st);
        doorbell::ring_all_channel_dbs(dev)?;
        let mut st = dev.power.lock()?;
        if st.m3_deferred_in_m1 {
            st.m3_deferred_in_m1 = false;
            st.state = MhiState::M2;
            dev.regs.set_mhi_state(MhiState::M2)?;
        }
        return Err(MhiError::ActivityPending(acks, pending));
    }

    dev.deferred.cancel(Job::IdleTimer);
    st.m3_deferred_in_m1 = false;
    dev.regs.set_mhi_state(MhiState::M3)?;

    let (mut st, reached) = dev
        .power
        .wait_for(st, timeout, |s| s.state == MhiState::M3)?;
    if !reached {
        record_timeout(dev, MhiState::M3);
        return Err(MhiError::PowerStateTimeout(MhiState::M3));
    }

    dev.power.deassert_wake(&mut st, true)?;
    dev.power.platform().link_off()?;
    st.link_up = false;
    log::info!("Device is in M3, link is off");
    Ok(())
}

/// Platform suspend
pub(crate) fn suspend(dev: &DeviceContext) -> Result<()> {
    initiate_m3(dev)
}

/// Platform resume. Deferred M0 entry is suppressed while it runs.
pub(crate) fn resume(dev: &DeviceContext) -> Result<()> {
    dev.power.lock()?.pending_resume = true;
    let result = initiate_m0(dev);
    dev.power.lock()?.pending_resume = false;
    result
}

fn escalate(dev: &DeviceContext, e: &MhiError) {
    if let Some(next) = e.escalation() {
        if let Err(post_err) = dev.transitions.post(next) {
            log::error!("Could not post {next:?}: {post_err}");
        }
    }
}

pub(crate) fn enter_m0_work(dev: &DeviceContext) {
    match dev.power.lock() {
        Ok(st) if st.pending_resume => {
            log::debug!("Resume in progress, skipping deferred M0 entry");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            log::error!("Deferred M0 entry: {e}");
            return;
        }
    }
    if let Err(e) = initiate_m0(dev) {
        log::error!("Deferred M0 entry failed: {e}");
        escalate(dev, &e);
    }
}

pub(crate) fn enter_m3_work(dev: &DeviceContext) {
    match initiate_m3(dev) {
        Ok(()) => {}
        Err(MhiError::ActivityPending(_, _)) => {
            log::debug!("Deferred M3 entry abandoned, device is busy");
        }
        Err(e) => {
            log::warn!("Deferred M3 entry failed: {e}");
            escalate(dev, &e);
        }
    }
}

/// Release the wake line once the device has been idle in M0 for the
/// M1 entry delay, or re-arm the timer if it has not.
pub(crate) fn idle_timer_expired(dev: &DeviceContext) {
    let mut st = match dev.power.lock() {
        Ok(st) => st,
        Err(e) => {
            log::error!("Idle timer: {e}");
            return;
        }
    };
    if st.state == MhiState::M0 && st.is_settled() && dev.activity.is_idle() && st.lpm_allowed {
        log::debug!("Device idle, releasing wake");
        if let Err(e) = dev.power.deassert_wake(&mut st, false) {
            log::error!("Could not release wake: {e}");
        }
    } else if matches!(st.state, MhiState::M0 | MhiState::M1 | MhiState::Ready) {
        dev.deferred
            .schedule(Job::IdleTimer, dev.config.m1_entry_delay());
    }
}
