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

//! Power state, the wake line and the lifecycle state machine.
//!
//! All power flags live in one [`PowerState`] behind one lock, paired with a
//! condition variable that M0/M3 waiters block on. The transition worker
//! is the main writer; deferred M0/M3 entry and the idle timer run on the
//! deferred executor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::{MhiError, Result};

/// Deferred M0/M3 entry and the idle timer
pub(crate) mod deferred;
/// M0 and M3 entry, suspend and resume
pub(crate) mod pm;
/// The transition queue, its worker and the transition handlers
pub(crate) mod transition;

pub use transition::StateTransition;

/// Device MHI state, in register encoding
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MhiState {
    /// Reset
    Reset = 0,
    /// Ready to be programmed
    Ready = 1,
    /// Fully active
    M0 = 2,
    /// Idle, the link may enter low power
    M1 = 3,
    /// Idle with the link in low power
    M2 = 4,
    /// Suspended
    M3 = 5,
    /// Boot host interface
    Bhi = 7,
    /// System error
    SysErr = 0xFF,
}

impl MhiState {
    /// Decode a state field
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => MhiState::Reset,
            1 => MhiState::Ready,
            2 => MhiState::M0,
            3 => MhiState::M1,
            4 => MhiState::M2,
            5 => MhiState::M3,
            7 => MhiState::Bhi,
            0xFF => MhiState::SysErr,
            _ => return None,
        })
    }
}

/// Execution environment reported by the modem
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEnv {
    /// Secondary boot loader
    Sbl = 1,
    /// Main modem image
    Amss = 2,
}

impl ExecEnv {
    /// Decode an execution environment field
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ExecEnv::Sbl),
            2 => Some(ExecEnv::Amss),
            _ => None,
        }
    }
}

/// Platform control of the link and the device-wake line.
pub trait PlatformOps: Send + Sync {
    /// Drive the device-wake line
    fn assert_wake(&self) -> anyhow::Result<()>;
    /// Release the device-wake line
    fn deassert_wake(&self) -> anyhow::Result<()>;
    /// Power the link up
    fn link_on(&self) -> anyhow::Result<()>;
    /// Power the link down
    fn link_off(&self) -> anyhow::Result<()>;
    /// The device could not be recovered and needs supervisor action
    fn report_unrecoverable(&self, reason: &MhiError);
}

/// Power flags shared by the state machine and the data path
#[derive(Debug)]
pub(crate) struct PowerState {
    pub(crate) state: MhiState,
    pub(crate) exec_env: Option<ExecEnv>,
    pub(crate) link_up: bool,
    /// Channels were started by AMSS and clients notified
    pub(crate) initialized: bool,
    pub(crate) pending_m0: bool,
    pub(crate) pending_m3: bool,
    pub(crate) pending_resume: bool,
    /// An M3 request arrived while in M1, so M2 entry was skipped
    pub(crate) m3_deferred_in_m1: bool,
    pub(crate) m3_work_queued: bool,
    pub(crate) wake_asserted: bool,
    /// Clients allow the wake line to be released
    pub(crate) lpm_allowed: bool,
    pub(crate) stop: bool,
    pub(crate) faulted: bool,
    pub(crate) reset_count: u16,
}

impl PowerState {
    fn new() -> Self {
        Self {
            state: MhiState::Reset,
            exec_env: None,
            link_up: true,
            initialized: false,
            pending_m0: false,
            pending_m3: false,
            pending_resume: false,
            m3_deferred_in_m1: false,
            m3_work_queued: false,
            wake_asserted: false,
            lpm_allowed: true,
            stop: false,
            faulted: false,
            reset_count: 0,
        }
    }

    /// Doorbells reach the device only in M0 with the link up
    pub(crate) fn can_ring_doorbells(&self) -> bool {
        self.link_up && self.state == MhiState::M0 && !self.stop
    }

    /// M0 or M1
    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, MhiState::M0 | MhiState::M1)
    }

    /// No power transition is in flight
    pub(crate) fn is_settled(&self) -> bool {
        !self.pending_m0 && !self.pending_m3
    }
}

/// Outstanding work that keeps the device out of low power
#[derive(Debug, Default)]
pub(crate) struct Activity {
    outbound_acks: AtomicU64,
    data_pending: AtomicU64,
}

/// Holds one unit of pending data until dropped
pub(crate) struct DataPendingGuard<'a>(&'a Activity);

impl Drop for DataPendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .data_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl Activity {
    pub(crate) fn outbound_acks(&self) -> u64 {
        self.outbound_acks.load(Ordering::Acquire)
    }

    pub(crate) fn data_pending(&self) -> u64 {
        self.data_pending.load(Ordering::Acquire)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.outbound_acks() == 0 && self.data_pending() == 0
    }

    pub(crate) fn add_ack(&self) {
        self.outbound_acks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete_acks(&self, n: u64) {
        let _ = self
            .outbound_acks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(n))
            });
    }

    pub(crate) fn clear_acks(&self) {
        self.outbound_acks.store(0, Ordering::Release);
    }

    pub(crate) fn begin_data(&self) -> DataPendingGuard<'_> {
        self.data_pending.fetch_add(1, Ordering::AcqRel);
        DataPendingGuard(self)
    }

    pub(crate) fn clear_data_pending(&self) {
        self.data_pending.store(0, Ordering::Release);
    }
}

/// The power lock, its condition variable and the platform hooks
pub(crate) struct PowerManager {
    state: Mutex<PowerState>,
    changed: Condvar,
    platform: Arc<dyn PlatformOps>,
}

impl std::fmt::Debug for PowerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerManager")
            .field("state", &self.state)
            .finish()
    }
}

impl PowerManager {
    pub(crate) fn new(platform: Arc<dyn PlatformOps>) -> Self {
        Self {
            state: Mutex::new(PowerState::new()),
            changed: Condvar::new(),
            platform,
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, PowerState>> {
        Ok(self.state.lock()?)
    }

    pub(crate) fn platform(&self) -> &dyn PlatformOps {
        self.platform.as_ref()
    }

    /// Wake every waiter to re-check its condition
    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    /// Wait up to `timeout` for `done` to hold. Returns the guard and
    /// whether `done` held; a stop request ends the wait early.
    pub(crate) fn wait_for<'a>(
        &self,
        guard: MutexGuard<'a, PowerState>,
        timeout: Duration,
        mut done: impl FnMut(&PowerState) -> bool,
    ) -> Result<(MutexGuard<'a, PowerState>, bool)> {
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |st| !st.stop && !done(st))
            .map_err(|e| MhiError::LockAttemptFailed(e.to_string()))?;
        let satisfied = done(&guard);
        Ok((guard, satisfied))
    }

    pub(crate) fn assert_wake(&self, st: &mut PowerState) -> Result<()> {
        self.platform.assert_wake()?;
        st.wake_asserted = true;
        Ok(())
    }

    /// Release the wake line. Unless `force` is set, a client veto on low
    /// power keeps it asserted.
    pub(crate) fn deassert_wake(&self, st: &mut PowerState, force: bool) -> Result<()> {
        if !force && !st.lpm_allowed {
            log::trace!("Low power vetoed, keeping wake asserted");
            return Ok(());
        }
        self.platform.deassert_wake()?;
        st.wake_asserted = false;
        Ok(())
    }

    /// Set the stop flag and release every waiter
    pub(crate) fn stop(&self) {
        match self.state.lock() {
            Ok(mut st) => st.stop = true,
            Err(e) => e.into_inner().stop = true,
        }
        self.notify();
    }
}
