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

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{Span, instrument};

use crate::channel::{ChannelState, MAX_CHANNELS};
use crate::device::DeviceContext;
use crate::doorbell::{doorbell_gate, ring_cmd_db};
use crate::mem::DmaOpsExt;
use crate::ring::Ring;
use crate::ring::elements::{CommandElement, PacketType};
use crate::{MhiError, Result, new_error};

/// A channel command placed on the command ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// No operation
    Noop,
    /// Start moving data on the channel
    Start,
    /// Stop the channel
    Stop,
    /// Reset the channel ring
    Reset,
}

impl Command {
    fn packet_type(self) -> PacketType {
        match self {
            Command::Noop => PacketType::NoopCmd,
            Command::Start => PacketType::StartChanCmd,
            Command::Stop => PacketType::StopChanCmd,
            Command::Reset => PacketType::ResetChanCmd,
        }
    }

    pub(crate) fn from_packet_type(kind: PacketType) -> Option<Self> {
        match kind {
            PacketType::NoopCmd => Some(Command::Noop),
            PacketType::StartChanCmd => Some(Command::Start),
            PacketType::StopChanCmd => Some(Command::Stop),
            PacketType::ResetChanCmd => Some(Command::Reset),
            _ => None,
        }
    }

    /// Whether a channel in `state` accepts this command
    fn allowed_in(self, state: ChannelState) -> bool {
        match self {
            Command::Start => matches!(state, ChannelState::Enabled | ChannelState::Stop),
            Command::Stop => matches!(state, ChannelState::Running | ChannelState::Suspended),
            Command::Reset | Command::Noop => true,
        }
    }
}

/// A command waiting for its completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingCommand {
    pub(crate) cmd: Command,
    /// Part of a bulk channel start tracked by [`StartTracker`]
    pub(crate) bulk_start: bool,
}

#[derive(Debug)]
pub(crate) struct CommandState {
    pub(crate) ring: Ring,
    pending: Vec<Option<PendingCommand>>,
}

impl CommandState {
    pub(crate) fn reset(&mut self) {
        self.ring.reset();
        self.pending.iter_mut().for_each(|p| *p = None);
    }

    pub(crate) fn pending(&self, chan: u32) -> Option<PendingCommand> {
        self.pending.get(chan as usize).copied().flatten()
    }
}

/// The command ring and the per-channel pending command slots
#[derive(Debug)]
pub(crate) struct CommandEngine {
    inner: Mutex<CommandState>,
}

impl CommandEngine {
    pub(crate) fn new(ring: Ring) -> Self {
        Self {
            inner: Mutex::new(CommandState {
                ring,
                pending: vec![None; MAX_CHANNELS as usize],
            }),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, CommandState>> {
        Ok(self.inner.lock()?)
    }
}

/// Place `cmd` for `chan` on the command ring and ring the command
/// doorbell, or defer the doorbell until the device is in M0.
///
/// At most one non-NOOP command may be outstanding per channel.
#[instrument(err(Debug), skip(dev), parent = Span::current(), level = "Trace")]
pub(crate) fn send_command(
    dev: &DeviceContext,
    cmd: Command,
    chan: u32,
    bulk_start: bool,
) -> Result<()> {
    let channel = dev.channel(chan)?;
    let inner = channel.lock()?;
    if !cmd.allowed_in(inner.state) {
        return Err(MhiError::InvalidChannelState(chan, inner.state));
    }

    let mut cmds = dev.commands.lock()?;
    if cmd != Command::Noop && cmds.pending(chan).is_some() {
        return Err(MhiError::CommandPending(chan));
    }

    let addr = cmds.ring.add_element()?;
    dev.dma
        .write_val(addr, CommandElement::new(cmd.packet_type(), chan))?;
    if cmd != Command::Noop {
        cmds.pending[chan as usize] = Some(PendingCommand { cmd, bulk_start });
    }
    log::debug!("Queued {cmd:?} for channel {chan} at {addr:#x}");

    if doorbell_gate(dev)? {
        ring_cmd_db(dev, &mut cmds.ring)?;
    } else {
        cmds.ring.mark_db_pending();
    }
    drop(cmds);
    drop(inner);
    Ok(())
}

/// Consume command ring elements up to and including `ptr`. Returns the
/// completed element and the pending entry it cleared.
pub(crate) fn take_completed(
    dev: &DeviceContext,
    ptr: u64,
) -> Result<(CommandElement, Option<PendingCommand>)> {
    let mut cmds = dev.commands.lock()?;
    let target = cmds.ring.addr_to_index(ptr)?;
    let outstanding = cmds.ring.nr_pending();
    let consumed = cmds.ring.nr_enclosed(cmds.ring.rp(), target) + 1;
    if outstanding == 0 || consumed > outstanding {
        return Err(new_error!(
            "Command completion at {:#x} does not match an issued command",
            ptr
        ));
    }

    let mut last = None;
    for _ in 0..consumed {
        let addr = cmds.ring.delete_element()?;
        let el: CommandElement = dev.dma.read_val(addr)?;
        let pending = cmds
            .pending
            .get_mut(el.channel() as usize)
            .and_then(Option::take);
        last = Some((el, pending));
    }
    last.ok_or_else(|| new_error!("Command completion consumed no elements"))
}

/// Counts bulk START commands that have not completed yet
#[derive(Debug, Default)]
pub(crate) struct StartTracker {
    outstanding: Mutex<u32>,
    done: Condvar,
}

impl StartTracker {
    pub(crate) fn add(&self) {
        if let Ok(mut n) = self.outstanding.lock() {
            *n += 1;
        }
    }

    pub(crate) fn complete(&self) {
        if let Ok(mut n) = self.outstanding.lock() {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.done.notify_all();
            }
        }
    }

    /// Forget outstanding starts and release any waiter
    pub(crate) fn reset(&self) {
        if let Ok(mut n) = self.outstanding.lock() {
            *n = 0;
        }
        self.done.notify_all();
    }

    /// Wait until every tracked START completed
    pub(crate) fn wait(&self, timeout: Duration) -> Result<()> {
        let guard = self.outstanding.lock()?;
        let (mut n, _) = self
            .done
            .wait_timeout_while(guard, timeout, |n| *n > 0)
            .map_err(|e| MhiError::LockAttemptFailed(e.to_string()))?;
        if *n > 0 {
            let missing = *n;
            *n = 0;
            return Err(MhiError::CommandTimeout(missing));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn start_and_stop_preconditions() {
        assert!(Command::Start.allowed_in(ChannelState::Enabled));
        assert!(Command::Start.allowed_in(ChannelState::Stop));
        assert!(!Command::Start.allowed_in(ChannelState::Disabled));
        assert!(!Command::Start.allowed_in(ChannelState::Running));
        assert!(Command::Stop.allowed_in(ChannelState::Running));
        assert!(!Command::Stop.allowed_in(ChannelState::Enabled));
        assert!(Command::Reset.allowed_in(ChannelState::Error));
    }

    #[test]
    fn packet_types_map_back() {
        for cmd in [Command::Noop, Command::Start, Command::Stop, Command::Reset] {
            assert_eq!(Command::from_packet_type(cmd.packet_type()), Some(cmd));
        }
        assert_eq!(Command::from_packet_type(PacketType::TxEvent), None);
    }

    #[test]
    fn start_tracker_times_out_with_the_missing_count() {
        let t = StartTracker::default();
        t.add();
        t.add();
        t.complete();
        assert!(matches!(
            t.wait(Duration::from_millis(10)),
            Err(MhiError::CommandTimeout(1))
        ));
        // the count is cleared after a timeout
        assert!(t.wait(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn start_tracker_wakes_on_last_completion() {
        let t = Arc::new(StartTracker::default());
        t.add();
        let t2 = t.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            t2.complete();
        });
        assert!(t.wait(Duration::from_secs(5)).is_ok());
        h.join().unwrap();
    }
}
