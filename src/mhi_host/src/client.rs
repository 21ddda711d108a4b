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

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use smallvec::SmallVec;
use tracing::{Span, instrument};

use crate::channel::{
    ChannelState, Direction, HW_IN_CHANNEL, HW_OUT_CHANNEL, is_valid, ring_elements,
};
use crate::command::{self, Command};
use crate::device::DeviceContext;
use crate::doorbell::{doorbell_gate, ring_channel_db};
use crate::mem::DmaOpsExt;
use crate::power::MhiState;
use crate::ring::TRB_MAX_DATA_SIZE;
use crate::ring::elements::{TransferElement, TreFlags};
use crate::{MhiError, Result};

/// Opaque client data handed back in every callback
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Client notification function
pub type ClientCallback = Box<dyn Fn(&CallbackInfo) + Send + Sync>;

/// Why a client callback was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReason {
    /// A buffer completed
    TransferSuccess,
    /// A buffer completed with an error
    TransferError,
    /// The device finished bring-up and channels are usable
    MhiEnabled,
    /// The device went away
    MhiDisabled,
    /// A channel reset finished and the channel was restarted
    ChannelResetComplete,
}

/// Outcome of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Completed
    Success,
    /// The modem had more data than the buffer could hold
    Overflow,
    /// Nothing has completed yet
    DeviceNotReady,
    /// The modem reported an error
    Error,
}

/// A completed (or polled) buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResult {
    /// Bus address of the buffer
    pub buf_addr: u64,
    /// Bytes transferred
    pub bytes: usize,
    /// Completion status
    pub status: TransferStatus,
}

/// Argument passed to a client callback
#[derive(Clone)]
pub struct CallbackInfo {
    /// Channel the notification is for
    pub chan: u32,
    /// Why the callback fired
    pub reason: CallbackReason,
    /// The buffer, for transfer notifications
    pub result: Option<TransferResult>,
    /// The data supplied at registration
    pub user_data: Option<UserData>,
}

impl fmt::Debug for CallbackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackInfo")
            .field("chan", &self.chan)
            .field("reason", &self.reason)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Registration parameters for [`MhiDevice::open_channel`](crate::MhiDevice::open_channel)
pub struct ClientInfo {
    /// Called for completions and device notifications
    pub callback: Option<ClientCallback>,
    /// Only every `cb_mod`-th transfer completion is reported. Zero is
    /// treated as one.
    pub cb_mod: u32,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            callback: None,
            cb_mod: 1,
        }
    }
}

impl ClientInfo {
    /// Report every completion to `callback`
    pub fn with_callback(callback: impl Fn(&CallbackInfo) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            cb_mod: 1,
        }
    }
}

/// A registered client as seen by the device
pub(crate) struct Client {
    callback: Option<ClientCallback>,
    cb_mod: u64,
    user_data: Option<UserData>,
    completions: AtomicU64,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("has_callback", &self.callback.is_some())
            .field("cb_mod", &self.cb_mod)
            .field("completions", &self.completions)
            .finish()
    }
}

impl Client {
    pub(crate) fn new(info: ClientInfo, user_data: Option<UserData>) -> Self {
        Self {
            callback: info.callback,
            cb_mod: info.cb_mod.max(1) as u64,
            user_data,
            completions: AtomicU64::new(0),
        }
    }

    /// Count a transfer completion and tell whether it should be reported
    pub(crate) fn should_notify(&self) -> bool {
        if self.callback.is_none() {
            return false;
        }
        let n = self.completions.fetch_add(1, Ordering::AcqRel) + 1;
        n % self.cb_mod == 0
    }

    fn invoke(&self, chan: u32, reason: CallbackReason, result: Option<TransferResult>) {
        if let Some(cb) = &self.callback {
            let info = CallbackInfo {
                chan,
                reason,
                result,
                user_data: self.user_data.clone(),
            };
            cb(&info);
        }
    }
}

/// A callback collected under a lock and invoked after it is released
pub(crate) struct PendingCallback {
    client: Arc<Client>,
    chan: u32,
    reason: CallbackReason,
    result: Option<TransferResult>,
}

impl PendingCallback {
    pub(crate) fn new(
        client: Arc<Client>,
        chan: u32,
        reason: CallbackReason,
        result: Option<TransferResult>,
    ) -> Self {
        Self {
            client,
            chan,
            reason,
            result,
        }
    }

    pub(crate) fn invoke(self) {
        self.client.invoke(self.chan, self.reason, self.result);
    }
}

/// Tell every registered client about a device-wide event
pub(crate) fn notify_clients(dev: &DeviceContext, reason: CallbackReason) -> Result<()> {
    let mut pending: SmallVec<[PendingCallback; 8]> = SmallVec::new();
    for chan in dev.channels() {
        if let Some(client) = chan.client()? {
            pending.push(PendingCallback::new(client, chan.id, reason, None));
        }
    }
    log::debug!("Notifying {} clients of {reason:?}", pending.len());
    for cb in pending {
        cb.invoke();
    }
    Ok(())
}

/// Register a client on `chan`
pub(crate) fn open(
    dev: &Arc<DeviceContext>,
    chan: u32,
    info: ClientInfo,
    user_data: Option<UserData>,
) -> Result<ClientHandle> {
    let channel = dev.channel(chan)?;
    let mut inner = channel.lock()?;
    if inner.client.is_some() {
        return Err(MhiError::AlreadyRegistered(chan));
    }
    let generation = dev.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
    inner.client = Some(Arc::new(Client::new(info, user_data)));
    inner.generation = generation;
    log::info!("Client registered on channel {chan}");
    Ok(ClientHandle {
        dev: dev.clone(),
        chan,
        generation,
    })
}

/// A client's registration on one channel.
///
/// Dropping the handle unregisters the client; [`ClientHandle::close`]
/// does the same after waiting for outbound buffers to drain.
pub struct ClientHandle {
    dev: Arc<DeviceContext>,
    chan: u32,
    generation: u64,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("chan", &self.chan)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ClientHandle {
    /// Channel this handle is registered on
    pub fn chan(&self) -> u32 {
        self.chan
    }

    /// Event ring receiving this channel's completions
    pub fn event_ring(&self) -> Result<usize> {
        Ok(self.dev.channel(self.chan)?.ev_ring)
    }

    /// MSI vector of the channel's event ring
    pub fn msi_vector(&self) -> Result<u32> {
        let ev = self.event_ring()?;
        Ok(self.dev.event_rings[ev].msi_vector())
    }

    /// Interrupt moderation of the channel's event ring
    pub fn intmod(&self) -> Result<u16> {
        let ev = self.event_ring()?;
        Ok(self.dev.event_rings[ev].intmod)
    }

    /// Buffers completed on this channel
    pub fn packets_transferred(&self) -> Result<u64> {
        Ok(self.dev.channel(self.chan)?.packets_transferred())
    }

    /// Outbound buffers the modem has not completed yet
    pub fn outbound_acks(&self) -> Result<u64> {
        Ok(self.dev.channel(self.chan)?.outbound_acks())
    }

    /// Current channel state
    pub fn state(&self) -> Result<ChannelState> {
        self.dev.channel(self.chan)?.state()
    }

    /// Queue one buffer of `len` bytes at bus address `buf`.
    ///
    /// `chain` links the buffer to the next one; `eob` asks for an event at
    /// the end of this block. The doorbell is rung at once when the device
    /// is in M0 and the batching policy says so; otherwise it is deferred
    /// and the device is woken.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn enqueue_transfer(&self, buf: u64, len: usize, chain: bool, eob: bool) -> Result<()> {
        let dev = self.dev.as_ref();
        let chan = dev.channel(self.chan)?;
        chan.client_for(self.generation)?;
        if len == 0 || len > u16::MAX as usize {
            return Err(MhiError::InvalidTransferLength(len));
        }
        if !dev.config.buffer_in_window(buf, len) {
            log::error!("Channel {}: buffer {buf:#x} is outside the DMA window", self.chan);
            return Err(MhiError::BufferOutsideDmaWindow(buf, len));
        }

        let _data = dev.activity.begin_data();
        let running = chan.state()? == ChannelState::Running;

        let mut flags = if chain { TreFlags::CHAIN } else { TreFlags::IEOT };
        if eob {
            flags |= TreFlags::IEOB;
        }
        if dev.event_rings[chan.ev_ring].intmod != 0 {
            flags |= TreFlags::BEI;
        }

        let mut ring = chan.ring.lock();
        let addr = ring.add_element()?;
        dev.dma
            .write_val(addr, TransferElement::new(buf, len as u16, flags))?;
        if chan.direction == Direction::Outbound {
            chan.add_outbound_ack();
            dev.activity.add_ack();
        }

        let since = chan.bump_since_db();
        let batch = match self.chan {
            HW_IN_CHANNEL => Some(dev.config.xfer_db_interval()),
            HW_OUT_CHANNEL => dev.config.hw_out_db_skip(),
            _ => None,
        };
        let due = chan.db_mode() || batch.is_none_or(|n| since % n.max(1) as u32 == 0);

        if due && running && doorbell_gate(dev)? {
            ring_channel_db(dev, chan, &mut ring)?;
        } else {
            ring.mark_db_pending();
        }
        Ok(())
    }

    /// Peek at the oldest inbound buffer the client has not recycled.
    /// Reports [`TransferStatus::DeviceNotReady`] when nothing completed.
    pub fn poll(&self) -> Result<TransferResult> {
        let dev = self.dev.as_ref();
        let chan = dev.channel(self.chan)?;
        chan.client_for(self.generation)?;
        if chan.direction != Direction::Inbound {
            return Err(MhiError::NotPermitted("poll on an outbound channel"));
        }
        let ring = chan.ring.lock();
        if ring.ack_rp() == ring.rp() {
            return Ok(TransferResult {
                buf_addr: 0,
                bytes: 0,
                status: TransferStatus::DeviceNotReady,
            });
        }
        let tre: TransferElement = dev.dma.read_val(ring.ack_addr())?;
        Ok(TransferResult {
            buf_addr: tre.buffer_ptr,
            bytes: tre.buf_len() as usize,
            status: TransferStatus::Success,
        })
    }

    /// Hand the oldest consumed inbound buffer back to the modem
    pub fn recycle_inbound(&self) -> Result<()> {
        let dev = self.dev.as_ref();
        let chan = dev.channel(self.chan)?;
        chan.client_for(self.generation)?;
        if chan.direction != Direction::Inbound {
            return Err(MhiError::NotPermitted("recycle on an outbound channel"));
        }
        let running = chan.state()? == ChannelState::Running;

        let mut ring = chan.ring.lock();
        let acked = ring.acknowledge()?;
        let mut tre: TransferElement = dev.dma.read_val(acked)?;
        tre.set_len(TRB_MAX_DATA_SIZE);
        let wp = ring.add_element()?;
        dev.dma.write_val(wp, tre)?;

        if running && doorbell_gate(dev)? {
            ring_channel_db(dev, chan, &mut ring)?;
        } else {
            ring.mark_db_pending();
        }
        Ok(())
    }

    /// Free slots in the transfer ring
    pub fn free_elements(&self) -> Result<usize> {
        let chan = self.dev.channel(self.chan)?;
        chan.client_for(self.generation)?;
        let ring = chan.ring.lock();
        Ok(ring.nr_avail())
    }

    /// Ask the modem to reset the channel. The client is told through
    /// [`CallbackReason::ChannelResetComplete`] once the channel restarted.
    pub fn reset_channel(&self) -> Result<()> {
        self.dev.channel(self.chan)?.client_for(self.generation)?;
        command::send_command(&self.dev, Command::Reset, self.chan, false)
    }

    /// Allow or veto low power. A veto while the device idles in M1/M2
    /// wakes it.
    pub fn set_low_power(&self, enable: bool) -> Result<()> {
        self.dev.channel(self.chan)?.client_for(self.generation)?;
        let mut st = self.dev.power.lock()?;
        st.lpm_allowed = enable;
        if !enable && st.link_up && matches!(st.state, MhiState::M1 | MhiState::M2) {
            self.dev.power.assert_wake(&mut st)?;
        }
        Ok(())
    }

    /// Unregister after waiting a bounded time for outbound buffers to
    /// complete. The client is unregistered even when buffers remain.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn close(self) -> Result<()> {
        let chan = self.dev.channel(self.chan)?;
        chan.client_for(self.generation)?;

        let mut outstanding = chan.outbound_acks();
        for _ in 0..self.dev.config.close_retries() {
            if outstanding == 0 {
                break;
            }
            thread::sleep(self.dev.config.close_retry_interval());
            outstanding = chan.outbound_acks();
        }
        self.unregister();
        if outstanding > 0 {
            log::warn!("Channel {} closed with {outstanding} outstanding acks", self.chan);
            return Err(MhiError::AcksOutstanding(self.chan, outstanding));
        }
        log::info!("Client closed channel {}", self.chan);
        Ok(())
    }

    fn unregister(&self) {
        let Ok(chan) = self.dev.channel(self.chan) else {
            return;
        };
        let mut released = false;
        if let Ok(mut inner) = chan.lock() {
            if inner.generation == self.generation && inner.client.is_some() {
                inner.client = None;
                released = chan.direction == Direction::Inbound;
            }
        }
        // buffers the client never acknowledged are no longer owned by anyone
        if released {
            let n = chan.ring.lock().release_consumed();
            if n > 0 {
                log::debug!("Released {n} consumed buffers on channel {}", self.chan);
            }
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Largest number of buffers that can be queued on `chan` at once
pub fn max_buffers(chan: u32) -> Result<usize> {
    if !is_valid(chan) {
        return Err(MhiError::InvalidChannel(chan));
    }
    Ok(ring_elements(chan) - 1)
}

/// Endpoint id reported to transport clients
pub fn endpoint_id() -> u32 {
    4
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn callback_modulus() {
        let seen = Arc::new(Mutex::new(0));
        let seen2 = seen.clone();
        let mut info = ClientInfo::with_callback(move |_| *seen2.lock().unwrap() += 1);
        info.cb_mod = 3;
        let client = Arc::new(Client::new(info, None));
        let fired: Vec<bool> = (0..6).map(|_| client.should_notify()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true]);

        PendingCallback::new(client, 5, CallbackReason::MhiEnabled, None).invoke();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn callback_receives_user_data() {
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        let info = ClientInfo::with_callback(move |cb| {
            let v = cb
                .user_data
                .as_ref()
                .and_then(|d| d.downcast_ref::<u32>())
                .copied();
            *got2.lock().unwrap() = v;
        });
        let client = Arc::new(Client::new(info, Some(Arc::new(7u32))));
        PendingCallback::new(client, 1, CallbackReason::MhiDisabled, None).invoke();
        assert_eq!(*got.lock().unwrap(), Some(7));
    }

    #[test]
    fn without_callback_nothing_is_reported() {
        let client = Client::new(ClientInfo::default(), None);
        assert!(!client.should_notify());
    }

    #[test]
    fn buffer_limits() {
        assert_eq!(max_buffers(4).unwrap(), 9);
        assert_eq!(max_buffers(HW_IN_CHANNEL).unwrap(), 143);
        assert!(matches!(max_buffers(50), Err(MhiError::InvalidChannel(50))));
        assert_eq!(endpoint_id(), 4);
    }
}
