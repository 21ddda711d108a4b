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

//! A simulated modem.
//!
//! Register writes are handled synchronously on the writing thread: state
//! requests post state change events, doorbells consume ring elements and
//! post completions. Every posted event raises the MSI of its ring through
//! the device's [`InterruptHandle`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use mhi_host::mem::ControlLayout;
use mhi_host::mmio::{LINK_DOWN_SENTINEL, MHI_VERSION, MhiCtrl, MhiStatus, regs};
use mhi_host::ring::context::{ChannelContext, CommandContext, EventContext, RP_OFFSET};
use mhi_host::ring::elements::{CompletionCode, EventElement, TransferElement};
use mhi_host::{
    CallbackInfo, CallbackReason, ClientInfo, CoherentMemory, ControlRegion, DmaError, DmaOps,
    DmaOpsExt, ExecEnv, InterruptHandle, MhiConfiguration, MhiDevice, MhiError, MhiState,
    MmioOps, PlatformOps,
};
use mhi_testing::wait_until;
use tracing_subscriber::EnvFilter;

/// Bus address of the control segment
pub const CTRL_BASE: u64 = 0x1000_0000;
/// Bus address of the data buffers, inside the default DMA window
pub const DATA_BASE: u64 = MhiConfiguration::DEFAULT_DMA_WINDOW_START;
pub const DATA_SIZE: usize = 0x10_0000;

/// Upper bound for anything the tests wait on
pub const WAIT: Duration = Duration::from_secs(5);

const REG_LEN: u32 = 0x1000;
const CHDB_BASE: u32 = 0x400;
const ERDB_BASE: u32 = 0x800;
const EL_SIZE: u64 = 16;
const PRIMARY_RING: u64 = 0;

/// Control segment plus a data region, dispatched by address
pub struct SimMemory {
    ctrl: CoherentMemory,
    data: CoherentMemory,
}

impl SimMemory {
    fn new() -> Self {
        Self {
            ctrl: CoherentMemory::new(CTRL_BASE, ControlLayout::query_size()),
            data: CoherentMemory::new(DATA_BASE, DATA_SIZE),
        }
    }

    fn backing(&self, addr: u64) -> &CoherentMemory {
        if addr >= DATA_BASE {
            &self.data
        } else {
            &self.ctrl
        }
    }
}

impl DmaOps for SimMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), DmaError> {
        self.backing(addr).read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<(), DmaError> {
        self.backing(addr).write(addr, src)
    }
}

/// Something the modem observed or did, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    StateChange(MhiState),
    ExecEnv(ExecEnv),
    CommandDoorbell,
    ChannelDoorbell(u32),
    EventDoorbell(u32),
    TransferCompleted(u32),
}

struct ModemState {
    regs: HashMap<u32, u32>,
    state: MhiState,
    link_up: bool,
    ready: bool,
    amss_pending: bool,
    auto_complete_out: bool,
    hold_commands: bool,
    irq: Option<InterruptHandle>,
    pending_msis: Vec<u32>,
    log: Vec<SimEvent>,
}

pub struct Modem {
    mem: Arc<SimMemory>,
    inner: Mutex<ModemState>,
}

fn advance(base: u64, len: u64, addr: u64) -> u64 {
    if addr + EL_SIZE >= base + len {
        base
    } else {
        addr + EL_SIZE
    }
}

/// Element addresses from `rp` up to, not including, `wp`
fn span(base: u64, len: u64, mut rp: u64, wp: u64) -> Vec<u64> {
    let mut out = Vec::new();
    while rp != wp && (out.len() as u64) < len / EL_SIZE {
        out.push(rp);
        rp = advance(base, len, rp);
    }
    out
}

impl Modem {
    fn new(mem: Arc<SimMemory>) -> Self {
        let regs = HashMap::from([
            (regs::MHIREGLEN, REG_LEN),
            (regs::MHIVER, MHI_VERSION),
            (regs::MHICFG, 4 << 16),
            (regs::CHDBOFF, CHDB_BASE),
            (regs::ERDBOFF, ERDB_BASE),
        ]);
        Self {
            mem,
            inner: Mutex::new(ModemState {
                regs,
                state: MhiState::Reset,
                link_up: true,
                ready: true,
                amss_pending: false,
                auto_complete_out: true,
                hold_commands: false,
                irq: None,
                pending_msis: Vec::new(),
                log: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModemState> {
        self.inner.lock().unwrap()
    }

    /// Deliver MSIs to `irq`, including any raised before it was connected
    pub fn connect(&self, irq: InterruptHandle) {
        let mut st = self.lock();
        for vector in st.pending_msis.drain(..) {
            irq.signal(vector);
        }
        st.irq = Some(irq);
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Whether outbound doorbells complete their elements at once
    pub fn set_auto_complete(&self, on: bool) {
        self.lock().auto_complete_out = on;
    }

    /// Whether command doorbells leave their commands for
    /// [`Modem::complete_commands`]
    pub fn set_hold_commands(&self, hold: bool) {
        self.lock().hold_commands = hold;
    }

    /// Complete every command the host has published
    pub fn complete_commands(&self) {
        let mut st = self.lock();
        self.complete_commands_locked(&mut st);
    }

    /// Lose the link without the host's involvement
    pub fn drop_link(&self) {
        self.lock().link_up = false;
    }

    /// Restart the modem firmware, as it does after a system error
    pub fn reboot(&self) {
        self.lock().state = MhiState::Reset;
    }

    pub fn state(&self) -> MhiState {
        self.lock().state
    }

    pub fn log(&self) -> Vec<SimEvent> {
        self.lock().log.clone()
    }

    pub fn log_len(&self) -> usize {
        self.lock().log.len()
    }

    /// Complete every outbound element the host has published on `chan`
    pub fn complete_outbound(&self, chan: u32) -> usize {
        let mut st = self.lock();
        if !st.link_up {
            return 0;
        }
        self.complete_outbound_locked(&mut st, chan)
    }

    /// Fill the oldest published inbound buffer of `chan` with `bytes`.
    /// Returns the buffer's address.
    pub fn deliver_inbound(&self, chan: u32, bytes: u16) -> Option<u64> {
        let mut st = self.lock();
        let ctxt_addr = Self::chan_ctxt_addr(&st, chan);
        let ctxt: ChannelContext = self.mem.read_val(ctxt_addr).ok()?;
        let (base, len, rp, wp) = (ctxt.base, ctxt.len, ctxt.rp, ctxt.wp);
        if rp == wp {
            return None;
        }
        let tre: TransferElement = self.mem.read_val(rp).ok()?;
        self.mem
            .write_val(ctxt_addr + RP_OFFSET, advance(base, len, rp))
            .ok()?;
        st.log.push(SimEvent::TransferCompleted(chan));
        let el = EventElement::transfer(rp, CompletionCode::Eot, bytes, chan);
        self.post_event(&mut st, ctxt.ev_ring_index as u64, el);
        Some(tre.buffer_ptr)
    }

    /// The channel context as the host last wrote it
    pub fn channel_context(&self, chan: u32) -> ChannelContext {
        let st = self.lock();
        self.mem.read_val(Self::chan_ctxt_addr(&st, chan)).unwrap()
    }

    /// A transfer element at `addr`
    pub fn transfer_element(&self, addr: u64) -> TransferElement {
        self.mem.read_val(addr).unwrap()
    }

    /// Post a transfer event for the element at the channel's read
    /// position without consuming it
    pub fn post_transfer(&self, chan: u32, code: CompletionCode, bytes: u16) -> bool {
        let mut st = self.lock();
        let Ok(ctxt) = self
            .mem
            .read_val::<ChannelContext>(Self::chan_ctxt_addr(&st, chan))
        else {
            return false;
        };
        let el = EventElement::transfer(ctxt.rp, code, bytes, chan);
        self.post_event(&mut st, ctxt.ev_ring_index as u64, el)
    }

    fn addr(st: &ModemState, offset: u32) -> u64 {
        let lo = st.regs.get(&offset).copied().unwrap_or(0);
        let hi = st.regs.get(&(offset + 4)).copied().unwrap_or(0);
        ((hi as u64) << 32) | lo as u64
    }

    fn chan_ctxt_addr(st: &ModemState, chan: u32) -> u64 {
        Self::addr(st, regs::CCABAP) + chan as u64 * ChannelContext::SIZE as u64
    }

    fn signal(st: &mut ModemState, vector: u32) {
        match &st.irq {
            Some(irq) => irq.signal(vector),
            None => st.pending_msis.push(vector),
        }
    }

    /// Write `el` at the event ring's write position. Dropped when the host
    /// has not handed the ring over or has no free slot.
    fn post_event(&self, st: &mut ModemState, ring: u64, el: EventElement) -> bool {
        let ecabap = Self::addr(st, regs::ECABAP);
        if ecabap == 0 {
            return false;
        }
        let ctxt_addr = ecabap + ring * EventContext::SIZE as u64;
        let Ok(ctxt) = self.mem.read_val::<EventContext>(ctxt_addr) else {
            return false;
        };
        let (base, len, rp, wp) = (ctxt.base, ctxt.len, ctxt.rp, ctxt.wp);
        if len == 0 || rp == wp {
            return false;
        }
        if self.mem.write_val(rp, el).is_err() {
            return false;
        }
        if self
            .mem
            .write_val(ctxt_addr + RP_OFFSET, advance(base, len, rp))
            .is_err()
        {
            return false;
        }
        Self::signal(st, ctxt.msi_vector);
        true
    }

    fn post_state(&self, st: &mut ModemState, state: MhiState) {
        st.state = state;
        st.log.push(SimEvent::StateChange(state));
        self.post_event(st, PRIMARY_RING, EventElement::state_change(state as u32));
    }

    fn on_ctrl(&self, st: &mut ModemState, value: u32) {
        match MhiCtrl::from_bits(value).state() {
            Some(MhiState::M0) if st.state != MhiState::M0 => {
                self.post_state(st, MhiState::M0);
                if st.amss_pending {
                    st.amss_pending = false;
                    st.log.push(SimEvent::ExecEnv(ExecEnv::Amss));
                    let el = EventElement::exec_env(ExecEnv::Amss as u32);
                    self.post_event(st, PRIMARY_RING, el);
                }
            }
            Some(MhiState::M2) if st.state == MhiState::M1 => st.state = MhiState::M2,
            Some(MhiState::M3) if st.state != MhiState::M3 => self.post_state(st, MhiState::M3),
            _ => {}
        }
    }

    fn on_command_doorbell(&self, st: &mut ModemState) {
        st.log.push(SimEvent::CommandDoorbell);
        if !st.hold_commands {
            self.complete_commands_locked(st);
        }
    }

    fn complete_commands_locked(&self, st: &mut ModemState) {
        let ctxt_addr = Self::addr(st, regs::CRCBAP);
        let Ok(ctxt) = self.mem.read_val::<CommandContext>(ctxt_addr) else {
            return;
        };
        let wp = Self::addr(st, regs::CRDB);
        for addr in span(ctxt.base, ctxt.len, ctxt.rp, wp) {
            let el = EventElement::command_completion(addr, CompletionCode::Success);
            self.post_event(st, PRIMARY_RING, el);
        }
        let _ = self.mem.write_val(ctxt_addr + RP_OFFSET, wp);
    }

    fn on_channel_doorbell(&self, st: &mut ModemState, chan: u32) {
        st.log.push(SimEvent::ChannelDoorbell(chan));
        if chan % 2 == 0 && st.auto_complete_out {
            self.complete_outbound_locked(st, chan);
        }
    }

    fn complete_outbound_locked(&self, st: &mut ModemState, chan: u32) -> usize {
        let ctxt_addr = Self::chan_ctxt_addr(st, chan);
        let Ok(ctxt) = self.mem.read_val::<ChannelContext>(ctxt_addr) else {
            return 0;
        };
        let slots = span(ctxt.base, ctxt.len, ctxt.rp, ctxt.wp);
        for &addr in &slots {
            let len = self
                .mem
                .read_val::<TransferElement>(addr)
                .map(|tre| tre.buf_len())
                .unwrap_or(0);
            st.log.push(SimEvent::TransferCompleted(chan));
            let el = EventElement::transfer(addr, CompletionCode::Eot, len, chan);
            self.post_event(st, ctxt.ev_ring_index as u64, el);
        }
        let _ = self.mem.write_val(ctxt_addr + RP_OFFSET, ctxt.wp);
        slots.len()
    }

    fn wake(&self) {
        let mut st = self.lock();
        if st.link_up && matches!(st.state, MhiState::M1 | MhiState::M2) {
            self.post_state(&mut st, MhiState::M0);
        }
    }

    fn release(&self) {
        let mut st = self.lock();
        if st.link_up && st.state == MhiState::M0 {
            self.post_state(&mut st, MhiState::M1);
        }
    }

    fn power_on(&self) {
        self.lock().link_up = true;
    }

    // M3 survives a link power-down, anything else resets the modem
    fn power_off(&self) {
        let mut st = self.lock();
        st.link_up = false;
        if st.state != MhiState::M3 {
            st.state = MhiState::Reset;
        }
    }
}

impl MmioOps for Modem {
    fn read32(&self, offset: u32) -> u32 {
        let mut st = self.lock();
        if !st.link_up {
            return LINK_DOWN_SENTINEL;
        }
        if offset == regs::MHISTATUS {
            if st.ready && st.state == MhiState::Reset {
                st.state = MhiState::Ready;
                st.amss_pending = true;
            }
            return MhiStatus::new(st.state, st.ready, false).bits();
        }
        st.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut st = self.lock();
        if !st.link_up {
            return;
        }
        st.regs.insert(offset, value);
        match offset {
            regs::MHICTRL => self.on_ctrl(&mut st, value),
            regs::CRDB => self.on_command_doorbell(&mut st),
            o if (CHDB_BASE..ERDB_BASE).contains(&o) && (o - CHDB_BASE) % 8 == 0 => {
                self.on_channel_doorbell(&mut st, (o - CHDB_BASE) / 8)
            }
            o if (ERDB_BASE..REG_LEN).contains(&o) && (o - ERDB_BASE) % 8 == 0 => {
                st.log.push(SimEvent::EventDoorbell((o - ERDB_BASE) / 8))
            }
            _ => {}
        }
    }
}

/// Platform hooks wired to the modem's wake line and link
pub struct SimPlatform {
    modem: Arc<Modem>,
    calls: Mutex<Vec<(&'static str, String)>>,
}

impl SimPlatform {
    fn record(&self, call: &'static str) {
        let thread = thread::current().name().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push((call, thread));
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    /// Every call with the name of the thread that made it
    pub fn calls_by_thread(&self) -> Vec<(&'static str, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|(c, _)| *c == call)
    }
}

impl PlatformOps for SimPlatform {
    fn assert_wake(&self) -> anyhow::Result<()> {
        self.record("assert_wake");
        self.modem.wake();
        Ok(())
    }

    fn deassert_wake(&self) -> anyhow::Result<()> {
        self.record("deassert_wake");
        self.modem.release();
        Ok(())
    }

    fn link_on(&self) -> anyhow::Result<()> {
        self.record("link_on");
        self.modem.power_on();
        Ok(())
    }

    fn link_off(&self) -> anyhow::Result<()> {
        self.record("link_off");
        self.modem.power_off();
        Ok(())
    }

    fn report_unrecoverable(&self, reason: &MhiError) {
        log::error!("unrecoverable: {reason}");
        self.record("report_unrecoverable");
    }
}

/// Collects every callback a client receives
#[derive(Clone, Default)]
pub struct Callbacks(Arc<Mutex<Vec<CallbackInfo>>>);

impl Callbacks {
    pub fn client_info(&self) -> ClientInfo {
        let seen = self.clone();
        ClientInfo::with_callback(move |info| seen.0.lock().unwrap().push(info.clone()))
    }

    pub fn count(&self, reason: CallbackReason) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.reason == reason)
            .count()
    }

    pub fn all(&self) -> Vec<CallbackInfo> {
        self.0.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub dev: MhiDevice,
    pub modem: Arc<Modem>,
    pub platform: Arc<SimPlatform>,
}

/// Memory, modem and platform for one simulated device
pub fn sim() -> (Arc<SimMemory>, Arc<Modem>, Arc<SimPlatform>) {
    let mem = Arc::new(SimMemory::new());
    let modem = Arc::new(Modem::new(mem.clone()));
    let platform = Arc::new(SimPlatform {
        modem: modem.clone(),
        calls: Mutex::new(Vec::new()),
    });
    (mem, modem, platform)
}

pub fn region() -> ControlRegion {
    ControlRegion {
        base: CTRL_BASE,
        size: ControlLayout::query_size(),
    }
}

/// Short polls, no idle transitions unless a test asks for them
pub fn test_config() -> MhiConfiguration {
    let mut cfg = MhiConfiguration::default();
    cfg.set_ready_poll_interval(Duration::from_millis(1));
    cfg.set_link_retry_interval(Duration::from_millis(1));
    cfg.set_m1_entry_delay(Duration::from_secs(60));
    cfg.set_m3_entry_delay(Duration::from_secs(60));
    cfg.set_power_wait_timeout(Duration::from_secs(2));
    cfg.set_channel_start_timeout(Duration::from_secs(2));
    cfg.set_close_retry_interval(Duration::from_millis(1));
    cfg
}

pub fn new_harness(config: MhiConfiguration) -> Harness {
    let (mem, modem, platform) = sim();
    let dev = MhiDevice::new(config, modem.clone(), mem, platform.clone(), region()).unwrap();
    modem.connect(dev.interrupt_handle());
    Harness {
        dev,
        modem,
        platform,
    }
}

/// A device that completed bring-up to AMSS
pub fn bring_up(config: MhiConfiguration) -> Harness {
    let h = new_harness(config);
    h.dev.start().unwrap();
    wait_until(WAIT, || h.dev.is_initialized().unwrap()).unwrap();
    h
}

/// Print the crate's logs when RUST_LOG is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
