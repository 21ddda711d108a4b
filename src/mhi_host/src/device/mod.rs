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

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread::{self, JoinHandle};

use bytemuck::Zeroable;
use crossbeam_channel::Receiver;
use tracing::{Span, instrument};

use crate::channel::{Channel, MAX_CHANNELS, is_valid, ring_elements};
use crate::client::{self, ClientHandle, ClientInfo, UserData};
use crate::command::{CommandEngine, StartTracker};
use crate::config::MhiConfiguration;
use crate::counters::{Counters, CountersSnapshot};
use crate::doorbell::DoorbellBases;
use crate::event::{self, EventQueue, EventRing, EventWork};
use crate::mem::{ControlLayout, DmaOps, DmaOpsExt};
use crate::mmio::{MmioOps, Registers};
use crate::power::deferred::{self, DeferredMsg, DeferredQueue};
use crate::power::transition::{self, TransitionQueue, TransitionWork};
use crate::power::{Activity, ExecEnv, MhiState, PlatformOps, PowerManager, StateTransition, pm};
use crate::ring::context::{ChannelContext, CommandContext, EventContext};
use crate::ring::{
    CMD_RING_ELEMENTS, ELEMENT_SIZE, EVENT_RING_ELEMENTS, IPA_IN_EVENT_RING, IPA_OUT_EVENT_RING,
    NUM_EVENT_RINGS, Ring,
};
use crate::{MhiError, Result};

/// Device registry
pub mod registry;

/// Interrupt moderation of the hardware outbound event ring
const IPA_OUT_INTMOD: u16 = 10;
/// Interrupt moderation of the hardware inbound event ring
const IPA_IN_INTMOD: u16 = 6;

/// Where the control segment lives in modem-visible memory. It must be at
/// least [`ControlLayout::query_size`] bytes and reachable through the
/// device's [`DmaOps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegion {
    /// Bus address of the first byte
    pub base: u64,
    /// Size in bytes
    pub size: usize,
}

/// Everything a device instance shares between its workers and clients
pub(crate) struct DeviceContext {
    pub(crate) config: MhiConfiguration,
    pub(crate) regs: Registers,
    pub(crate) dma: Arc<dyn DmaOps>,
    pub(crate) layout: ControlLayout,
    pub(crate) doorbells: DoorbellBases,
    channels: Vec<Option<Channel>>,
    pub(crate) event_rings: Vec<EventRing>,
    pub(crate) commands: CommandEngine,
    pub(crate) starts: StartTracker,
    pub(crate) power: PowerManager,
    pub(crate) activity: Activity,
    pub(crate) counters: Counters,
    pub(crate) transitions: TransitionQueue,
    pub(crate) events: EventQueue,
    pub(crate) deferred: DeferredQueue,
    pub(crate) next_generation: AtomicU64,
}

/// Receiving ends handed to the worker threads
pub(crate) struct WorkerQueues {
    events: Receiver<EventWork>,
    transitions: Receiver<TransitionWork>,
    deferred: Receiver<DeferredMsg>,
}

impl DeviceContext {
    /// Build the rings and write every context into the control segment.
    /// Each stage's failure is reported as [`MhiError::InitFailed`].
    pub(crate) fn new(
        config: MhiConfiguration,
        mmio: Arc<dyn MmioOps>,
        dma: Arc<dyn DmaOps>,
        platform: Arc<dyn PlatformOps>,
        region: ControlRegion,
    ) -> Result<(Arc<Self>, WorkerQueues)> {
        let stage = |name: &'static str| move |e: MhiError| MhiError::InitFailed(name, Box::new(e));

        let layout = ControlLayout::new(region.base, region.size).map_err(stage("layout"))?;
        let (channels, event_rings, cmd_ring) = build_rings(&layout).map_err(stage("rings"))?;

        let (transitions, transitions_rx) =
            TransitionQueue::new(config.transition_queue_depth() as usize);
        let (events, events_rx) = EventQueue::new();
        let (deferred, deferred_rx) = DeferredQueue::new();

        let dev = Self {
            regs: Registers::new(mmio, config.verify_attempts()),
            config,
            dma,
            layout,
            doorbells: DoorbellBases::default(),
            channels,
            event_rings,
            commands: CommandEngine::new(cmd_ring),
            starts: StartTracker::default(),
            power: PowerManager::new(platform),
            activity: Activity::default(),
            counters: Counters::default(),
            transitions,
            events,
            deferred,
            next_generation: AtomicU64::new(0),
        };
        dev.write_contexts().map_err(stage("contexts"))?;

        let queues = WorkerQueues {
            events: events_rx,
            transitions: transitions_rx,
            deferred: deferred_rx,
        };
        Ok((Arc::new(dev), queues))
    }

    /// Runtime state of a valid channel
    pub(crate) fn channel(&self, chan: u32) -> Result<&Channel> {
        self.channels
            .get(chan as usize)
            .and_then(Option::as_ref)
            .ok_or(MhiError::InvalidChannel(chan))
    }

    /// Every valid channel in ascending id order
    pub(crate) fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().flatten()
    }

    fn write_contexts(&self) -> Result<()> {
        for chan in 0..MAX_CHANNELS {
            let addr = self.layout.chan_ctxt_addr(chan);
            let ctxt = match self.channel(chan) {
                Ok(c) => {
                    let ring = c.ring.lock();
                    ChannelContext {
                        state: 0,
                        chan_type: c.direction as u32,
                        ev_ring_index: c.ev_ring as u32,
                        base: ring.base(),
                        len: ring.len_bytes(),
                        rp: ring.base(),
                        wp: ring.base(),
                    }
                }
                Err(_) => ChannelContext::zeroed(),
            };
            self.dma.write_val(addr, ctxt)?;
        }

        for er in &self.event_rings {
            let st = er.state.lock();
            let mut ctxt = EventContext {
                intmodt: 0,
                er_type: 0,
                msi_vector: st.props.msi_vector(),
                base: st.ring.base(),
                len: st.ring.len_bytes(),
                rp: st.ring.base(),
                wp: st.ring.base(),
            };
            ctxt.set_intmod(er.intmod);
            self.dma.write_val(er.ctxt_addr, ctxt)?;
        }

        let cmds = self.commands.lock()?;
        let ctxt = CommandContext {
            reserved: [0; 3],
            base: cmds.ring.base(),
            len: cmds.ring.len_bytes(),
            rp: cmds.ring.base(),
            wp: cmds.ring.base(),
        };
        self.dma.write_val(self.layout.cmd_ctxt_addr(), ctxt)?;
        Ok(())
    }

    fn shutdown(&self) {
        self.power.stop();
        self.starts.reset();
        self.events.stop();
        self.transitions.stop();
        self.deferred.stop();
    }
}

type Rings = (Vec<Option<Channel>>, Vec<EventRing>, Ring);

fn build_rings(layout: &ControlLayout) -> Result<Rings> {
    let mut channels = Vec::with_capacity(MAX_CHANNELS as usize);
    for chan in 0..MAX_CHANNELS {
        let channel = match layout.xfer_ring_addr(chan) {
            Some(base) if is_valid(chan) => {
                let ring = Ring::new(base, ELEMENT_SIZE, ring_elements(chan))?;
                Some(Channel::new(chan, layout.chan_ctxt_addr(chan), ring))
            }
            _ => None,
        };
        channels.push(channel);
    }

    let event_rings = (0..NUM_EVENT_RINGS)
        .map(|idx| {
            let intmod = match idx {
                IPA_OUT_EVENT_RING => IPA_OUT_INTMOD,
                IPA_IN_EVENT_RING => IPA_IN_INTMOD,
                _ => 0,
            };
            let ring = Ring::new(layout.ev_ring_addr(idx), ELEMENT_SIZE, EVENT_RING_ELEMENTS)?;
            Ok(EventRing::new(idx, layout.ev_ctxt_addr(idx), intmod, ring))
        })
        .collect::<Result<Vec<_>>>()?;

    let cmd_ring = Ring::new(layout.cmd_ring_addr(), ELEMENT_SIZE, CMD_RING_ELEMENTS)?;
    Ok((channels, event_rings, cmd_ring))
}

/// Queues MSIs for the event worker. Cheap to clone and safe to call from
/// an interrupt handler.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    queue: EventQueue,
}

impl InterruptHandle {
    /// Report that the modem raised `msi_vector`
    pub fn signal(&self, msi_vector: u32) {
        self.queue.signal(msi_vector);
    }
}

/// One modem behind one link.
///
/// Owns the control segment bookkeeping and three worker threads: the event
/// worker, the transition worker and the deferred executor. Dropping the
/// device stops and joins them.
pub struct MhiDevice {
    ctx: Arc<DeviceContext>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for MhiDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MhiDevice")
            .field("layout", &self.ctx.layout)
            .field("power", &self.ctx.power)
            .finish_non_exhaustive()
    }
}

impl MhiDevice {
    /// Lay out the control segment, write every context and start the
    /// workers. The device stays in RESET until [`MhiDevice::start`].
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(
        config: MhiConfiguration,
        mmio: Arc<dyn MmioOps>,
        dma: Arc<dyn DmaOps>,
        platform: Arc<dyn PlatformOps>,
        region: ControlRegion,
    ) -> Result<Self> {
        let (ctx, queues) = DeviceContext::new(config, mmio, dma, platform, region)?;
        let mut dev = Self {
            ctx,
            workers: Vec::with_capacity(3),
        };

        let WorkerQueues {
            events,
            transitions,
            deferred,
        } = queues;
        dev.spawn("mhi-events", move |ctx| event::run(ctx, events))?;
        dev.spawn("mhi-state", move |ctx| transition::run(ctx, transitions))?;
        dev.spawn("mhi-deferred", move |ctx| deferred::run(ctx, deferred))?;

        log::info!(
            "MHI device created, control segment {:#x}+{:#x}",
            region.base,
            region.size
        );
        Ok(dev)
    }

    // On failure the workers already running are stopped by Drop
    fn spawn(
        &mut self,
        name: &str,
        f: impl FnOnce(Arc<DeviceContext>) + Send + 'static,
    ) -> Result<()> {
        let ctx = self.ctx.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(ctx))
            .map_err(|e| {
                MhiError::InitFailed("workers", Box::new(crate::new_error!("spawn {}: {}", name, e)))
            })?;
        self.workers.push(handle);
        Ok(())
    }

    /// Begin bring-up by posting RESET
    pub fn start(&self) -> Result<()> {
        self.post_transition(StateTransition::Reset)
    }

    /// Post a lifecycle transition, e.g. LINK_DOWN or WAKE from the link
    /// notifier
    pub fn post_transition(&self, t: StateTransition) -> Result<()> {
        self.ctx.transitions.post(t)
    }

    /// A handle for delivering MSIs
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            queue: self.ctx.events.clone(),
        }
    }

    /// Register a client on `chan`
    #[instrument(err(Debug), skip(self, info, user_data), parent = Span::current(), level = "Trace")]
    pub fn open_channel(
        &self,
        chan: u32,
        info: ClientInfo,
        user_data: Option<UserData>,
    ) -> Result<ClientHandle> {
        client::open(&self.ctx, chan, info, user_data)
    }

    /// Host view of the device MHI state
    pub fn state(&self) -> Result<MhiState> {
        Ok(self.ctx.power.lock()?.state)
    }

    /// Execution environment last reported by the device
    pub fn exec_env(&self) -> Result<Option<ExecEnv>> {
        Ok(self.ctx.power.lock()?.exec_env)
    }

    /// Whether AMSS bring-up finished and clients were told
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.ctx.power.lock()?.initialized)
    }

    /// Whether the device exhausted its reset budget
    pub fn is_faulted(&self) -> Result<bool> {
        Ok(self.ctx.power.lock()?.faulted)
    }

    /// Whether the wake line is currently driven
    pub fn wake_asserted(&self) -> Result<bool> {
        Ok(self.ctx.power.lock()?.wake_asserted)
    }

    /// Outbound buffers the modem has not completed, over all channels
    pub fn outbound_acks(&self) -> u64 {
        self.ctx.activity.outbound_acks()
    }

    /// Copy of the power and data path counters
    pub fn counters(&self) -> CountersSnapshot {
        self.ctx.counters.snapshot()
    }

    /// Placement of the contexts and rings
    pub fn layout(&self) -> &ControlLayout {
        &self.ctx.layout
    }

    /// Configuration the device was created with
    pub fn config(&self) -> &MhiConfiguration {
        &self.ctx.config
    }

    /// Suspend to M3 and power the link down
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn suspend(&self) -> Result<()> {
        pm::suspend(&self.ctx)
    }

    /// Power the link up and return to M0
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn resume(&self) -> Result<()> {
        pm::resume(&self.ctx)
    }
}

impl Drop for MhiDevice {
    fn drop(&mut self) {
        self.ctx.shutdown();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{name} panicked");
            }
        }
        log::debug!("MHI device stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelState, Direction, event_ring_for, ids};
    use crate::command::{self, Command};
    use crate::mem::CoherentMemory;
    use crate::ring::elements::{CommandElement, PacketType};
    use crate::testing::{FakePlatform, FakeRegisters};

    const CTRL_BASE: u64 = 0x1000_0000;

    fn context() -> (Arc<DeviceContext>, WorkerQueues, Arc<CoherentMemory>) {
        let size = ControlLayout::query_size();
        let mem = Arc::new(CoherentMemory::new(CTRL_BASE, size));
        let (ctx, queues) = DeviceContext::new(
            MhiConfiguration::default(),
            Arc::new(FakeRegisters::default()),
            mem.clone(),
            Arc::new(FakePlatform::default()),
            ControlRegion {
                base: CTRL_BASE,
                size,
            },
        )
        .unwrap();
        (ctx, queues, mem)
    }

    #[test]
    fn contexts_describe_the_rings() {
        let (ctx, _queues, mem) = context();
        let c: ChannelContext = mem
            .read_val(ctx.layout.chan_ctxt_addr(ids::DIAG_IN))
            .unwrap();
        let (base, len, rp, chan_type, ev) = (c.base, c.len, c.rp, c.chan_type, c.ev_ring_index);
        assert_eq!(Some(base), ctx.layout.xfer_ring_addr(ids::DIAG_IN));
        assert_eq!(len, 10 * 16);
        assert_eq!(rp, base);
        assert_eq!(chan_type, Direction::Inbound as u32);
        assert_eq!(ev as usize, event_ring_for(ids::DIAG_IN));

        let e: EventContext = mem.read_val(ctx.layout.ev_ctxt_addr(IPA_OUT_EVENT_RING)).unwrap();
        assert_eq!(e.intmod(), IPA_OUT_INTMOD);
        let msi = e.msi_vector;
        assert_eq!(msi, IPA_OUT_EVENT_RING as u32);
    }

    #[test]
    fn region_too_small_fails_the_layout_stage() {
        let mem = Arc::new(CoherentMemory::new(CTRL_BASE, 4096));
        let r = DeviceContext::new(
            MhiConfiguration::default(),
            Arc::new(FakeRegisters::default()),
            mem,
            Arc::new(FakePlatform::default()),
            ControlRegion {
                base: CTRL_BASE,
                size: 4096,
            },
        );
        assert!(matches!(
            r,
            Err(MhiError::InitFailed("layout", ref e)) if matches!(**e, MhiError::AllocError(4096, _))
        ));
    }

    #[test]
    fn memory_too_small_fails_the_context_stage() {
        let size = ControlLayout::query_size();
        let mem = Arc::new(CoherentMemory::new(CTRL_BASE, 64));
        let r = DeviceContext::new(
            MhiConfiguration::default(),
            Arc::new(FakeRegisters::default()),
            mem,
            Arc::new(FakePlatform::default()),
            ControlRegion {
                base: CTRL_BASE,
                size,
            },
        );
        assert!(matches!(r, Err(MhiError::InitFailed("contexts", _))));
    }

    #[test]
    fn unknown_channels_are_rejected() {
        let (ctx, _queues, _mem) = context();
        assert!(matches!(ctx.channel(46), Err(MhiError::InvalidChannel(46))));
        assert!(matches!(ctx.channel(500), Err(MhiError::InvalidChannel(500))));
        assert_eq!(ctx.channels().count(), 48);
    }

    #[test]
    fn channel_state_is_mirrored_into_its_context() {
        let (ctx, _queues, mem) = context();
        let chan = ctx.channel(ids::SSR_IN).unwrap();
        for state in [
            ChannelState::Enabled,
            ChannelState::Running,
            ChannelState::Stop,
            ChannelState::Enabled,
        ] {
            chan.set_state(ctx.dma.as_ref(), state).unwrap();
            let c: ChannelContext = mem.read_val(chan.ctxt_addr).unwrap();
            let raw = c.state;
            assert_eq!(raw, state as u32);
            assert_eq!(chan.state().unwrap(), state);
        }
    }

    #[test]
    fn disabled_channel_rejects_start() {
        let (ctx, _queues, _mem) = context();
        assert!(matches!(
            command::send_command(&ctx, Command::Start, ids::QMI_OUT, false),
            Err(MhiError::InvalidChannelState(14, ChannelState::Disabled))
        ));
    }

    #[test]
    fn second_command_before_completion_is_pending() {
        let (ctx, _queues, mem) = context();
        ctx.channel(ids::QMI_OUT)
            .unwrap()
            .set_state(ctx.dma.as_ref(), ChannelState::Enabled)
            .unwrap();

        command::send_command(&ctx, Command::Start, ids::QMI_OUT, false).unwrap();
        assert!(matches!(
            command::send_command(&ctx, Command::Reset, ids::QMI_OUT, false),
            Err(MhiError::CommandPending(14))
        ));

        // the device is not in M0, so the doorbell waits
        let cmds = ctx.commands.lock().unwrap();
        assert!(cmds.ring.db_pending());
        let el: CommandElement = mem.read_val(cmds.ring.base()).unwrap();
        assert_eq!(el.packet_type(), Some(PacketType::StartChanCmd));
        assert_eq!(el.channel(), ids::QMI_OUT);
    }

    #[test]
    fn start_completion_clears_the_pending_slot() {
        let (ctx, _queues, _mem) = context();
        let chan = ctx.channel(ids::EFS_IN).unwrap();
        chan.set_state(ctx.dma.as_ref(), ChannelState::Enabled).unwrap();
        command::send_command(&ctx, Command::Start, ids::EFS_IN, false).unwrap();

        let ptr = ctx.commands.lock().unwrap().ring.base();
        let (el, pending) = command::take_completed(&ctx, ptr).unwrap();
        assert_eq!(el.channel(), ids::EFS_IN);
        assert_eq!(pending.map(|p| p.cmd), Some(Command::Start));
        assert!(ctx.commands.lock().unwrap().pending(ids::EFS_IN).is_none());

        // nothing else is outstanding
        assert!(command::take_completed(&ctx, ptr).is_err());
    }
}
