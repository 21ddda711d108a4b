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

use std::thread;

use tracing::{Span, instrument};

use super::{LINK_DOWN_SENTINEL, MHI_VERSION, Registers, regs};
use crate::channel::{ChannelState, MAX_CHANNELS, is_valid};
use crate::config::MhiConfiguration;
use crate::device::DeviceContext;
use crate::mem::DmaOpsExt;
use crate::ring::NUM_EVENT_RINGS;
use crate::ring::context::ChannelContext;
use crate::{MhiError, Result, new_error};

const MHICFG_NER_MASK: u32 = 0x00FF_0000;
const MHICFG_NER_SHIFT: u32 = 16;

/// Read MHIREGLEN until the link stops returning all-ones.
///
/// The register is read at most `max_link_retries + 1` times.
pub(crate) fn wait_for_device(regs: &Registers, config: &MhiConfiguration) -> Result<()> {
    let retries = config.max_link_retries();
    for attempt in 0..=retries {
        if regs.read_raw(regs::MHIREGLEN) != LINK_DOWN_SENTINEL {
            log::info!("Link is stable after {attempt} retries");
            return Ok(());
        }
        log::warn!("Link returned all-ones, attempt {} of {}", attempt + 1, retries + 1);
        if attempt < retries {
            thread::sleep(config.link_retry_interval());
        }
    }
    Err(MhiError::LinkDown)
}

/// Poll MHISTATUS for the READY bit.
pub(crate) fn test_for_device_ready(regs: &Registers, config: &MhiConfiguration) -> Result<()> {
    let retries = config.ready_poll_retries();
    for attempt in 1..=retries {
        let status = regs.status();
        if status.link_down() {
            return Err(MhiError::LinkDown);
        }
        if status.ready() {
            log::debug!("Device ready after {attempt} polls");
            return Ok(());
        }
        if attempt < retries {
            thread::sleep(config.ready_poll_interval());
        }
    }
    Err(MhiError::DeviceNotReady)
}

/// Program the context and segment base registers, enable every valid
/// channel and read back the doorbell offsets.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn init_mmio(dev: &DeviceContext) -> Result<()> {
    let regs = &dev.regs;

    if regs.read_raw(regs::MHIREGLEN) == 0 {
        return Err(new_error!("MHI register space reports zero length"));
    }

    let mut version = regs.read_raw(regs::MHIVER);
    if version == LINK_DOWN_SENTINEL {
        wait_for_device(regs, &dev.config)?;
        version = regs.read(regs::MHIVER)?;
    }
    if version != MHI_VERSION {
        return Err(new_error!(
            "Unsupported MHI version {:#x}, expected {:#x}",
            version,
            MHI_VERSION
        ));
    }

    let ner = regs.read_field(regs::MHICFG, MHICFG_NER_MASK, MHICFG_NER_SHIFT)?;
    if ner != 0 && (ner as usize) < NUM_EVENT_RINGS {
        log::warn!("Device supports {ner} event rings, {NUM_EVENT_RINGS} are configured");
    }

    let layout = &dev.layout;
    let (data_start, data_end) = dev.config.dma_window();
    regs.write_addr_verified(regs::CCABAP, layout.chan_ctxt_base())?;
    regs.write_addr_verified(regs::ECABAP, layout.ev_ctxt_base())?;
    regs.write_addr_verified(regs::CRCBAP, layout.cmd_ctxt_addr())?;
    regs.write_addr_verified(regs::MHICTRLBASE, layout.base())?;
    regs.write_addr_verified(regs::MHICTRLLIMIT, layout.limit())?;
    regs.write_addr_verified(regs::MHIDATABASE, data_start)?;
    regs.write_addr_verified(regs::MHIDATALIMIT, data_end - 1)?;

    for chan in 0..MAX_CHANNELS {
        let state = if is_valid(chan) {
            ChannelState::Enabled
        } else {
            ChannelState::Disabled
        };
        match dev.channel(chan) {
            Ok(c) => c.set_state(dev.dma.as_ref(), state)?,
            Err(_) => {
                let addr = layout.chan_ctxt_addr(chan) + ChannelContext::STATE_OFFSET as u64;
                dev.dma.write_val(addr, state as u32)?;
            }
        }
    }

    let chdb = regs.read(regs::CHDBOFF)?;
    let erdb = regs.read(regs::ERDBOFF)?;
    dev.doorbells.set_bases(chdb, erdb);
    log::info!("MMIO programmed, version {version:#x}, CHDB {chdb:#x}, ERDB {erdb:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::channel::ids;
    use crate::device::ControlRegion;
    use crate::mem::{CoherentMemory, ControlLayout};
    use crate::mmio::MhiStatus;
    use crate::power::MhiState;
    use crate::testing::{FakePlatform, FakeRegisters};

    const CTRL_BASE: u64 = 0x1000_0000;

    fn fast_config() -> MhiConfiguration {
        let mut cfg = MhiConfiguration::default();
        cfg.set_link_retry_interval(Duration::from_millis(1));
        cfg.set_ready_poll_interval(Duration::from_millis(1));
        cfg
    }

    #[test]
    fn ten_all_ones_reads_fail_the_device_wait() {
        let cfg = fast_config();
        let fake = Arc::new(FakeRegisters::default());
        fake.set(regs::MHIREGLEN, 0x1000);
        fake.script_reads(regs::MHIREGLEN, [LINK_DOWN_SENTINEL; 10]);
        let r = Registers::new(fake.clone(), 5);

        assert!(matches!(wait_for_device(&r, &cfg), Err(MhiError::LinkDown)));
        assert_eq!(fake.reads_of(regs::MHIREGLEN), 10);
    }

    #[test]
    fn nine_all_ones_reads_then_link_is_up() {
        let cfg = fast_config();
        let fake = Arc::new(FakeRegisters::default());
        fake.set(regs::MHIREGLEN, 0x1000);
        fake.script_reads(regs::MHIREGLEN, [LINK_DOWN_SENTINEL; 9]);
        let r = Registers::new(fake.clone(), 5);

        assert!(wait_for_device(&r, &cfg).is_ok());
        assert_eq!(fake.reads_of(regs::MHIREGLEN), 10);
    }

    #[test]
    fn ready_poll_outcomes() {
        let mut cfg = fast_config();
        cfg.set_ready_poll_retries(3);

        let fake = Arc::new(FakeRegisters::default());
        let r = Registers::new(fake.clone(), 5);
        assert!(matches!(
            test_for_device_ready(&r, &cfg),
            Err(MhiError::DeviceNotReady)
        ));
        assert_eq!(fake.reads_of(regs::MHISTATUS), 3);

        fake.script_reads(regs::MHISTATUS, [0, 0]);
        fake.set(
            regs::MHISTATUS,
            MhiStatus::new(MhiState::Ready, true, false).bits(),
        );
        assert!(test_for_device_ready(&r, &cfg).is_ok());

        fake.set(regs::MHISTATUS, LINK_DOWN_SENTINEL);
        assert!(matches!(
            test_for_device_ready(&r, &cfg),
            Err(MhiError::LinkDown)
        ));
    }

    fn device(fake: Arc<FakeRegisters>) -> (Arc<DeviceContext>, Arc<CoherentMemory>) {
        let size = ControlLayout::query_size();
        let mem = Arc::new(CoherentMemory::new(CTRL_BASE, size));
        let (ctx, _queues) = DeviceContext::new(
            fast_config(),
            fake,
            mem.clone(),
            Arc::new(FakePlatform::default()),
            ControlRegion {
                base: CTRL_BASE,
                size,
            },
        )
        .unwrap();
        (ctx, mem)
    }

    fn registers() -> Arc<FakeRegisters> {
        let fake = Arc::new(FakeRegisters::default());
        fake.set(regs::MHIREGLEN, 0x1000);
        fake.set(regs::MHIVER, MHI_VERSION);
        fake.set(regs::CHDBOFF, 0x400);
        fake.set(regs::ERDBOFF, 0x800);
        fake
    }

    #[test]
    fn all_ones_version_waits_for_the_link() {
        let fake = registers();
        fake.script_reads(regs::MHIVER, [LINK_DOWN_SENTINEL]);
        let (ctx, _mem) = device(fake.clone());

        init_mmio(&ctx).unwrap();
        assert_eq!(fake.reads_of(regs::MHIVER), 2);
        // one length check, one link check
        assert_eq!(fake.reads_of(regs::MHIREGLEN), 2);
        assert_eq!(ctx.doorbells.channel(0), 0x400);
    }

    #[test]
    fn zero_length_fails_before_the_version_is_read() {
        let fake = registers();
        fake.set(regs::MHIREGLEN, 0);
        let (ctx, _mem) = device(fake.clone());

        assert!(init_mmio(&ctx).is_err());
        assert_eq!(fake.reads_of(regs::MHIVER), 0);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let fake = registers();
        fake.set(regs::MHIVER, 0x0200_0000);
        let (ctx, _mem) = device(fake);
        assert!(init_mmio(&ctx).is_err());
    }

    #[test]
    fn channel_states_are_written_to_the_contexts() {
        let (ctx, mem) = device(registers());
        init_mmio(&ctx).unwrap();

        let state_of = |chan: u32| -> u32 {
            mem.read_val(ctx.layout.chan_ctxt_addr(chan) + ChannelContext::STATE_OFFSET as u64)
                .unwrap()
        };
        assert_eq!(state_of(ids::DIAG_OUT), ChannelState::Enabled as u32);
        assert_eq!(state_of(ids::IP_HW_0_IN), ChannelState::Enabled as u32);
        assert_eq!(state_of(46), ChannelState::Disabled as u32);
        assert_eq!(
            ctx.channel(ids::DIAG_OUT).unwrap().state().unwrap(),
            ChannelState::Enabled
        );
    }
}
