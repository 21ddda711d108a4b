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

//! Access to the modem's MHI register space.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use crate::power::MhiState;
use crate::{MhiError, Result};

/// The MMIO bring-up sequence and readiness polls
pub(crate) mod init;

/// Value read back from every register while the link is down
pub const LINK_DOWN_SENTINEL: u32 = 0xFFFF_FFFF;
/// Protocol version this host implements
pub const MHI_VERSION: u32 = 0x0100_0000;

/// Register offsets from the start of the MHI register space. Address
/// registers are LOW/HIGH pairs at `offset` and `offset + 4`.
pub mod regs {
    #![allow(missing_docs)]
    pub const MHIREGLEN: u32 = 0x00;
    pub const MHIVER: u32 = 0x08;
    pub const MHICFG: u32 = 0x10;
    pub const CHDBOFF: u32 = 0x18;
    pub const ERDBOFF: u32 = 0x20;
    pub const MHICTRL: u32 = 0x38;
    pub const MHISTATUS: u32 = 0x48;
    pub const CCABAP: u32 = 0x58;
    pub const ECABAP: u32 = 0x60;
    pub const CRCBAP: u32 = 0x68;
    pub const CRDB: u32 = 0x70;
    pub const MHICTRLBASE: u32 = 0x80;
    pub const MHICTRLLIMIT: u32 = 0x88;
    pub const MHIDATABASE: u32 = 0x98;
    pub const MHIDATALIMIT: u32 = 0xA0;
}

/// Platform access to the modem register space.
///
/// A read of [`LINK_DOWN_SENTINEL`] means the link is down. Writes must reach
/// the device in program order.
pub trait MmioOps: Send + Sync {
    /// Read the 32-bit register at `offset`
    fn read32(&self, offset: u32) -> u32;
    /// Write the 32-bit register at `offset`
    fn write32(&self, offset: u32, value: u32);
}

/// MHICTRL register contents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MhiCtrl(u32);

impl MhiCtrl {
    const RESET: u32 = 1 << 1;
    const STATE_SHIFT: u32 = 8;
    const STATE_MASK: u32 = 0xFF << Self::STATE_SHIFT;

    /// Wrap a raw register value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Requested MHI state
    pub fn state(&self) -> Option<MhiState> {
        MhiState::from_raw((self.0 & Self::STATE_MASK) >> Self::STATE_SHIFT)
    }

    /// Replace the requested MHI state
    pub fn with_state(self, state: MhiState) -> Self {
        Self((self.0 & !Self::STATE_MASK) | ((state as u32) << Self::STATE_SHIFT))
    }

    /// Whether the reset request bit is set
    pub fn reset(&self) -> bool {
        self.0 & Self::RESET != 0
    }

    /// Set or clear the reset request bit
    pub fn with_reset(self, on: bool) -> Self {
        if on {
            Self(self.0 | Self::RESET)
        } else {
            Self(self.0 & !Self::RESET)
        }
    }
}

/// MHISTATUS register contents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MhiStatus(u32);

impl MhiStatus {
    const READY: u32 = 1 << 0;
    const SYSERR: u32 = 1 << 2;
    const STATE_SHIFT: u32 = 8;
    const STATE_MASK: u32 = 0xFF << Self::STATE_SHIFT;

    /// Wrap a raw register value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether the register read hit a dead link
    pub fn link_down(&self) -> bool {
        self.0 == LINK_DOWN_SENTINEL
    }

    /// The device finished its own reset and can be programmed
    pub fn ready(&self) -> bool {
        self.0 & Self::READY != 0
    }

    /// The device reports a system error
    pub fn syserr(&self) -> bool {
        self.0 & Self::SYSERR != 0
    }

    /// Current device MHI state
    pub fn state(&self) -> Option<MhiState> {
        MhiState::from_raw((self.0 & Self::STATE_MASK) >> Self::STATE_SHIFT)
    }

    /// Build a status word, as a device would report it
    pub fn new(state: MhiState, ready: bool, syserr: bool) -> Self {
        let mut bits = (state as u32) << Self::STATE_SHIFT;
        if ready {
            bits |= Self::READY;
        }
        if syserr {
            bits |= Self::SYSERR;
        }
        Self(bits)
    }
}

/// Register access with link-down detection and write verification
pub(crate) struct Registers {
    mmio: Arc<dyn MmioOps>,
    verify_attempts: u8,
}

impl std::fmt::Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registers")
            .field("verify_attempts", &self.verify_attempts)
            .finish()
    }
}

impl Registers {
    pub(crate) fn new(mmio: Arc<dyn MmioOps>, verify_attempts: u8) -> Self {
        Self {
            mmio,
            verify_attempts,
        }
    }

    /// Raw read, sentinel included
    pub(crate) fn read_raw(&self, offset: u32) -> u32 {
        self.mmio.read32(offset)
    }

    /// Read a register, failing with `LinkDown` on the all-ones sentinel
    pub(crate) fn read(&self, offset: u32) -> Result<u32> {
        match self.mmio.read32(offset) {
            LINK_DOWN_SENTINEL => {
                log::error!("Register {offset:#x} read all-ones, link is down");
                Err(MhiError::LinkDown)
            }
            v => Ok(v),
        }
    }

    /// Read the field `mask` of a register, shifted down by `shift`
    pub(crate) fn read_field(&self, offset: u32, mask: u32, shift: u32) -> Result<u32> {
        Ok((self.read(offset)? & mask) >> shift)
    }

    pub(crate) fn write(&self, offset: u32, value: u32) {
        log::trace!("reg[{offset:#x}] <- {value:#x}");
        self.mmio.write32(offset, value);
    }

    /// Read-modify-write of the field `mask` at `shift`
    pub(crate) fn write_field(&self, offset: u32, mask: u32, shift: u32, value: u32) -> Result<()> {
        let old = self.read(offset)?;
        self.write(offset, (old & !mask) | ((value << shift) & mask));
        Ok(())
    }

    /// Write a register and read it back, retrying until it holds the value
    pub(crate) fn write_verified(&self, offset: u32, value: u32) -> Result<()> {
        let mut last = 0;
        for attempt in 1..=self.verify_attempts {
            self.write(offset, value);
            last = self.read(offset)?;
            if last == value {
                return Ok(());
            }
            log::warn!(
                "reg[{offset:#x}] holds {last:#x} after writing {value:#x}, attempt {attempt}"
            );
        }
        Err(MhiError::RegisterWriteMismatch(offset, value, last))
    }

    /// Program a LOW/HIGH address pair, high word first, verifying both
    pub(crate) fn write_addr_verified(&self, offset: u32, value: u64) -> Result<()> {
        self.write_verified(offset + 4, (value >> 32) as u32)?;
        self.write_verified(offset, value as u32)
    }

    /// Write a LOW/HIGH doorbell pair, high word first, fenced on each side
    pub(crate) fn write_doorbell(&self, offset: u32, value: u64) {
        fence(Ordering::SeqCst);
        self.write(offset + 4, (value >> 32) as u32);
        fence(Ordering::SeqCst);
        self.write(offset, value as u32);
        fence(Ordering::SeqCst);
    }

    /// Request a device MHI state through MHICTRL
    pub(crate) fn set_mhi_state(&self, state: MhiState) -> Result<()> {
        log::debug!("Requesting MHI state {state:?}");
        self.write_field(
            regs::MHICTRL,
            MhiCtrl::STATE_MASK,
            MhiCtrl::STATE_SHIFT,
            state as u32,
        )
    }

    pub(crate) fn status(&self) -> MhiStatus {
        MhiStatus::from_bits(self.read_raw(regs::MHISTATUS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegisters;

    #[test]
    fn ctrl_state_field() {
        let ctrl = MhiCtrl::from_bits(0xFFFF_0002).with_state(MhiState::M3);
        assert_eq!(ctrl.bits(), 0xFFFF_0502);
        assert_eq!(ctrl.state(), Some(MhiState::M3));
        assert!(ctrl.reset());
        assert!(!ctrl.with_reset(false).reset());
    }

    #[test]
    fn status_fields() {
        let s = MhiStatus::new(MhiState::Ready, true, false);
        assert_eq!(s.bits(), 0x0101);
        assert!(s.ready());
        assert!(!s.syserr());
        assert_eq!(s.state(), Some(MhiState::Ready));
        assert!(MhiStatus::from_bits(LINK_DOWN_SENTINEL).link_down());
    }

    #[test]
    fn sentinel_read_is_link_down() {
        let fake = Arc::new(FakeRegisters::default());
        fake.set(regs::MHIVER, LINK_DOWN_SENTINEL);
        let r = Registers::new(fake, 5);
        assert!(matches!(r.read(regs::MHIVER), Err(MhiError::LinkDown)));
    }

    #[test]
    fn field_write_preserves_other_bits() {
        let fake = Arc::new(FakeRegisters::default());
        fake.set(regs::MHICTRL, 0x0000_0102);
        let r = Registers::new(fake.clone(), 5);
        r.set_mhi_state(MhiState::M0).unwrap();
        assert_eq!(fake.get(regs::MHICTRL), 0x0000_0202);
        assert_eq!(r.read_field(regs::MHICTRL, 0xFF00, 8).unwrap(), 2);
    }

    #[test]
    fn verified_write_gives_up_after_configured_attempts() {
        let fake = Arc::new(FakeRegisters::default());
        fake.make_read_only(regs::CCABAP, 0x1234);
        let r = Registers::new(fake.clone(), 3);
        match r.write_verified(regs::CCABAP, 0x4000_0000) {
            Err(MhiError::RegisterWriteMismatch(off, want, got)) => {
                assert_eq!((off, want, got), (regs::CCABAP, 0x4000_0000, 0x1234));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fake.writes_to(regs::CCABAP), 3);
    }

    #[test]
    fn doorbell_writes_high_word_first() {
        let fake = Arc::new(FakeRegisters::default());
        let r = Registers::new(fake.clone(), 5);
        r.write_doorbell(0x400, 0x0000_0001_4000_0010);
        assert_eq!(
            fake.write_log(),
            vec![(0x404, 0x0000_0001), (0x400, 0x4000_0010)]
        );
    }
}
