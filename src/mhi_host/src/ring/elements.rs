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

//! Ring element formats.
//!
//! All three element kinds are 16 bytes: a 64-bit pointer followed by two
//! 32-bit words whose bit fields are exposed through accessors.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

const LEN_MASK: u32 = 0xFFFF;
const TYPE_SHIFT: u32 = 16;
const BYTE_MASK: u32 = 0xFF;
const CHID_SHIFT: u32 = 24;
const CODE_SHIFT: u32 = 24;

bitflags! {
    /// Control bits in the `info` word of a transfer element.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TreFlags: u32 {
        /// The next element belongs to the same transfer.
        const CHAIN = 1 << 0;
        /// Interrupt when the block ends.
        const IEOB  = 1 << 8;
        /// Interrupt when the transfer ends.
        const IEOT  = 1 << 9;
        /// Suppress the interrupt for the block event.
        const BEI   = 1 << 10;
    }
}

/// Element type field shared by all elements
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// No-op command
    NoopCmd = 0x01,
    /// Transfer element
    Transfer = 0x02,
    /// Reset channel command
    ResetChanCmd = 0x10,
    /// Stop channel command
    StopChanCmd = 0x11,
    /// Start channel command
    StartChanCmd = 0x12,
    /// MHI state change event
    StateChangeEvent = 0x20,
    /// Command completion event
    CmdCompletionEvent = 0x21,
    /// Transfer completion event
    TxEvent = 0x22,
    /// Execution environment change event
    EeEvent = 0x40,
}

impl PacketType {
    /// Decode a raw type field
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::NoopCmd,
            0x02 => Self::Transfer,
            0x10 => Self::ResetChanCmd,
            0x11 => Self::StopChanCmd,
            0x12 => Self::StartChanCmd,
            0x20 => Self::StateChangeEvent,
            0x21 => Self::CmdCompletionEvent,
            0x22 => Self::TxEvent,
            0x40 => Self::EeEvent,
            _ => return None,
        })
    }
}

/// Completion code carried by transfer and command completion events
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompletionCode {
    /// Invalid
    Invalid = 0,
    /// Success
    Success = 1,
    /// End of transfer
    Eot = 2,
    /// The buffer was too small
    Overflow = 3,
    /// End of block
    Eob = 4,
    /// Out of buffers; the channel switches to per-transfer doorbells
    Oob = 5,
    /// The modem requests doorbell mode
    DbMode = 6,
    /// Undefined modem error
    UndefinedErr = 0x10,
    /// Malformed ring element
    RingElError = 0x11,
}

impl CompletionCode {
    /// Decode a raw completion code
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Invalid,
            1 => Self::Success,
            2 => Self::Eot,
            3 => Self::Overflow,
            4 => Self::Eob,
            5 => Self::Oob,
            6 => Self::DbMode,
            0x10 => Self::UndefinedErr,
            0x11 => Self::RingElError,
            _ => return None,
        })
    }
}

/// A transfer ring element describing one buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct TransferElement {
    /// Bus address of the buffer
    pub buffer_ptr: u64,
    /// Length in bits [15:0]
    pub len: u32,
    /// Control flags and element type
    pub info: u32,
}

const _: () = assert!(core::mem::size_of::<TransferElement>() == 16);

impl TransferElement {
    /// Size of the element in bytes
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Build a transfer element for `len` bytes at `buffer_ptr`
    pub fn new(buffer_ptr: u64, len: u16, flags: TreFlags) -> Self {
        Self {
            buffer_ptr,
            len: len as u32,
            info: flags.bits() | ((PacketType::Transfer as u32) << TYPE_SHIFT),
        }
    }

    /// Buffer length
    #[inline]
    pub fn buf_len(&self) -> u16 {
        (self.len & LEN_MASK) as u16
    }

    /// Replace the buffer length, keeping the reserved upper bits
    #[inline]
    pub fn set_len(&mut self, len: u16) {
        self.len = (self.len & !LEN_MASK) | len as u32;
    }

    /// Control flags
    #[inline]
    pub fn flags(&self) -> TreFlags {
        TreFlags::from_bits_truncate(self.info)
    }

    /// Element type
    #[inline]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_raw(((self.info >> TYPE_SHIFT) & BYTE_MASK) as u8)
    }
}

/// A command ring element.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct CommandElement {
    /// Reserved
    pub reserved0: u64,
    /// Reserved
    pub reserved1: u32,
    /// Command type in bits [23:16], channel in bits [31:24]
    pub info: u32,
}

const _: () = assert!(core::mem::size_of::<CommandElement>() == 16);

impl CommandElement {
    /// Build a command element of `kind` addressed to `channel`
    pub fn new(kind: PacketType, channel: u32) -> Self {
        Self {
            reserved0: 0,
            reserved1: 0,
            info: ((kind as u32) << TYPE_SHIFT) | ((channel & BYTE_MASK) << CHID_SHIFT),
        }
    }

    /// Command type
    #[inline]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_raw(((self.info >> TYPE_SHIFT) & BYTE_MASK) as u8)
    }

    /// Target channel
    #[inline]
    pub fn channel(&self) -> u32 {
        (self.info >> CHID_SHIFT) & BYTE_MASK
    }
}

/// An event ring element written by the modem.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct EventElement {
    /// Completed element for transfer and command events
    pub ptr: u64,
    /// Code in bits [31:24] and length in bits [15:0], or the new state or
    /// execution environment in bits [31:24]
    pub details: u32,
    /// Type in bits [23:16], channel in bits [31:24]
    pub info: u32,
}

const _: () = assert!(core::mem::size_of::<EventElement>() == 16);

impl EventElement {
    /// A transfer completion for the element at `ptr` on `channel`
    pub fn transfer(ptr: u64, code: CompletionCode, len: u16, channel: u32) -> Self {
        Self {
            ptr,
            details: ((code as u32) << CODE_SHIFT) | len as u32,
            info: ((PacketType::TxEvent as u32) << TYPE_SHIFT)
                | ((channel & BYTE_MASK) << CHID_SHIFT),
        }
    }

    /// A completion for the command element at `ptr`
    pub fn command_completion(ptr: u64, code: CompletionCode) -> Self {
        Self {
            ptr,
            details: (code as u32) << CODE_SHIFT,
            info: (PacketType::CmdCompletionEvent as u32) << TYPE_SHIFT,
        }
    }

    /// A state change to the raw MHI state `state`
    pub fn state_change(state: u32) -> Self {
        Self {
            ptr: 0,
            details: (state & BYTE_MASK) << CODE_SHIFT,
            info: (PacketType::StateChangeEvent as u32) << TYPE_SHIFT,
        }
    }

    /// An execution environment change to the raw environment `env`
    pub fn exec_env(env: u32) -> Self {
        Self {
            ptr: 0,
            details: (env & BYTE_MASK) << CODE_SHIFT,
            info: (PacketType::EeEvent as u32) << TYPE_SHIFT,
        }
    }

    /// Event type
    #[inline]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_raw(self.raw_type())
    }

    /// Raw event type, for logging unknown events
    #[inline]
    pub fn raw_type(&self) -> u8 {
        ((self.info >> TYPE_SHIFT) & BYTE_MASK) as u8
    }

    /// Raw completion code
    #[inline]
    pub fn raw_code(&self) -> u8 {
        ((self.details >> CODE_SHIFT) & BYTE_MASK) as u8
    }

    /// Completion code
    #[inline]
    pub fn code(&self) -> Option<CompletionCode> {
        CompletionCode::from_raw(self.raw_code())
    }

    /// Transferred length
    #[inline]
    pub fn xfer_len(&self) -> u16 {
        (self.details & LEN_MASK) as u16
    }

    /// Channel of a transfer event
    #[inline]
    pub fn channel(&self) -> u32 {
        (self.info >> CHID_SHIFT) & BYTE_MASK
    }

    /// Raw state of a state change event
    #[inline]
    pub fn state(&self) -> u32 {
        (self.details >> CODE_SHIFT) & BYTE_MASK
    }

    /// Raw environment of an execution environment event
    #[inline]
    pub fn env(&self) -> u32 {
        (self.details >> CODE_SHIFT) & BYTE_MASK
    }
}
