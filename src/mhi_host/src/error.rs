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

use std::error::Error;
use std::sync::{MutexGuard, PoisonError};

use thiserror::Error;

use crate::channel::ChannelState;
use crate::mem::DmaError;
use crate::power::{MhiState, StateTransition};
use crate::ring::RingError;

/// The error type for MHI operations
#[derive(Error, Debug)]
pub enum MhiError {
    /// A channel was closed while the modem still owned outbound buffers
    #[error("Channel {0} closed with {1} outbound buffers still unacknowledged")]
    AcksOutstanding(u32, u64),

    /// Low power entry was refused because data is still in flight
    #[error("Low power entry aborted: {0} outbound acks and {1} pending transfers")]
    ActivityPending(u64, u64),

    /// The control region cannot hold the contexts and rings
    #[error("Control region of {0} bytes is too small, {1} bytes are required")]
    AllocError(usize, usize),

    /// A client is already registered on the channel
    #[error("Channel {0} already has a registered client")]
    AlreadyRegistered(u32),

    /// Anyhow error
    #[error("Anyhow Error was returned: {0}")]
    AnyhowError(#[from] anyhow::Error),

    /// The client handle no longer refers to a registered client
    #[error("Client handle for channel {0} is no longer registered")]
    BadHandle(u32),

    /// A transfer buffer lies outside the modem's data window
    #[error("Buffer {0:#x} of {1} bytes is outside the DMA data window")]
    BufferOutsideDmaWindow(u64, usize),

    /// A command is already outstanding on the channel
    #[error("A command is already pending on channel {0}")]
    CommandPending(u32),

    /// Channel start commands were not acknowledged in time
    #[error("{0} channel start commands were not acknowledged in time")]
    CommandTimeout(u32),

    /// No device is registered at the given index
    #[error("No device registered at index {0}")]
    DeviceNotFound(usize),

    /// The modem did not report READY
    #[error("Device did not report ready")]
    DeviceNotReady,

    /// DMA memory access failed
    #[error("DMA access failed: {0}")]
    Dma(#[from] DmaError),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// A stage of device construction failed
    #[error("Device initialization failed during {0}: {1}")]
    InitFailed(&'static str, Box<MhiError>),

    /// The channel number is not part of the channel map
    #[error("Channel {0} is not a valid MHI channel")]
    InvalidChannel(u32),

    /// The channel is not in a state that allows the operation
    #[error("Channel {0} is in state {1:?}")]
    InvalidChannelState(u32, ChannelState),

    /// The transfer length does not fit in a transfer element
    #[error("Transfer length {0} does not fit in a transfer element")]
    InvalidTransferLength(usize),

    /// The link returned the all-ones sentinel
    #[error("PCIe link is down")]
    LinkDown,

    /// An attempt to get a lock from a Mutex failed.
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// A power operation conflicts with one already in progress
    #[error("Operation not permitted: {0}")]
    NotPermitted(&'static str),

    /// The modem did not reach the requested power state in time
    #[error("Timed out waiting for the device to reach {0:?}")]
    PowerStateTimeout(MhiState),

    /// A verified register write did not read back
    #[error("Register {0:#x} read back {2:#x} after writing {1:#x}")]
    RegisterWriteMismatch(u32, u32, u32),

    /// Ring cursor or element error
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    /// The state transition queue is full
    #[error("Transition queue is full, dropped {0:?}")]
    TransitionQueueFull(StateTransition),

    /// Too many consecutive resets without reaching READY
    #[error("Device reset {0} times without reaching ready")]
    UnrecoverableReset(u32),

    /// The device workers have stopped
    #[error("Device workers are not running")]
    WorkerUnavailable,
}

impl From<&str> for MhiError {
    fn from(s: &str) -> Self {
        MhiError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for MhiError {
    // PoisonError borrows the guard, so only its message can be kept
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        MhiError::LockAttemptFailed(source)
    }
}

impl MhiError {
    /// The recovery transition this error calls for, if any.
    ///
    /// Link loss is handled by the LINK_DOWN path; a register that does not
    /// hold its value means the modem is wedged and goes through SYS_ERR.
    /// Everything else is returned to the caller and recovered there.
    pub(crate) fn escalation(&self) -> Option<StateTransition> {
        // exhaustive, every variant needs a decision
        match self {
            MhiError::LinkDown => Some(StateTransition::LinkDown),
            MhiError::RegisterWriteMismatch(_, _, _) => Some(StateTransition::SysErr),

            MhiError::AcksOutstanding(_, _)
            | MhiError::ActivityPending(_, _)
            | MhiError::AllocError(_, _)
            | MhiError::AlreadyRegistered(_)
            | MhiError::AnyhowError(_)
            | MhiError::BadHandle(_)
            | MhiError::BufferOutsideDmaWindow(_, _)
            | MhiError::CommandPending(_)
            | MhiError::CommandTimeout(_)
            | MhiError::DeviceNotFound(_)
            | MhiError::DeviceNotReady
            | MhiError::Dma(_)
            | MhiError::Error(_)
            | MhiError::InitFailed(_, _)
            | MhiError::InvalidChannel(_)
            | MhiError::InvalidChannelState(_, _)
            | MhiError::InvalidTransferLength(_)
            | MhiError::LockAttemptFailed(_)
            | MhiError::NotPermitted(_)
            | MhiError::PowerStateTimeout(_)
            | MhiError::Ring(_)
            | MhiError::TransitionQueueFull(_)
            | MhiError::UnrecoverableReset(_)
            | MhiError::WorkerUnavailable => None,
        }
    }
}

/// Creates a `MhiError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::MhiError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::MhiError::Error(__err_msg)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_and_register_faults_escalate() {
        assert_eq!(
            MhiError::LinkDown.escalation(),
            Some(StateTransition::LinkDown)
        );
        assert_eq!(
            MhiError::RegisterWriteMismatch(0x38, 0x200, 0).escalation(),
            Some(StateTransition::SysErr)
        );
    }

    #[test]
    fn caller_errors_do_not_escalate() {
        assert_eq!(MhiError::CommandPending(4).escalation(), None);
        assert_eq!(MhiError::Ring(RingError::Full).escalation(), None);
        assert_eq!(
            MhiError::PowerStateTimeout(MhiState::M3).escalation(),
            None
        );
    }

    #[test]
    fn new_error_formats_message() {
        let chan = 12;
        let err = new_error!("channel {} misbehaved", chan);
        assert_eq!(err.to_string(), "channel 12 misbehaved");
        let err = new_error!("plain");
        assert!(matches!(err, MhiError::Error(ref m) if m == "plain"));
    }
}
