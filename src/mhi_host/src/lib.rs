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

#![warn(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

//! Host side of the Modem Host Interface (MHI).
//!
//! MHI multiplexes many logical channels over one PCIe-class link. The host
//! and the modem share a control segment holding channel, event and command
//! contexts, each describing a ring of 16-byte elements in DMA-visible
//! memory. The host posts transfer and command elements and signals the
//! modem through doorbell registers; the modem reports completions and
//! power-state changes on event rings and raises MSIs.
//!
//! The crate is driven through three platform seams:
//!
//! - [`MmioOps`]: 32-bit access to the modem register space
//! - [`DmaOps`]: byte access to memory visible to the modem
//! - [`PlatformOps`]: link power and the device-wake line
//!
//! An [`MhiDevice`] owns the rings and the worker threads. Clients open
//! channels through [`MhiDevice::open_channel`] and move buffers through the
//! returned [`ClientHandle`].

/// Per-channel state and the static channel map
pub mod channel;
/// Channel client API
pub mod client;
/// Command ring and per-channel pending command tracking
pub(crate) mod command;
/// Configuration for a device instance
pub mod config;
/// Power and data path counters
pub mod counters;
/// The device aggregate, its workers and the device registry
pub mod device;
/// Doorbell writes and deferred doorbell rings
pub(crate) mod doorbell;
/// Error types
pub mod error;
/// Event ring processing
pub(crate) mod event;
/// DMA-visible memory and the control segment layout
pub mod mem;
/// Metric definitions
pub(crate) mod metrics;
/// Register access and the MMIO bring-up sequence
pub mod mmio;
/// Power management and the state transition engine
pub mod power;
/// Ring cursors, ring elements and context layouts
pub mod ring;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelState, Direction};
pub use client::{
    CallbackInfo, CallbackReason, ClientHandle, ClientInfo, TransferResult, TransferStatus,
    endpoint_id, max_buffers,
};
pub use command::Command;
pub use config::MhiConfiguration;
pub use counters::CountersSnapshot;
pub use device::registry::DeviceRegistry;
pub use device::{ControlRegion, InterruptHandle, MhiDevice};
pub use error::MhiError;
pub use mem::{CoherentMemory, DmaError, DmaOps, DmaOpsExt};
pub use mmio::MmioOps;
pub use power::{ExecEnv, MhiState, PlatformOps, StateTransition};
pub use ring::RingError;

/// The universal Result type used throughout the crate
pub type Result<T> = core::result::Result<T, error::MhiError>;
