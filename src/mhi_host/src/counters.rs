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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Device-local counters, updated lock free.
        #[derive(Debug, Default)]
        pub(crate) struct Counters {
            $(pub(crate) $name: AtomicU64,)*
            pub(crate) offload_enabled: AtomicBool,
        }

        /// A point-in-time copy of the device counters
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct CountersSnapshot {
            $($(#[$doc])* pub $name: u64,)*
            /// The modem switched the hardware channels to offload mode
            pub offload_enabled: bool,
        }

        impl Counters {
            pub(crate) fn snapshot(&self) -> CountersSnapshot {
                CountersSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                    offload_enabled: self.offload_enabled.load(Ordering::Relaxed),
                }
            }
        }
    };
}

counters! {
    /// M0 to M1 transitions
    m0_m1,
    /// M1 to M2 transitions
    m1_m2,
    /// M1 to M0 transitions
    m1_m0,
    /// M2 to M0 transitions
    m2_m0,
    /// M3 to M0 transitions
    m3_m0,
    /// M0 to M3 transitions
    m0_m3,
    /// Waits for M0 that timed out
    m0_event_timeouts,
    /// Waits for M3 that timed out
    m3_event_timeouts,
    /// Link down transitions handled
    link_down,
    /// RESET transitions handled
    device_resets,
    /// SYS_ERR transitions handled
    sys_err,
    /// Doorbell register writes
    doorbell_writes,
    /// Transfer elements completed by the modem
    transfer_completions,
    /// Transfer events that reported an error code
    transfer_errors,
    /// Inbound completions that found the ring empty
    empty_ring_removals,
    /// Events consumed from all event rings
    events_processed,
}

impl Counters {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
