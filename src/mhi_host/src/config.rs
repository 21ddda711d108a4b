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

use std::cmp::{max, min};
use std::time::Duration;

use tracing::{Span, instrument};

/// Clamps a duration in milliseconds to `[lo, hi]`, mapping zero to `default`.
fn clamp_ms(value: Duration, default: u16, lo: u16, hi: u16) -> u16 {
    match value.as_millis() {
        0 => default,
        1.. => min(hi.into(), max(value.as_millis(), lo.into())) as u16,
    }
}

fn clamp_count(value: u16, default: u16, lo: u16, hi: u16) -> u16 {
    match value {
        0 => default,
        1.. => min(hi, max(value, lo)),
    }
}

/// Timing, batching and recovery parameters of one MHI device.
///
/// Every setter clamps its input to the `MIN_*`/`MAX_*` bounds and maps zero
/// to the `DEFAULT_*` value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MhiConfiguration {
    /// Delay between READY polls, in milliseconds
    ready_poll_interval: u16,
    /// Number of READY polls before giving up
    ready_poll_retries: u16,
    /// Delay between reads of a link returning all-ones, in milliseconds
    link_retry_interval: u16,
    /// Extra reads of a link returning all-ones after the first
    max_link_retries: u16,
    /// Idle time in M0 before the wake line is released, in milliseconds
    m1_entry_delay: u16,
    /// Time spent in M1/M2 before M3 is attempted, in milliseconds
    m3_entry_delay: u16,
    /// Bound on every M0/M3 wait, in milliseconds
    power_wait_timeout: u16,
    /// Bound on the wait for all channel START acknowledgements, in milliseconds
    channel_start_timeout: u16,
    /// Delay between checks while closing a channel, in milliseconds
    close_retry_interval: u16,
    /// Number of checks before a close gives up on outstanding acks
    close_retries: u16,
    /// Hardware inbound channels ring once per this many transfers
    xfer_db_interval: u16,
    /// Event rings are rung once per this many processed events
    event_db_interval: u16,
    // Stored as 0 for "disabled" so the struct stays Copy + Eq without an Option
    hw_out_db_skip: u16,
    /// Consecutive RESET transitions tolerated before giving up
    max_resets: u16,
    /// Depth of the state transition queue
    transition_queue_depth: u16,
    /// Events processed per interrupt before yielding
    event_quota: u16,
    /// Register write verification attempts
    verify_attempts: u8,
    /// Start of the modem's data window
    dma_window_start: u64,
    /// End (exclusive) of the modem's data window
    dma_window_end: u64,
}

impl MhiConfiguration {
    /// The default delay between READY polls (in milliseconds)
    pub const DEFAULT_READY_POLL_INTERVAL: u16 = 500;
    /// The minimum delay between READY polls (in milliseconds)
    pub const MIN_READY_POLL_INTERVAL: u16 = 1;
    /// The maximum delay between READY polls (in milliseconds)
    pub const MAX_READY_POLL_INTERVAL: u16 = 10_000;
    /// The default number of READY polls
    pub const DEFAULT_READY_POLL_RETRIES: u16 = 30;
    /// The maximum number of READY polls
    pub const MAX_READY_POLL_RETRIES: u16 = 1_000;
    /// The default link stability wait (in milliseconds)
    pub const DEFAULT_LINK_RETRY_INTERVAL: u16 = 100;
    /// The maximum link stability wait (in milliseconds)
    pub const MAX_LINK_RETRY_INTERVAL: u16 = 5_000;
    /// The default number of extra link reads
    pub const DEFAULT_MAX_LINK_RETRIES: u16 = 9;
    /// The maximum number of extra link reads
    pub const MAX_MAX_LINK_RETRIES: u16 = 100;
    /// The default idle time before M1 entry (in milliseconds)
    pub const DEFAULT_M1_ENTRY_DELAY: u16 = 100;
    /// The default delay before M3 entry (in milliseconds)
    pub const DEFAULT_M3_ENTRY_DELAY: u16 = 1_000;
    /// The default bound on M0/M3 waits (in milliseconds)
    pub const DEFAULT_POWER_WAIT_TIMEOUT: u16 = 2_000;
    /// The default bound on channel start acknowledgements (in milliseconds)
    pub const DEFAULT_CHANNEL_START_TIMEOUT: u16 = 5_000;
    /// The default delay between close checks (in milliseconds)
    pub const DEFAULT_CLOSE_RETRY_INTERVAL: u16 = 20;
    /// The default number of close checks
    pub const DEFAULT_CLOSE_RETRIES: u16 = 100;
    /// The maximum number of close checks
    pub const MAX_CLOSE_RETRIES: u16 = 10_000;
    /// The default transfer doorbell interval for hardware inbound channels
    pub const DEFAULT_XFER_DB_INTERVAL: u16 = 8;
    /// The maximum transfer doorbell interval
    pub const MAX_XFER_DB_INTERVAL: u16 = 128;
    /// The default event doorbell interval
    pub const DEFAULT_EVENT_DB_INTERVAL: u16 = 32;
    /// The maximum event doorbell interval
    pub const MAX_EVENT_DB_INTERVAL: u16 = 256;
    /// The default number of tolerated consecutive resets
    pub const DEFAULT_MAX_RESETS: u16 = 10;
    /// The maximum number of tolerated consecutive resets
    pub const MAX_MAX_RESETS: u16 = 100;
    /// The default transition queue depth
    pub const DEFAULT_TRANSITION_QUEUE_DEPTH: u16 = 128;
    /// The maximum transition queue depth
    pub const MAX_TRANSITION_QUEUE_DEPTH: u16 = 4_096;
    /// The default number of events handled per interrupt
    pub const DEFAULT_EVENT_QUOTA: u16 = 256;
    /// The default number of register write verification attempts
    pub const DEFAULT_VERIFY_ATTEMPTS: u8 = 5;
    /// The default start of the data window
    pub const DEFAULT_DMA_WINDOW_START: u64 = 0x4000_0000;
    /// The default end of the data window
    pub const DEFAULT_DMA_WINDOW_END: u64 = 0x7E80_0000;

    /// Set the delay between READY polls. Zero selects `DEFAULT_READY_POLL_INTERVAL`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_ready_poll_interval(&mut self, interval: Duration) {
        self.ready_poll_interval = clamp_ms(
            interval,
            Self::DEFAULT_READY_POLL_INTERVAL,
            Self::MIN_READY_POLL_INTERVAL,
            Self::MAX_READY_POLL_INTERVAL,
        );
    }

    /// Get the delay between READY polls
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval as u64)
    }

    /// Set how many times READY is polled before a reset is retried
    pub fn set_ready_poll_retries(&mut self, retries: u16) {
        self.ready_poll_retries = clamp_count(
            retries,
            Self::DEFAULT_READY_POLL_RETRIES,
            1,
            Self::MAX_READY_POLL_RETRIES,
        );
    }

    /// Get how many times READY is polled
    pub fn ready_poll_retries(&self) -> u16 {
        self.ready_poll_retries
    }

    /// Set the wait between reads of a link returning all-ones
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_link_retry_interval(&mut self, interval: Duration) {
        self.link_retry_interval = clamp_ms(
            interval,
            Self::DEFAULT_LINK_RETRY_INTERVAL,
            1,
            Self::MAX_LINK_RETRY_INTERVAL,
        );
    }

    /// Get the wait between link reads
    pub fn link_retry_interval(&self) -> Duration {
        Duration::from_millis(self.link_retry_interval as u64)
    }

    /// Set the number of extra link reads. Unlike the other counts zero is
    /// accepted and means a single read.
    pub fn set_max_link_retries(&mut self, retries: u16) {
        self.max_link_retries = min(retries, Self::MAX_MAX_LINK_RETRIES);
    }

    /// Get the number of extra link reads
    pub fn max_link_retries(&self) -> u16 {
        self.max_link_retries
    }

    /// Set the idle time in M0 after which the wake line is released
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_m1_entry_delay(&mut self, delay: Duration) {
        self.m1_entry_delay = clamp_ms(delay, Self::DEFAULT_M1_ENTRY_DELAY, 1, u16::MAX);
    }

    /// Get the idle time before M1 entry
    pub fn m1_entry_delay(&self) -> Duration {
        Duration::from_millis(self.m1_entry_delay as u64)
    }

    /// Set the time spent in M1/M2 before M3 is attempted
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_m3_entry_delay(&mut self, delay: Duration) {
        self.m3_entry_delay = clamp_ms(delay, Self::DEFAULT_M3_ENTRY_DELAY, 1, u16::MAX);
    }

    /// Get the delay before M3 entry
    pub fn m3_entry_delay(&self) -> Duration {
        Duration::from_millis(self.m3_entry_delay as u64)
    }

    /// Set the bound on M0 and M3 waits
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_power_wait_timeout(&mut self, timeout: Duration) {
        self.power_wait_timeout =
            clamp_ms(timeout, Self::DEFAULT_POWER_WAIT_TIMEOUT, 1, u16::MAX);
    }

    /// Get the bound on M0 and M3 waits
    pub fn power_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.power_wait_timeout as u64)
    }

    /// Set the bound on the wait for channel START acknowledgements
    pub fn set_channel_start_timeout(&mut self, timeout: Duration) {
        self.channel_start_timeout =
            clamp_ms(timeout, Self::DEFAULT_CHANNEL_START_TIMEOUT, 1, u16::MAX);
    }

    /// Get the bound on channel START acknowledgements
    pub fn channel_start_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_start_timeout as u64)
    }

    /// Set the delay between outstanding-ack checks in `close`
    pub fn set_close_retry_interval(&mut self, interval: Duration) {
        self.close_retry_interval =
            clamp_ms(interval, Self::DEFAULT_CLOSE_RETRY_INTERVAL, 1, 1_000);
    }

    /// Get the delay between close checks
    pub fn close_retry_interval(&self) -> Duration {
        Duration::from_millis(self.close_retry_interval as u64)
    }

    /// Set how many times `close` checks for outstanding acks
    pub fn set_close_retries(&mut self, retries: u16) {
        self.close_retries = clamp_count(
            retries,
            Self::DEFAULT_CLOSE_RETRIES,
            1,
            Self::MAX_CLOSE_RETRIES,
        );
    }

    /// Get how many times `close` checks for outstanding acks
    pub fn close_retries(&self) -> u16 {
        self.close_retries
    }

    /// Set the doorbell interval of hardware inbound channels
    pub fn set_xfer_db_interval(&mut self, interval: u16) {
        self.xfer_db_interval = clamp_count(
            interval,
            Self::DEFAULT_XFER_DB_INTERVAL,
            1,
            Self::MAX_XFER_DB_INTERVAL,
        );
    }

    /// Get the doorbell interval of hardware inbound channels
    pub fn xfer_db_interval(&self) -> u16 {
        self.xfer_db_interval
    }

    /// Set the event ring doorbell interval
    pub fn set_event_db_interval(&mut self, interval: u16) {
        self.event_db_interval = clamp_count(
            interval,
            Self::DEFAULT_EVENT_DB_INTERVAL,
            1,
            Self::MAX_EVENT_DB_INTERVAL,
        );
    }

    /// Get the event ring doorbell interval
    pub fn event_db_interval(&self) -> u16 {
        self.event_db_interval
    }

    /// Enable the hardware outbound doorbell skip: the channel is rung once
    /// per `interval` transfers. `None` rings on every transfer.
    pub fn set_hw_out_db_skip(&mut self, interval: Option<u16>) {
        self.hw_out_db_skip = match interval {
            Some(n) => min(max(n, 1), Self::MAX_XFER_DB_INTERVAL),
            None => 0,
        };
    }

    /// Get the hardware outbound doorbell skip interval
    pub fn hw_out_db_skip(&self) -> Option<u16> {
        match self.hw_out_db_skip {
            0 => None,
            n => Some(n),
        }
    }

    /// Set the number of consecutive resets tolerated before giving up
    pub fn set_max_resets(&mut self, resets: u16) {
        self.max_resets = clamp_count(resets, Self::DEFAULT_MAX_RESETS, 1, Self::MAX_MAX_RESETS);
    }

    /// Get the number of consecutive resets tolerated
    pub fn max_resets(&self) -> u16 {
        self.max_resets
    }

    /// Set the depth of the state transition queue
    pub fn set_transition_queue_depth(&mut self, depth: u16) {
        self.transition_queue_depth = clamp_count(
            depth,
            Self::DEFAULT_TRANSITION_QUEUE_DEPTH,
            1,
            Self::MAX_TRANSITION_QUEUE_DEPTH,
        );
    }

    /// Get the depth of the state transition queue
    pub fn transition_queue_depth(&self) -> u16 {
        self.transition_queue_depth
    }

    /// Set how many events one interrupt processes before yielding
    pub fn set_event_quota(&mut self, quota: u16) {
        self.event_quota = clamp_count(quota, Self::DEFAULT_EVENT_QUOTA, 1, u16::MAX);
    }

    /// Get the per-interrupt event quota
    pub fn event_quota(&self) -> u16 {
        self.event_quota
    }

    /// Set how many times a verified register write is attempted
    pub fn set_verify_attempts(&mut self, attempts: u8) {
        self.verify_attempts = match attempts {
            0 => Self::DEFAULT_VERIFY_ATTEMPTS,
            n => min(n, 32),
        };
    }

    /// Get the verified write attempt count
    pub fn verify_attempts(&self) -> u8 {
        self.verify_attempts
    }

    /// Set the modem data window. An empty or inverted window is ignored.
    pub fn set_dma_window(&mut self, start: u64, end: u64) {
        if start < end {
            self.dma_window_start = start;
            self.dma_window_end = end;
        } else {
            log::warn!("Ignoring empty DMA window {start:#x}..{end:#x}");
        }
    }

    /// Get the modem data window as `(start, end)`
    pub fn dma_window(&self) -> (u64, u64) {
        (self.dma_window_start, self.dma_window_end)
    }

    /// Whether `len` bytes at `addr` lie inside the data window. The end is
    /// exclusive on both ends of the comparison.
    pub fn buffer_in_window(&self, addr: u64, len: usize) -> bool {
        match addr.checked_add(len as u64) {
            Some(end) => addr >= self.dma_window_start && end < self.dma_window_end,
            None => false,
        }
    }
}

impl Default for MhiConfiguration {
    fn default() -> Self {
        Self {
            ready_poll_interval: Self::DEFAULT_READY_POLL_INTERVAL,
            ready_poll_retries: Self::DEFAULT_READY_POLL_RETRIES,
            link_retry_interval: Self::DEFAULT_LINK_RETRY_INTERVAL,
            max_link_retries: Self::DEFAULT_MAX_LINK_RETRIES,
            m1_entry_delay: Self::DEFAULT_M1_ENTRY_DELAY,
            m3_entry_delay: Self::DEFAULT_M3_ENTRY_DELAY,
            power_wait_timeout: Self::DEFAULT_POWER_WAIT_TIMEOUT,
            channel_start_timeout: Self::DEFAULT_CHANNEL_START_TIMEOUT,
            close_retry_interval: Self::DEFAULT_CLOSE_RETRY_INTERVAL,
            close_retries: Self::DEFAULT_CLOSE_RETRIES,
            xfer_db_interval: Self::DEFAULT_XFER_DB_INTERVAL,
            event_db_interval: Self::DEFAULT_EVENT_DB_INTERVAL,
            hw_out_db_skip: 0,
            max_resets: Self::DEFAULT_MAX_RESETS,
            transition_queue_depth: Self::DEFAULT_TRANSITION_QUEUE_DEPTH,
            event_quota: Self::DEFAULT_EVENT_QUOTA,
            verify_attempts: Self::DEFAULT_VERIFY_ATTEMPTS,
            dma_window_start: Self::DEFAULT_DMA_WINDOW_START,
            dma_window_end: Self::DEFAULT_DMA_WINDOW_END,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MhiConfiguration;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = MhiConfiguration::default();
        assert_eq!(cfg.ready_poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.ready_poll_retries(), 30);
        assert_eq!(cfg.max_link_retries(), 9);
        assert_eq!(cfg.m1_entry_delay(), Duration::from_millis(100));
        assert_eq!(cfg.m3_entry_delay(), Duration::from_millis(1000));
        assert_eq!(cfg.power_wait_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.xfer_db_interval(), 8);
        assert_eq!(cfg.event_db_interval(), 32);
        assert_eq!(cfg.max_resets(), 10);
        assert_eq!(cfg.transition_queue_depth(), 128);
        assert_eq!(cfg.hw_out_db_skip(), None);
        assert_eq!(cfg.dma_window(), (0x4000_0000, 0x7E80_0000));
    }

    #[test]
    fn setters_clamp_and_zero_means_default() {
        let mut cfg = MhiConfiguration::default();

        cfg.set_ready_poll_interval(Duration::from_secs(3600));
        assert_eq!(
            cfg.ready_poll_interval(),
            Duration::from_millis(MhiConfiguration::MAX_READY_POLL_INTERVAL as u64)
        );
        cfg.set_ready_poll_interval(Duration::ZERO);
        assert_eq!(cfg.ready_poll_interval(), Duration::from_millis(500));

        cfg.set_xfer_db_interval(1000);
        assert_eq!(cfg.xfer_db_interval(), MhiConfiguration::MAX_XFER_DB_INTERVAL);
        cfg.set_xfer_db_interval(0);
        assert_eq!(cfg.xfer_db_interval(), 8);

        cfg.set_max_link_retries(0);
        assert_eq!(cfg.max_link_retries(), 0);

        cfg.set_hw_out_db_skip(Some(0));
        assert_eq!(cfg.hw_out_db_skip(), Some(1));
        cfg.set_hw_out_db_skip(None);
        assert_eq!(cfg.hw_out_db_skip(), None);
    }

    #[test]
    fn data_window_end_is_exclusive() {
        let cfg = MhiConfiguration::default();
        assert!(cfg.buffer_in_window(0x4000_0000, 0x1000));
        assert!(!cfg.buffer_in_window(0x3FFF_F000, 0x1000));
        assert!(!cfg.buffer_in_window(0x7E7F_F000, 0x1000));
        assert!(cfg.buffer_in_window(0x7E7F_E000, 0x1000));
        assert!(!cfg.buffer_in_window(u64::MAX - 4, 16));
    }

    #[test]
    fn inverted_window_is_ignored() {
        let mut cfg = MhiConfiguration::default();
        cfg.set_dma_window(0x2000, 0x1000);
        assert_eq!(cfg.dma_window(), (0x4000_0000, 0x7E80_0000));
        cfg.set_dma_window(0x1000, 0x2000);
        assert_eq!(cfg.dma_window(), (0x1000, 0x2000));
    }
}
