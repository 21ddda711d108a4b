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


use log::Level;
use mhi_testing::simplelogger::{LOGGER, SimpleLogger};
use mhi_testing::wait_until;

pub mod common; // pub to disable dead_code warning
use common::{WAIT, bring_up, new_harness, test_config};

// The logger is process wide and captures every worker thread, so this
// binary holds a single test.
#[test]
fn lifecycle_is_logged() {
    SimpleLogger::initialize_test_logger();
    LOGGER.clear_log_calls();

    let h = bring_up(test_config());
    let amss = LOGGER.find_log_calls("Device is running AMSS");
    assert_eq!(amss.len(), 1);
    assert_eq!(amss[0].level, Level::Info);
    assert_eq!(amss[0].target, "mhi_host::power::transition");

    let mmio = LOGGER.find_log_calls("MMIO programmed");
    assert_eq!(mmio.len(), 1);
    assert!(mmio[0].args.contains("CHDB 0x400"));
    drop(h);
    assert!(!LOGGER.find_log_calls("MHI device stopped").is_empty());

    let mut cfg = test_config();
    cfg.set_ready_poll_retries(1);
    cfg.set_max_resets(2);
    let h = new_harness(cfg);
    h.modem.set_ready(false);
    h.dev.start().unwrap();
    wait_until(WAIT, || h.dev.is_faulted().unwrap()).unwrap();
    wait_until(WAIT, || !LOGGER.find_log_calls("giving up").is_empty()).unwrap();

    let retry = LOGGER.find_log_calls("Device not ready after reset 1");
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].level, Level::Warn);
    let gave_up = LOGGER.find_log_calls("giving up");
    assert_eq!(gave_up[0].level, Level::Error);
    assert!(gave_up[0].args.contains("reset 2 times"));
}
