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

// This crate contains testing utilities which need to be shared across multiple
// crates in this project.
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

pub mod simplelogger;
pub mod tracing_subscriber;

/// Poll `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("condition not met within {:?}", timeout));
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Like [`wait_until`] but for a condition that stays false for the whole
/// period. Returns an error as soon as `cond` holds.
pub fn hold_for(period: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        if cond() {
            return Err(anyhow!("condition became true within {:?}", period));
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}
