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

//! In-crate fakes for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::mmio::MmioOps;
use crate::power::PlatformOps;

/// A register file backed by a map. Unwritten registers read as zero.
#[derive(Debug, Default)]
pub(crate) struct FakeRegisters {
    values: Mutex<HashMap<u32, u32>>,
    scripted: Mutex<HashMap<u32, VecDeque<u32>>>,
    read_only: Mutex<HashSet<u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
    reads: Mutex<HashMap<u32, usize>>,
}

impl FakeRegisters {
    pub(crate) fn set(&self, offset: u32, value: u32) {
        self.values.lock().unwrap().insert(offset, value);
    }

    pub(crate) fn get(&self, offset: u32) -> u32 {
        self.values.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    /// Return `values` from the next reads of `offset`, then the stored value
    pub(crate) fn script_reads(&self, offset: u32, values: impl IntoIterator<Item = u32>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(offset)
            .or_default()
            .extend(values);
    }

    /// Pin `offset` to `value`, ignoring writes
    pub(crate) fn make_read_only(&self, offset: u32, value: u32) {
        self.set(offset, value);
        self.read_only.lock().unwrap().insert(offset);
    }

    pub(crate) fn reads_of(&self, offset: u32) -> usize {
        self.reads.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub(crate) fn writes_to(&self, offset: u32) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == offset)
            .count()
    }

    pub(crate) fn write_log(&self) -> Vec<(u32, u32)> {
        self.writes.lock().unwrap().clone()
    }
}

impl MmioOps for FakeRegisters {
    fn read32(&self, offset: u32) -> u32 {
        *self.reads.lock().unwrap().entry(offset).or_default() += 1;
        if let Some(v) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&offset)
            .and_then(|q| q.pop_front())
        {
            return v;
        }
        self.get(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.writes.lock().unwrap().push((offset, value));
        if !self.read_only.lock().unwrap().contains(&offset) {
            self.set(offset, value);
        }
    }
}

/// Platform hooks that only record what was asked of them
#[derive(Debug, Default)]
pub(crate) struct FakePlatform {
    pub(crate) calls: Mutex<Vec<&'static str>>,
}

impl FakePlatform {
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl PlatformOps for FakePlatform {
    fn assert_wake(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("assert_wake");
        Ok(())
    }

    fn deassert_wake(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("deassert_wake");
        Ok(())
    }

    fn link_on(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("link_on");
        Ok(())
    }

    fn link_off(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("link_off");
        Ok(())
    }

    fn report_unrecoverable(&self, _reason: &crate::MhiError) {
        self.calls.lock().unwrap().push("report_unrecoverable");
    }
}
