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

use std::sync::{Arc, Mutex};

use tracing::{Span, instrument};

use super::{ControlRegion, MhiDevice};
use crate::config::MhiConfiguration;
use crate::mem::DmaOps;
use crate::mmio::MmioOps;
use crate::power::PlatformOps;
use crate::{MhiError, Result};

/// Devices owned by the bring-up layer, keyed by a small index.
///
/// Indexes of detached devices are reused by later attaches.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Option<Arc<MhiDevice>>>>,
}

impl DeviceRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device, start its bring-up and register it. Nothing is
    /// registered if any construction stage fails.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn attach(
        &self,
        config: MhiConfiguration,
        mmio: Arc<dyn MmioOps>,
        dma: Arc<dyn DmaOps>,
        platform: Arc<dyn PlatformOps>,
        region: ControlRegion,
    ) -> Result<usize> {
        let dev = Arc::new(MhiDevice::new(config, mmio, dma, platform, region)?);
        dev.start()?;

        let mut devices = self.devices.lock()?;
        let index = match devices.iter().position(Option::is_none) {
            Some(free) => {
                devices[free] = Some(dev);
                free
            }
            None => {
                devices.push(Some(dev));
                devices.len() - 1
            }
        };
        log::info!("Attached MHI device {index}");
        Ok(index)
    }

    /// The device at `index`
    pub fn get(&self, index: usize) -> Result<Arc<MhiDevice>> {
        self.devices
            .lock()?
            .get(index)
            .and_then(Clone::clone)
            .ok_or(MhiError::DeviceNotFound(index))
    }

    /// Remove the device at `index`. Its workers stop once the last
    /// reference is dropped.
    pub fn detach(&self, index: usize) -> Result<()> {
        let dev = self
            .devices
            .lock()?
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(MhiError::DeviceNotFound(index))?;
        log::info!("Detached MHI device {index}");
        drop(dev);
        Ok(())
    }

    /// Number of attached devices
    pub fn len(&self) -> usize {
        self.devices
            .lock()
            .map(|d| d.iter().flatten().count())
            .unwrap_or(0)
    }

    /// Whether no device is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
