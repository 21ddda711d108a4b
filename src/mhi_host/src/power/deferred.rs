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

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, unbounded};

use super::pm;
use crate::device::DeviceContext;

/// Work run on the deferred executor after a delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    /// Bring the device back to M0
    EnterM0,
    /// Suspend the device
    EnterM3,
    /// Release the wake line if the device stayed idle
    IdleTimer,
}

impl Job {
    const ALL: [Job; 3] = [Job::EnterM0, Job::EnterM3, Job::IdleTimer];

    fn slot(self) -> usize {
        match self {
            Job::EnterM0 => 0,
            Job::EnterM3 => 1,
            Job::IdleTimer => 2,
        }
    }
}

#[derive(Debug)]
pub(crate) enum DeferredMsg {
    Schedule(Job, Duration),
    Cancel(Job),
    Stop,
}

/// Sending side of the deferred executor. Each job has one slot, so
/// scheduling a job that is already armed moves its deadline.
#[derive(Debug, Clone)]
pub(crate) struct DeferredQueue {
    tx: Sender<DeferredMsg>,
}

impl DeferredQueue {
    pub(crate) fn new() -> (Self, Receiver<DeferredMsg>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub(crate) fn schedule(&self, job: Job, delay: Duration) {
        if self.tx.send(DeferredMsg::Schedule(job, delay)).is_err() {
            log::debug!("Deferred executor is gone, dropping {job:?}");
        }
    }

    pub(crate) fn cancel(&self, job: Job) {
        let _ = self.tx.send(DeferredMsg::Cancel(job));
    }

    pub(crate) fn cancel_all(&self) {
        for job in Job::ALL {
            self.cancel(job);
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(DeferredMsg::Stop);
    }
}

/// Executor loop. Jobs run one at a time on this thread; a job that is due
/// while another runs starts as soon as the first returns.
pub(crate) fn run(dev: Arc<DeviceContext>, rx: Receiver<DeferredMsg>) {
    let mut due: [Option<Instant>; 3] = [None; 3];
    loop {
        let timer = match due.iter().flatten().min() {
            Some(&at) => crossbeam_channel::at(at),
            None => crossbeam_channel::never(),
        };
        select! {
            recv(rx) -> msg => match msg {
                Ok(DeferredMsg::Schedule(job, delay)) => {
                    due[job.slot()] = Some(Instant::now() + delay);
                }
                Ok(DeferredMsg::Cancel(job)) => due[job.slot()] = None,
                Ok(DeferredMsg::Stop) | Err(_) => break,
            },
            recv(timer) -> _ => {
                let now = Instant::now();
                for job in Job::ALL {
                    if due[job.slot()].is_some_and(|at| at <= now) {
                        due[job.slot()] = None;
                        run_job(&dev, job);
                    }
                }
            }
        }
    }
    log::debug!("Deferred executor stopped");
}

fn run_job(dev: &DeviceContext, job: Job) {
    let span = tracing::debug_span!("mhi_deferred", job = ?job);
    let _entered = span.enter();
    match job {
        Job::EnterM0 => pm::enter_m0_work(dev),
        Job::EnterM3 => pm::enter_m3_work(dev),
        Job::IdleTimer => pm::idle_timer_expired(dev),
    }
}
