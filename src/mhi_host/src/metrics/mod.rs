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

use std::sync::Once;
use std::time::Duration;

use metrics_macro::NamedMetric;

#[macro_use]
mod metrics_macro;

// These defines all types of metrics in this crate
define_metrics! {
    CounterMetric {
        StateTransitions { transition: &'static str } => {
            name: "mhi_state_transitions_total",
            description: "Number of state transitions processed",
            unit: metrics::Unit::Count,
        },
        PowerWaitTimeouts { target: &'static str } => {
            name: "mhi_power_wait_timeouts_total",
            description: "Number of M0/M3 waits that timed out",
            unit: metrics::Unit::Count,
        },
        DoorbellWrites { ring: &'static str } => {
            name: "mhi_doorbell_writes_total",
            description: "Number of doorbell register writes",
            unit: metrics::Unit::Count,
        },
        TransferCompletions { channel: u32 } => {
            name: "mhi_transfer_completions_total",
            description: "Number of transfer elements completed by the modem",
            unit: metrics::Unit::Count,
        },
        DeviceResets => {
            name: "mhi_device_resets_total",
            description: "Number of RESET transitions handled",
            unit: metrics::Unit::Count,
        },
    }
    HistogramMetric {
        TransitionDuration { transition: &'static str, duration: Duration } => {
            name: "mhi_transition_duration_seconds",
            description: "Time spent handling a state transition",
            unit: metrics::Unit::Seconds,
        },
    }
}

impl CounterMetric {
    /// A processed state transition
    #[must_use]
    pub(crate) fn state_transition(transition: &'static str) -> Self {
        CounterMetric::StateTransitions { transition }
    }
    /// A power state wait that ran out of time
    #[must_use]
    pub(crate) fn power_wait_timeout(target: &'static str) -> Self {
        CounterMetric::PowerWaitTimeouts { target }
    }
    /// A doorbell write on a ring of kind `ring`
    #[must_use]
    pub(crate) fn doorbell_write(ring: &'static str) -> Self {
        CounterMetric::DoorbellWrites { ring }
    }
    /// A completed transfer element
    #[must_use]
    pub(crate) fn transfer_completion(channel: u32) -> Self {
        CounterMetric::TransferCompletions { channel }
    }
    /// A handled device reset
    #[must_use]
    pub(crate) fn device_reset() -> Self {
        CounterMetric::DeviceResets
    }
}

impl HistogramMetric {
    /// Measures the time to execute the given closure, and then emits the
    /// duration as a transition metric.
    ///
    /// Note: If the `transition_metrics` feature is not enabled, this function
    /// will simply execute the closure without measuring time or emitting metrics.
    pub(crate) fn time_and_emit_transition<T, F: FnOnce() -> T>(
        #[allow(unused_variables)] transition: &'static str,
        f: F,
    ) -> T {
        cfg_if::cfg_if! {
            if #[cfg(feature = "transition_metrics")] {
                use std::time::Instant;

                let start = Instant::now();
                let result = f();
                let duration = start.elapsed();
                HistogramMetric::TransitionDuration { transition, duration }.emit();
                result
            } else {
                f()
            }
        }
    }
}

/// A metric which can be emitted to the underlying metrics system
pub(crate) trait EmittableMetric {
    /// Emits the metric to the underlying metrics system.
    /// The first time this is called for a given metric variant, it will
    /// also describe the metric to the underlying metrics system.
    fn emit(self);
}

impl EmittableMetric for CounterMetric {
    /// Increases the counter represented by `self` by 1
    fn emit(self) {
        let name = self.name();
        let unit = self.unit();
        let description = self.description();

        match self {
            CounterMetric::StateTransitions { transition } => {
                // Describe each metric variant only once
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                static LABEL_TRANSITION: &str = "transition";
                metrics::counter!(name, LABEL_TRANSITION => transition).increment(1);
            }
            CounterMetric::PowerWaitTimeouts { target } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                static LABEL_TARGET: &str = "target";
                metrics::counter!(name, LABEL_TARGET => target).increment(1);
            }
            CounterMetric::DoorbellWrites { ring } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                static LABEL_RING: &str = "ring";
                metrics::counter!(name, LABEL_RING => ring).increment(1);
            }
            CounterMetric::TransferCompletions { channel } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                static LABEL_CHANNEL: &str = "channel";
                metrics::counter!(name, LABEL_CHANNEL => channel.to_string()).increment(1);
            }
            CounterMetric::DeviceResets => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                metrics::counter!(name).increment(1);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        let metric_name = self.name();
        let unit = self.unit();
        let description = self.description();

        match self {
            HistogramMetric::TransitionDuration {
                transition,
                duration,
            } => {
                // Describe each metric variant only once
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_histogram!(metric_name, unit, description);
                });

                static LABEL_TRANSITION: &str = "transition";
                metrics::histogram!(metric_name, LABEL_TRANSITION => transition)
                    .record(duration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label};
    use metrics_util::CompositeKey;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;

    #[test]
    fn test_counter_and_histogram_metrics() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let metric_1 = CounterMetric::state_transition("M0");
        let metric_2 = CounterMetric::doorbell_write("channel");
        let metric_3 = CounterMetric::device_reset();
        let metric_4 = HistogramMetric::TransitionDuration {
            transition: "READY",
            duration: Duration::from_secs(2),
        };

        let snapshot = metrics::with_local_recorder(&recorder, || {
            metric_1.clone().emit();
            metric_1.clone().emit();
            metric_2.clone().emit();
            metric_3.clone().emit();
            metric_4.clone().emit();

            snapshotter.snapshot()
        });

        #[expect(clippy::mutable_key_type)]
        let snapshot = snapshot.into_hashmap();
        assert_eq!(snapshot.len(), 4);

        let key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(metric_1.name(), vec![Label::new("transition", "M0")]),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(2));

        let key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(metric_2.name(), vec![Label::new("ring", "channel")]),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(1));

        let key = CompositeKey::new(metrics_util::MetricKind::Counter, metric_3.name().into());
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(1));

        let key = CompositeKey::new(
            metrics_util::MetricKind::Histogram,
            Key::from_parts(metric_4.name(), vec![Label::new("transition", "READY")]),
        );
        assert!(matches!(
            &snapshot.get(&key).unwrap().2,
            DebugValue::Histogram(h) if h.len() == 1 && h[0].0 == 2.0
        ));
    }

    #[test]
    fn untimed_transition_returns_closure_result() {
        let v = HistogramMetric::time_and_emit_transition("M1", || 7);
        assert_eq!(v, 7);
    }
}
