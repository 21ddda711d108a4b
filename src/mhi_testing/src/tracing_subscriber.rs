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

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing_core::span::{Attributes, Id, Record};
use tracing_core::{Event, Level, LevelFilter, Metadata, Subscriber};
use tracing_serde::AsSerde;

thread_local! {
    static SPAN_STACK: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
struct Captured {
    spans: HashMap<u64, Value>,
    events: Vec<Value>,
}

/// A subscriber that keeps every span and event as JSON.
///
/// Each captured event carries the id of the span that was entered on the
/// emitting thread under `"span"`.
#[derive(Debug, Clone)]
pub struct TracingSubscriber {
    max_level: Level,
    next_id: Arc<AtomicU64>,
    captured: Arc<Mutex<Captured>>,
}

impl TracingSubscriber {
    pub fn new(max_level: Level) -> Self {
        Self {
            max_level,
            next_id: Arc::new(AtomicU64::new(1)),
            captured: Arc::new(Mutex::new(Captured::default())),
        }
    }

    pub fn get_span(&self, id: u64) -> Value {
        self.captured
            .lock()
            .unwrap()
            .spans
            .get(&id)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn get_spans(&self) -> HashMap<u64, Value> {
        self.captured.lock().unwrap().spans.clone()
    }

    pub fn get_events(&self) -> Vec<Value> {
        self.captured.lock().unwrap().events.clone()
    }

    pub fn clear(&self) {
        let mut captured = self.captured.lock().unwrap();
        captured.spans.clear();
        captured.events.clear();
    }
}

impl Subscriber for TracingSubscriber {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        *metadata.level() <= self.max_level
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(LevelFilter::from_level(self.max_level))
    }

    fn new_span(&self, attrs: &Attributes<'_>) -> Id {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let value = serde_json::to_value(attrs.as_serde()).unwrap_or(Value::Null);
        self.captured.lock().unwrap().spans.insert(id, value);
        Id::from_u64(id)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let span = SPAN_STACK.with(|s| s.borrow().last().copied());
        let value = json!({
            "span": span,
            "event": serde_json::to_value(event.as_serde()).unwrap_or(Value::Null),
        });
        self.captured.lock().unwrap().events.push(value);
    }

    fn enter(&self, span: &Id) {
        SPAN_STACK.with(|s| s.borrow_mut().push(span.into_u64()));
    }

    fn exit(&self, span: &Id) {
        SPAN_STACK.with(|s| {
            let mut stack = s.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|&id| id == span.into_u64()) {
                stack.remove(pos);
            }
        });
    }
}
