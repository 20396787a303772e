// Copyright 2026 Chainscope contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! In-process request tracing: correlation contexts flow through an operation and its
//! children; spans record timing and outcome. Metadata is sanitized before it can
//! reach a log line.

use std::{
	collections::{BTreeMap, HashMap, VecDeque},
	sync::Mutex,
	time::Duration,
};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;

use crate::errors::sanitize_context;

/// Completed spans retained for inspection.
const COMPLETED_SPAN_CAPACITY: usize = 256;

fn random_id(bytes: usize) -> String {
	let mut buffer = vec![0u8; bytes];
	rand::thread_rng().fill_bytes(&mut buffer);
	hex::encode(buffer)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationContext {
	pub correlation_id: String,
	pub trace_id: String,
	pub span_id: String,
	pub parent_span_id: Option<String>,
	pub operation: String,
	pub start_time: DateTime<Utc>,
	pub metadata: BTreeMap<String, Value>,
}

impl CorrelationContext {
	pub fn new(operation: impl Into<String>) -> Self {
		Self {
			correlation_id: random_id(16),
			trace_id: random_id(16),
			span_id: random_id(8),
			parent_span_id: None,
			operation: operation.into(),
			start_time: Utc::now(),
			metadata: BTreeMap::new(),
		}
	}

	pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
		self.metadata.insert(key.into(), value);
		self
	}

	/// A child context: same correlation and trace, fresh span, parent set to this
	/// span. Metadata shallow-merges, the child's keys overriding the parent's.
	pub fn child(
		&self,
		operation: impl Into<String>,
		metadata: BTreeMap<String, Value>,
	) -> Self {
		let mut merged = self.metadata.clone();
		merged.extend(metadata);
		Self {
			correlation_id: self.correlation_id.clone(),
			trace_id: self.trace_id.clone(),
			span_id: random_id(8),
			parent_span_id: Some(self.span_id.clone()),
			operation: operation.into(),
			start_time: Utc::now(),
			metadata: merged,
		}
	}

	/// Metadata with sensitive values redacted, for logging.
	pub fn sanitized_metadata(&self) -> BTreeMap<String, Value> {
		let mut wrapper = Value::Object(self.metadata.clone().into_iter().collect());
		sanitize_context(&mut wrapper);
		match wrapper {
			Value::Object(map) => map.into_iter().collect(),
			_ => BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanStatus {
	Pending,
	Success,
	Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
	pub span_id: String,
	pub trace_id: String,
	pub parent_span_id: Option<String>,
	pub operation: String,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub duration: Option<Duration>,
	pub status: SpanStatus,
	pub error: Option<String>,
	pub metadata: BTreeMap<String, Value>,
}

/// Tracks active and recently-completed spans. Completed spans are kept in a bounded
/// ring, oldest first out.
#[derive(Default)]
pub struct SpanTracker {
	active: Mutex<HashMap<String, Span>>,
	completed: Mutex<VecDeque<Span>>,
}

impl SpanTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn start_span(&self, context: &CorrelationContext) -> String {
		let span = Span {
			span_id: context.span_id.clone(),
			trace_id: context.trace_id.clone(),
			parent_span_id: context.parent_span_id.clone(),
			operation: context.operation.clone(),
			start_time: Utc::now(),
			end_time: None,
			duration: None,
			status: SpanStatus::Pending,
			error: None,
			metadata: context.sanitized_metadata(),
		};
		let span_id = span.span_id.clone();
		self.active.lock().expect("span tracker lock poisoned").insert(span_id.clone(), span);
		span_id
	}

	pub fn end_span(&self, span_id: &str, outcome: Result<(), &str>) {
		let Some(mut span) =
			self.active.lock().expect("span tracker lock poisoned").remove(span_id)
		else {
			return
		};

		let now = Utc::now();
		span.duration =
			(now - span.start_time).to_std().ok().or(Some(Duration::ZERO));
		span.end_time = Some(now);
		match outcome {
			Ok(()) => span.status = SpanStatus::Success,
			Err(error) => {
				span.status = SpanStatus::Error;
				span.error = Some(error.to_string());
			},
		}

		let mut completed = self.completed.lock().expect("span tracker lock poisoned");
		if completed.len() >= COMPLETED_SPAN_CAPACITY {
			completed.pop_front();
		}
		completed.push_back(span);
	}

	pub fn active_count(&self) -> usize {
		self.active.lock().expect("span tracker lock poisoned").len()
	}

	pub fn completed_spans(&self) -> Vec<Span> {
		self.completed
			.lock()
			.expect("span tracker lock poisoned")
			.iter()
			.cloned()
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn child_inherits_ids_and_links_to_parent() {
		let parent = CorrelationContext::new("fetch_balances")
			.with_metadata("chain", json!(1))
			.with_metadata("page", json!(0));

		let child =
			parent.child("fetch_balance", BTreeMap::from([("page".to_string(), json!(2))]));

		assert_eq!(child.correlation_id, parent.correlation_id);
		assert_eq!(child.trace_id, parent.trace_id);
		assert_ne!(child.span_id, parent.span_id);
		assert_eq!(child.parent_span_id.as_deref(), Some(parent.span_id.as_str()));

		// Shallow merge, child overrides.
		assert_eq!(child.metadata["chain"], json!(1));
		assert_eq!(child.metadata["page"], json!(2));
	}

	#[test]
	fn sanitized_metadata_redacts_secrets() {
		let context = CorrelationContext::new("connect")
			.with_metadata("endpoint", json!({"url": "https://node", "api_key": "k123"}))
			.with_metadata("chain", json!(1));

		let sanitized = context.sanitized_metadata();
		assert_eq!(sanitized["endpoint"]["api_key"], json!("[REDACTED]"));
		assert_eq!(sanitized["chain"], json!(1));
		// The original is untouched.
		assert_eq!(context.metadata["endpoint"]["api_key"], json!("k123"));
	}

	#[test]
	fn span_lifecycle_success() {
		let tracker = SpanTracker::new();
		let context = CorrelationContext::new("get_balance");

		let span_id = tracker.start_span(&context);
		assert_eq!(tracker.active_count(), 1);

		tracker.end_span(&span_id, Ok(()));
		assert_eq!(tracker.active_count(), 0);

		let completed = tracker.completed_spans();
		assert_eq!(completed.len(), 1);
		assert_eq!(completed[0].status, SpanStatus::Success);
		assert!(completed[0].end_time.is_some());
		assert!(completed[0].duration.is_some());
	}

	#[test]
	fn span_lifecycle_error_records_the_reason() {
		let tracker = SpanTracker::new();
		let span_id = tracker.start_span(&CorrelationContext::new("get_logs"));

		tracker.end_span(&span_id, Err("connection reset"));

		let completed = tracker.completed_spans();
		assert_eq!(completed[0].status, SpanStatus::Error);
		assert_eq!(completed[0].error.as_deref(), Some("connection reset"));
	}

	#[test]
	fn ending_an_unknown_span_is_a_no_op() {
		let tracker = SpanTracker::new();
		tracker.end_span("missing", Ok(()));
		assert!(tracker.completed_spans().is_empty());
	}

	#[test]
	fn completed_ring_is_bounded() {
		let tracker = SpanTracker::new();
		for _ in 0..(COMPLETED_SPAN_CAPACITY + 10) {
			let span_id = tracker.start_span(&CorrelationContext::new("op"));
			tracker.end_span(&span_id, Ok(()));
		}
		assert_eq!(tracker.completed_spans().len(), COMPLETED_SPAN_CAPACITY);
	}

	#[test]
	fn ids_are_unique() {
		let a = CorrelationContext::new("op");
		let b = CorrelationContext::new("op");
		assert_ne!(a.correlation_id, b.correlation_id);
		assert_ne!(a.trace_id, b.trace_id);
	}
}
