// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Detects degenerate retry patterns — repeated failures, repeated identical
//! calls — and forces the agent loop to stop digging.
use std::collections::VecDeque;

use harness_config::DoomLoopConfig;
use serde_json::Value;

use harness_tools::ToolCall;

/// Order object keys lexicographically and serialise arrays positionally, so
/// two semantically-identical argument sets always produce the same string
/// regardless of construction order.
fn stable_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", stable_json(&Value::String(k.clone())), stable_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(stable_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// The stable `name:JSON(args)` signature used for repetition detection.
pub fn call_signature(call: &ToolCall) -> String {
    format!("{}:{}", call.name, stable_json(&call.arguments))
}

/// Tracks consecutive failures, total failures, and a sliding window of call
/// signatures for one agent-loop run. Not shared across runs or children.
pub struct DoomLoopGuard {
    max_consecutive: u32,
    max_total: u32,
    window_size: usize,
    repetition_threshold: usize,
    consecutive_failures: u32,
    total_failures: u32,
    window: VecDeque<String>,
}

impl DoomLoopGuard {
    pub fn new(config: &DoomLoopConfig) -> Self {
        Self {
            max_consecutive: config.max_consecutive,
            max_total: config.max_total,
            window_size: config.window_size,
            repetition_threshold: config.repetition_threshold,
            consecutive_failures: 0,
            total_failures: 0,
            window: VecDeque::new(),
        }
    }

    /// Record the signatures of a batch of tool calls about to be executed.
    pub fn track(&mut self, calls: &[ToolCall]) {
        for call in calls {
            self.window.push_back(call_signature(call));
            while self.window.len() > self.window_size {
                self.window.pop_front();
            }
        }
    }

    pub fn record_failure(&mut self, _name: &str) {
        self.consecutive_failures += 1;
        self.total_failures += 1;
    }

    pub fn record_success(&mut self, _name: &str) {
        self.consecutive_failures = 0;
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.total_failures = 0;
        self.window.clear();
    }

    /// Side-effect-free check of all three escalation signals.
    pub fn should_escalate(&self) -> bool {
        if self.consecutive_failures >= self.max_consecutive {
            return true;
        }
        if self.total_failures >= self.max_total {
            return true;
        }
        if let Some(latest) = self.window.back() {
            let count = self.window.iter().filter(|sig| *sig == latest).count();
            if count >= self.repetition_threshold {
                return true;
            }
        }
        false
    }
}
