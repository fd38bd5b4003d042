// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Top-level configuration for the harness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub doom_loop: DoomLoopConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub context: ContextConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            doom_loop: DoomLoopConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

fn default_max_steps() -> u32 {
    25
}

/// Agent loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

fn default_pipeline_timeout_secs() -> u64 {
    30
}

fn default_max_output_length() -> usize {
    4000
}

/// Tool pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Per-call wall-clock timeout.
    #[serde(default = "default_pipeline_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum serialised output length before truncation. 0 disables truncation.
    #[serde(default = "default_max_output_length")]
    pub max_output_length: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pipeline_timeout_secs(),
            max_output_length: default_max_output_length(),
        }
    }
}

fn default_max_consecutive() -> u32 {
    3
}
fn default_max_total() -> u32 {
    5
}
fn default_window_size() -> usize {
    10
}
fn default_repetition_threshold() -> usize {
    3
}

/// Doom-loop guard tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DoomLoopConfig {
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive: u32,
    #[serde(default = "default_max_total")]
    pub max_total: u32,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: usize,
}

impl Default for DoomLoopConfig {
    fn default() -> Self {
        Self {
            max_consecutive: default_max_consecutive(),
            max_total: default_max_total(),
            window_size: default_window_size(),
            repetition_threshold: default_repetition_threshold(),
        }
    }
}

/// A named concurrency tier for the sub-agent pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Team,
}

impl Tier {
    /// Concurrency cap for this tier, per the fallback mapping.
    pub fn max_concurrent(self) -> usize {
        match self {
            Tier::Free => 2,
            Tier::Pro => 5,
            Tier::Team => 15,
        }
    }
}

fn default_pool_fallback() -> usize {
    5
}

/// Sub-agent pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Explicit cap; takes priority over `tier` when set to a positive value.
    pub max_concurrent: Option<usize>,
    pub tier: Option<Tier>,
    #[serde(default = "default_pool_fallback")]
    pub fallback_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            tier: None,
            fallback_concurrency: default_pool_fallback(),
        }
    }
}

impl PoolConfig {
    /// Resolve the effective concurrency cap: explicit `max_concurrent` (if
    /// positive and finite) wins, else the tier mapping, else the configured
    /// fallback.
    pub fn resolve_max_concurrent(&self) -> usize {
        if let Some(n) = self.max_concurrent {
            if n > 0 {
                return n;
            }
        }
        if let Some(tier) = self.tier {
            return tier.max_concurrent();
        }
        self.fallback_concurrency
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_duration_ms() -> u64 {
    60_000
}
fn default_jitter() -> bool {
    true
}

/// Retry policy tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_duration_ms: default_max_duration_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_concurrent_workers() -> usize {
    3
}
fn default_worker_timeout_secs() -> u64 {
    600
}

/// Background task worker manager tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_max_concurrent_workers(),
            worker_timeout_secs: default_worker_timeout_secs(),
        }
    }
}

fn default_context_window() -> usize {
    128_000
}
fn default_reserved_for_output() -> usize {
    4_096
}
fn default_compaction_keep_recent() -> usize {
    6
}
fn default_summary_max_tokens() -> usize {
    1_000
}

/// Context manager tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Used only when neither an explicit option nor a model context window
    /// nor a `modelTokenLimits` entry resolves a budget.
    #[serde(default = "default_context_window")]
    pub default_max_tokens: usize,
    #[serde(default = "default_reserved_for_output")]
    pub reserved_for_output: usize,
    #[serde(default = "default_compaction_keep_recent")]
    pub keep_recent_messages: usize,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_context_window(),
            reserved_for_output: default_reserved_for_output(),
            keep_recent_messages: default_compaction_keep_recent(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        let cfg = Config::default();
        assert_eq!(cfg.agent.max_steps, 25);
        assert_eq!(cfg.tools.timeout_secs, 30);
        assert_eq!(cfg.doom_loop.max_consecutive, 3);
        assert_eq!(cfg.doom_loop.max_total, 5);
        assert_eq!(cfg.doom_loop.window_size, 10);
        assert_eq!(cfg.doom_loop.repetition_threshold, 3);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.max_duration_ms, 60_000);
        assert_eq!(cfg.worker.max_concurrent_workers, 3);
        assert_eq!(cfg.worker.worker_timeout_secs, 600);
    }

    #[test]
    fn pool_config_prefers_explicit_over_tier() {
        let cfg = PoolConfig {
            max_concurrent: Some(7),
            tier: Some(Tier::Team),
            ..PoolConfig::default()
        };
        assert_eq!(cfg.resolve_max_concurrent(), 7);
    }

    #[test]
    fn pool_config_falls_back_to_tier() {
        let cfg = PoolConfig {
            max_concurrent: None,
            tier: Some(Tier::Team),
            ..PoolConfig::default()
        };
        assert_eq!(cfg.resolve_max_concurrent(), 15);
    }

    #[test]
    fn pool_config_falls_back_to_fallback_when_neither_set() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.resolve_max_concurrent(), 5);
    }

    #[test]
    fn pool_config_ignores_non_positive_explicit_value() {
        let cfg = PoolConfig {
            max_concurrent: Some(0),
            tier: Some(Tier::Free),
            ..PoolConfig::default()
        };
        assert_eq!(cfg.resolve_max_concurrent(), 2);
    }

    #[test]
    fn yaml_round_trip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg: Config = serde_yaml::from_str("agent:\n  max_steps: 10\n").unwrap();
        assert_eq!(cfg.agent.max_steps, 10);
        assert_eq!(cfg.tools.timeout_secs, 30);
    }
}
