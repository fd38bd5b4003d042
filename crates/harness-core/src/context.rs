// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Fits a message list into a token budget, delegating to a configured
//! [`TruncationStrategy`] once the conversation outgrows it.
use std::collections::HashMap;
use std::sync::Arc;

use harness_config::ContextConfig;
use harness_model::{Message, Role};
use thiserror::Error;

use crate::strategies::{StrategyOptions, TruncationStrategy};
use crate::tokenizer;

/// Configuration errors the context manager (and, by reuse, the agent loop)
/// surface to the caller rather than swallow — these are programmer errors,
/// not runtime conditions to retry around.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no token limit could be resolved: supply maxTokens, a model context window, a modelTokenLimits entry, or a configured default")]
    NoTokenLimitResolved,
    #[error("effective token limit must be at least 1 token, got {0}")]
    EffectiveLimitNotPositive(i64),
    #[error("tool pipeline is not configured")]
    MissingPipeline,
}

/// Inputs to [`ContextManager::prepare`]. The resolution order for the
/// token budget is: `max_tokens` > `model_context_window` >
/// `model_token_limits[model_id]` > the manager's configured default.
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub max_tokens: Option<usize>,
    pub model_context_window: Option<usize>,
    pub model_id: Option<String>,
    pub model_token_limits: HashMap<String, usize>,
    pub reserved_for_output: Option<usize>,
    pub system_prompt: Option<String>,
    pub keep_recent_messages: Option<usize>,
}

/// Fixed id for the system message synthesised when a caller supplies
/// `systemPrompt` and the conversation does not already have one.
pub const SYNTHETIC_SYSTEM_MESSAGE_ID: &str = "sys-synthetic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReport {
    pub used_tokens: usize,
    pub effective_limit: usize,
    pub remaining_tokens: usize,
    pub over_budget: bool,
}

pub struct ContextManager {
    config: ContextConfig,
    strategy: Arc<dyn TruncationStrategy>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, strategy: Arc<dyn TruncationStrategy>) -> Self {
        Self { config, strategy }
    }

    fn resolve_max_tokens(&self, options: &PrepareOptions) -> Option<usize> {
        if let Some(explicit) = options.max_tokens {
            return Some(explicit);
        }
        if let Some(window) = options.model_context_window {
            return Some(window);
        }
        if let Some(model_id) = &options.model_id {
            if let Some(limit) = options.model_token_limits.get(model_id) {
                return Some(*limit);
            }
        }
        Some(self.config.default_max_tokens)
    }

    /// `maxTokens − reservedForOutput`, validated to be at least 1.
    pub fn effective_limit(&self, options: &PrepareOptions) -> Result<usize, ConfigurationError> {
        let max_tokens = self
            .resolve_max_tokens(options)
            .ok_or(ConfigurationError::NoTokenLimitResolved)?;
        let reserved = options
            .reserved_for_output
            .unwrap_or(self.config.reserved_for_output);
        let effective = max_tokens as i64 - reserved as i64;
        if effective < 1 {
            return Err(ConfigurationError::EffectiveLimitNotPositive(effective));
        }
        Ok(effective as usize)
    }

    pub fn estimate_tokens(&self, messages: &[Message]) -> usize {
        tokenizer::estimate_conversation(messages)
    }

    pub fn will_exceed_limit(
        &self,
        messages: &[Message],
        options: &PrepareOptions,
    ) -> Result<bool, ConfigurationError> {
        let limit = self.effective_limit(options)?;
        Ok(self.estimate_tokens(messages) > limit)
    }

    pub fn get_usage_report(
        &self,
        messages: &[Message],
        options: &PrepareOptions,
    ) -> Result<UsageReport, ConfigurationError> {
        let limit = self.effective_limit(options)?;
        let used = self.estimate_tokens(messages);
        Ok(UsageReport {
            used_tokens: used,
            effective_limit: limit,
            remaining_tokens: limit.saturating_sub(used),
            over_budget: used > limit,
        })
    }

    /// Fit `messages` under budget, injecting a synthetic system message
    /// first if the caller supplied `systemPrompt` and none exists yet.
    pub async fn prepare(
        &self,
        messages: Vec<Message>,
        options: PrepareOptions,
    ) -> Result<Vec<Message>, ConfigurationError> {
        let limit = self.effective_limit(&options)?;
        let mut messages = messages;

        if let Some(system_prompt) = &options.system_prompt {
            if !system_prompt.is_empty() && !messages.iter().any(|m| m.role == Role::System) {
                let synthetic =
                    Message::synthetic_system(system_prompt.clone(), SYNTHETIC_SYSTEM_MESSAGE_ID, 0);
                messages.insert(0, synthetic);
            }
        }

        if self.estimate_tokens(&messages) <= limit {
            return Ok(messages);
        }

        let max_tokens = self
            .resolve_max_tokens(&options)
            .expect("validated by effective_limit above");
        let reserved = options
            .reserved_for_output
            .unwrap_or(self.config.reserved_for_output);
        let strategy_options = StrategyOptions {
            max_tokens,
            reserved_tokens: reserved,
            keep_recent_messages: Some(
                options
                    .keep_recent_messages
                    .unwrap_or(self.config.keep_recent_messages),
            ),
        };
        Ok(self.strategy.apply(messages, &strategy_options).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::DropOldest;

    fn manager(default_max_tokens: usize) -> ContextManager {
        ContextManager::new(
            ContextConfig {
                default_max_tokens,
                reserved_for_output: 0,
                keep_recent_messages: 2,
                summary_max_tokens: 100,
            },
            Arc::new(DropOldest),
        )
    }

    #[tokio::test]
    async fn prepare_returns_unchanged_when_under_budget() {
        let mgr = manager(10_000);
        let messages = vec![Message::user("hi")];
        let result = mgr.prepare(messages.clone(), PrepareOptions::default()).await.unwrap();
        assert_eq!(result.len(), messages.len());
    }

    #[tokio::test]
    async fn prepare_injects_synthetic_system_message_once() {
        let mgr = manager(10_000);
        let messages = vec![Message::user("hi")];
        let opts = PrepareOptions {
            system_prompt: Some("be helpful".into()),
            ..Default::default()
        };
        let result = mgr.prepare(messages, opts).await.unwrap();
        assert_eq!(result[0].id, SYNTHETIC_SYSTEM_MESSAGE_ID);
        assert_eq!(result[0].role, Role::System);
    }

    #[tokio::test]
    async fn prepare_never_injects_second_system_message() {
        let mgr = manager(10_000);
        let messages = vec![Message::system("already here"), Message::user("hi")];
        let opts = PrepareOptions {
            system_prompt: Some("be helpful".into()),
            ..Default::default()
        };
        let result = mgr.prepare(messages, opts).await.unwrap();
        assert_eq!(result.iter().filter(|m| m.role == Role::System).count(), 1);
    }

    #[test]
    fn effective_limit_fails_when_no_limit_resolvable() {
        let mgr = ContextManager::new(
            ContextConfig {
                default_max_tokens: 0,
                reserved_for_output: 0,
                keep_recent_messages: 2,
                summary_max_tokens: 100,
            },
            Arc::new(DropOldest),
        );
        let opts = PrepareOptions {
            reserved_for_output: Some(5),
            ..Default::default()
        };
        let err = mgr.effective_limit(&opts).unwrap_err();
        assert_eq!(err, ConfigurationError::EffectiveLimitNotPositive(-5));
    }

    #[test]
    fn resolution_order_prefers_explicit_over_window_over_model_map_over_default() {
        let mgr = manager(100);
        let mut limits = HashMap::new();
        limits.insert("gpt".to_string(), 500);
        let opts = PrepareOptions {
            max_tokens: Some(1000),
            model_context_window: Some(800),
            model_id: Some("gpt".into()),
            model_token_limits: limits,
            reserved_for_output: Some(0),
            ..Default::default()
        };
        assert_eq!(mgr.effective_limit(&opts).unwrap(), 1000);
    }

    #[tokio::test]
    async fn prepare_delegates_to_strategy_when_over_budget() {
        let mgr = manager(20);
        let messages = vec![
            Message::user("oldest message is quite long indeed"),
            Message::user("newer"),
        ];
        let result = mgr.prepare(messages, PrepareOptions::default()).await.unwrap();
        assert!(mgr.estimate_tokens(&result) <= 20 || result.len() <= 1);
    }

    #[test]
    fn get_usage_report_reports_over_budget() {
        let mgr = manager(5);
        let messages = vec![Message::user(&"x".repeat(100))];
        let report = mgr.get_usage_report(&messages, &PrepareOptions::default()).unwrap();
        assert!(report.over_budget);
        assert_eq!(report.effective_limit, 5);
    }
}
