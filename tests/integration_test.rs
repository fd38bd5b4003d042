// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Integration tests for the facade crate, exercising the full agent loop
//! through its public re-exports rather than any member crate directly.
use std::sync::Arc;

use harness::config::{AgentConfig, Config};
use harness::core::{AgentLoop, AgentLoopConfig};
use harness::model::{CancelToken, Message, ScriptedMockProvider};
use harness::tools::AllowAll;

#[tokio::test]
async fn agent_loop_runs_to_completion_through_the_facade() {
    let provider = Arc::new(ScriptedMockProvider::always_text("hello from the facade"));
    let context = Arc::new(harness::core::ContextManager::new(
        Config::default().context,
        Arc::new(harness::core::DropOldest),
    ));
    let agent = AgentLoop::new(provider, context, Arc::new(AllowAll))
        .with_config(AgentLoopConfig::new(AgentConfig::default().max_steps as i64));

    let result = agent
        .run(vec![Message::user("hi")], CancelToken::new(), Default::default())
        .await;

    assert!(!result.aborted);
    assert!(result
        .messages
        .iter()
        .any(|m| m.as_text().map(|t| t.contains("hello from the facade")).unwrap_or(false)));
}

#[test]
fn default_config_round_trips_through_serde_json() {
    let config = Config::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: Config = serde_json::from_str(&json).unwrap();
    assert_eq!(back.agent.max_steps, config.agent.max_steps);
}
