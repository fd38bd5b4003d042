// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire-level data model and the narrow [`Provider`] capability the agent
//! loop consumes. Concrete provider implementations (vendor wire formats,
//! authentication, HTTP transport) are an external collaborator and are not
//! provided here — construct one externally and hand it to the loop as
//! `Arc<dyn Provider>`.
mod cancel;
mod mock;
mod provider;
mod types;

pub use cancel::CancelToken;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{
    ChatResponse, FinishReason, InputModality, Provider, ResponseStream, StreamEvent, StreamUsage,
};
pub use types::*;
