// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Session orchestration core for Maestro.
//!
//! - [`resolver`]: locate the provider executable and any script runtime
//! - [`bridge`]: run one non-interactive provider exchange
//! - [`parser`]: decode provider output, batch or line-delimited
//! - [`lifecycle`]: fold provider events into open/closed steps
//! - [`workspace`]: per-project worktree and per-session branches
//! - [`registry`]: projects, sessions, and the session state machine
//! - [`events`]: typed notifications for presentation layers

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod parser;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod workspace;

pub use bridge::{CommandBridge, Invocation, ProcessBridge, ProcessOutput};
pub use config::{CoreConfig, WorkspaceFailurePolicy};
pub use error::{ConfigError, CoreError, Result};
pub use events::{EventBus, SessionEvent};
pub use lifecycle::{Step, StepEngine, StepKind, StepNotice};
pub use parser::{parse_response, ProviderEvent, ProviderResponse, StreamParser};
pub use provider::{Capability, ClaudeCodeProvider, Provider, ProviderRegistry};
pub use registry::{
	Isolation, Message, MessageStatus, Project, RegistrySnapshot, Session, SessionRegistry,
	SessionState,
};
pub use resolver::{ExecutableResolver, ResolvedExecutable};
pub use workspace::WorkspaceManager;
