// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;

/// Operations a provider may support. Callers branch on these, not on ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
	Resume,
	StreamingOutput,
	Thinking,
	ToolCalls,
}

/// Output shape requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
	/// One JSON document at exit.
	Json,
	/// One JSON record per line as the provider works.
	StreamJson,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest<'a> {
	pub message: &'a str,
	pub resume_token: Option<&'a str>,
	pub output: OutputMode,
}

pub trait Provider: Send + Sync {
	fn id(&self) -> &str;

	fn executable_name(&self) -> &str;

	fn capabilities(&self) -> BTreeSet<Capability>;

	fn supports(&self, capability: Capability) -> bool {
		self.capabilities().contains(&capability)
	}

	/// Arguments for one non-interactive exchange; message text is last.
	fn build_args(&self, request: &ProviderRequest<'_>) -> Vec<String>;
}

pub struct ClaudeCodeProvider {
	extra_args: Vec<String>,
}

impl ClaudeCodeProvider {
	pub const ID: &'static str = "claude_code";

	pub fn new(extra_args: Vec<String>) -> Self {
		Self { extra_args }
	}
}

impl Default for ClaudeCodeProvider {
	fn default() -> Self {
		Self::new(Vec::new())
	}
}

impl Provider for ClaudeCodeProvider {
	fn id(&self) -> &str {
		Self::ID
	}

	fn executable_name(&self) -> &str {
		"claude"
	}

	fn capabilities(&self) -> BTreeSet<Capability> {
		BTreeSet::from([
			Capability::Resume,
			Capability::StreamingOutput,
			Capability::Thinking,
			Capability::ToolCalls,
		])
	}

	fn build_args(&self, request: &ProviderRequest<'_>) -> Vec<String> {
		let output = match request.output {
			OutputMode::StreamJson if self.supports(Capability::StreamingOutput) => "stream-json",
			_ => "json",
		};

		let mut args = vec![
			"-p".to_string(),
			"--output-format".to_string(),
			output.to_string(),
		];
		// stream-json in print mode is rejected without --verbose
		if output == "stream-json" {
			args.push("--verbose".to_string());
		}
		if let Some(token) = request.resume_token.filter(|t| !t.is_empty()) {
			if self.supports(Capability::Resume) {
				args.push("--resume".to_string());
				args.push(token.to_string());
			}
		}
		args.extend(self.extra_args.iter().cloned());
		// keep a dash-led message positional
		if request.message.starts_with('-') {
			args.push("--".to_string());
		}
		args.push(request.message.to_string());
		args
	}
}

/// Explicit lookup table of providers, handed to the session registry.
pub struct ProviderRegistry {
	providers: HashMap<String, Arc<dyn Provider>>,
	default_id: String,
}

impl ProviderRegistry {
	pub fn new(default_id: impl Into<String>) -> Self {
		Self {
			providers: HashMap::new(),
			default_id: default_id.into(),
		}
	}

	pub fn from_config(config: &ProviderConfig) -> Self {
		let mut registry = Self::new(config.default.clone());
		registry.register(Arc::new(ClaudeCodeProvider::new(config.extra_args.clone())));
		registry
	}

	pub fn register(&mut self, provider: Arc<dyn Provider>) {
		let id = provider.id().to_string();
		tracing::debug!(provider_id = %id, "registering provider");
		self.providers.insert(id, provider);
	}

	pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
		self.providers.get(id).cloned()
	}

	pub fn default_id(&self) -> &str {
		&self.default_id
	}

	pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
		self.get(&self.default_id)
	}

	pub fn ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.providers.keys().cloned().collect();
		ids.sort();
		ids
	}
}

impl Default for ProviderRegistry {
	fn default() -> Self {
		Self::from_config(&ProviderConfig::default())
	}
}
