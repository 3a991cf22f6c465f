// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Step lifecycle engine.
//!
//! Folds an ordered sequence of [`ProviderEvent`]s into the steps of one
//! assistant message. Two closing rules apply and are intentionally distinct:
//!
//! - Narration steps (`thinking`, `text`) close when any other step starts.
//!   At most one narration step is open at a time.
//! - Tool-call steps close only when the result carrying their invocation id
//!   arrives, or when the stream ends. Later events of any kind leave them
//!   open, so several tool calls may be pending at once.
//!
//! The engine knows nothing about processes. Events from several invocations
//! can be fed to one engine when a message spans resumed exchanges.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::parser::ProviderEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
	Thinking,
	ToolCall,
	Text,
}

impl StepKind {
	pub fn is_narration(self) -> bool {
		matches!(self, Self::Thinking | Self::Text)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
	pub id: String,
	pub name: String,
	pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
	pub output: String,
	pub is_error: bool,
}

/// Why a step was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
	/// A different step started after this narration step.
	KindChange,
	/// The matching tool result arrived.
	ToolResult,
	/// The stream ended while this narration step was open.
	EndOfStream,
	/// The stream ended before this tool call's result arrived.
	Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
	pub index: usize,
	pub kind: StepKind,
	pub content: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool: Option<ToolInvocation>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<ToolOutcome>,
	pub open: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub closed_by: Option<CloseReason>,
}

impl Step {
	fn narration(index: usize, kind: StepKind, text: &str) -> Self {
		Self {
			index,
			kind,
			content: text.to_string(),
			tool: None,
			result: None,
			open: true,
			closed_by: None,
		}
	}

	fn tool_call(index: usize, invocation: ToolInvocation) -> Self {
		Self {
			index,
			kind: StepKind::ToolCall,
			content: String::new(),
			tool: Some(invocation),
			result: None,
			open: true,
			closed_by: None,
		}
	}

	fn close(&mut self, reason: CloseReason) {
		self.open = false;
		self.closed_by = Some(reason);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePhase {
	#[default]
	Accumulating,
	Complete,
}

/// Output of the engine, in the order the UI should observe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepNotice {
	StepOpened { index: usize, kind: StepKind },
	StepCompleted { step: Step },
	MessageCompleted { step_count: usize },
}

/// What the assistant touched while producing a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
	pub files_touched: BTreeSet<String>,
	pub tools_invoked: Vec<String>,
	pub git_operations: Vec<String>,
	/// Token the provider reported for this exchange; filled by the registry.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub provider_token: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<u64>,
}

const FILE_INPUT_KEYS: &[&str] = &["file_path", "path", "notebook_path"];

#[derive(Debug, Default)]
pub struct StepEngine {
	steps: Vec<Step>,
	narration: Option<usize>,
	open_tools: HashMap<String, usize>,
	phase: MessagePhase,
	metadata: MessageMetadata,
	errors: Vec<String>,
}

impl StepEngine {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn apply(&mut self, event: &ProviderEvent) -> Vec<StepNotice> {
		if self.phase == MessagePhase::Complete {
			warn!(?event, "event after message completion ignored");
			return Vec::new();
		}

		match event {
			ProviderEvent::ThinkingDelta { text } => self.narrate(StepKind::Thinking, text),
			ProviderEvent::TextDelta { text } => self.narrate(StepKind::Text, text),
			ProviderEvent::ToolCallStart { id, name, input } => self.start_tool(id, name, input),
			ProviderEvent::ToolCallResult {
				id,
				output,
				is_error,
			} => self.resolve_tool(id, output, *is_error),
			ProviderEvent::Error { message } => {
				self.errors.push(message.clone());
				Vec::new()
			}
			ProviderEvent::SessionToken { .. } | ProviderEvent::Completed { .. } => Vec::new(),
		}
	}

	/// End of stream: close everything still open and complete the message.
	pub fn finish(&mut self) -> Vec<StepNotice> {
		if self.phase == MessagePhase::Complete {
			return Vec::new();
		}

		let mut notices = self.close_narration(CloseReason::EndOfStream);

		let mut pending: Vec<(String, usize)> = self.open_tools.drain().collect();
		pending.sort_by_key(|(_, idx)| *idx);
		for (id, idx) in pending {
			debug!(tool_use_id = %id, "tool call interrupted by end of stream");
			let step = &mut self.steps[idx];
			step.close(CloseReason::Interrupted);
			notices.push(StepNotice::StepCompleted { step: step.clone() });
		}

		self.phase = MessagePhase::Complete;
		notices.push(StepNotice::MessageCompleted {
			step_count: self.steps.len(),
		});
		notices
	}

	pub fn steps(&self) -> &[Step] {
		&self.steps
	}

	pub fn into_steps(self) -> Vec<Step> {
		self.steps
	}

	pub fn phase(&self) -> MessagePhase {
		self.phase
	}

	pub fn is_complete(&self) -> bool {
		self.phase == MessagePhase::Complete
	}

	pub fn metadata(&self) -> &MessageMetadata {
		&self.metadata
	}

	pub fn errors(&self) -> &[String] {
		&self.errors
	}

	pub fn open_steps(&self) -> impl Iterator<Item = &Step> {
		self.steps.iter().filter(|s| s.open)
	}

	pub fn open_tool_ids(&self) -> BTreeSet<String> {
		self.open_tools.keys().cloned().collect()
	}

	/// Concatenated text of all text steps.
	pub fn text(&self) -> String {
		self.steps
			.iter()
			.filter(|s| s.kind == StepKind::Text)
			.map(|s| s.content.as_str())
			.collect()
	}

	fn narrate(&mut self, kind: StepKind, text: &str) -> Vec<StepNotice> {
		if text.is_empty() {
			return Vec::new();
		}

		if let Some(idx) = self.narration {
			if self.steps[idx].kind == kind {
				self.steps[idx].content.push_str(text);
				return Vec::new();
			}
		}

		let mut notices = self.close_narration(CloseReason::KindChange);
		let index = self.steps.len();
		self.steps.push(Step::narration(index, kind, text));
		self.narration = Some(index);
		notices.push(StepNotice::StepOpened { index, kind });
		notices
	}

	fn start_tool(&mut self, id: &str, name: &str, input: &Value) -> Vec<StepNotice> {
		if self.open_tools.contains_key(id) {
			warn!(tool_use_id = %id, "duplicate tool call start ignored");
			return Vec::new();
		}

		let mut notices = self.close_narration(CloseReason::KindChange);
		let index = self.steps.len();
		self.steps.push(Step::tool_call(
			index,
			ToolInvocation {
				id: id.to_string(),
				name: name.to_string(),
				input: input.clone(),
			},
		));
		self.open_tools.insert(id.to_string(), index);
		self.record_tool_metadata(name, input);
		notices.push(StepNotice::StepOpened {
			index,
			kind: StepKind::ToolCall,
		});
		notices
	}

	fn resolve_tool(&mut self, id: &str, output: &str, is_error: bool) -> Vec<StepNotice> {
		let Some(idx) = self.open_tools.remove(id) else {
			warn!(tool_use_id = %id, "tool result without a matching open tool call");
			return Vec::new();
		};

		let step = &mut self.steps[idx];
		step.result = Some(ToolOutcome {
			output: output.to_string(),
			is_error,
		});
		step.close(CloseReason::ToolResult);
		vec![StepNotice::StepCompleted { step: step.clone() }]
	}

	fn close_narration(&mut self, reason: CloseReason) -> Vec<StepNotice> {
		match self.narration.take() {
			Some(idx) => {
				let step = &mut self.steps[idx];
				step.close(reason);
				vec![StepNotice::StepCompleted { step: step.clone() }]
			}
			None => Vec::new(),
		}
	}

	fn record_tool_metadata(&mut self, name: &str, input: &Value) {
		if !name.is_empty() {
			self.metadata.tools_invoked.push(name.to_string());
		}
		for key in FILE_INPUT_KEYS {
			if let Some(path) = input.get(*key).and_then(Value::as_str) {
				self.metadata.files_touched.insert(path.to_string());
			}
		}
		if let Some(command) = input.get("command").and_then(Value::as_str) {
			let command = command.trim();
			if command == "git" || command.starts_with("git ") {
				self.metadata.git_operations.push(command.to_string());
			}
		}
	}
}
