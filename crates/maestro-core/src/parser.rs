// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Provider output decoding.
//!
//! Two shapes are accepted: a single JSON document written at exit, and
//! line-delimited records written as the provider works. Neither path fails:
//! anything that does not decode is carried through as literal text.
//!
//! Record types understood in streaming mode:
//! - `system`: carries the provider session token
//! - `assistant`: content blocks `thinking`, `text`, `tool_use`
//! - `user`: content blocks `tool_result`
//! - `result`: terminal summary with `result`, `is_error`, usage
//! - `error`: provider-level failure

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Typed event decoded from provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
	ThinkingDelta {
		text: String,
	},
	ToolCallStart {
		id: String,
		name: String,
		input: Value,
	},
	ToolCallResult {
		id: String,
		output: String,
		is_error: bool,
	},
	TextDelta {
		text: String,
	},
	SessionToken {
		token: String,
	},
	Error {
		message: String,
	},
	Completed {
		result: Option<String>,
		is_error: bool,
		duration_ms: Option<u64>,
		cost_usd: Option<f64>,
	},
}

/// Summary of one exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
	pub content: String,
	pub session_token: Option<String>,
	pub is_error: bool,
	#[serde(default)]
	pub metadata: Map<String, Value>,
}

impl ProviderResponse {
	pub fn plain(text: impl Into<String>) -> Self {
		Self {
			content: text.into(),
			..Self::default()
		}
	}

	/// Provider-flagged errors surface even when the process exited cleanly.
	pub fn into_result(self) -> Result<Self> {
		if self.is_error {
			Err(CoreError::ExecutionFailed(self.content))
		} else {
			Ok(self)
		}
	}
}

const CONTENT_KEYS: &[&str] = &["result", "content"];
const TOKEN_KEYS: &[&str] = &["session_id", "sessionId"];
const ERROR_KEYS: &[&str] = &["is_error", "isError"];

/// Decode a complete stdout capture.
///
/// Undecodable output degrades to its raw text; an exchange that yields no
/// content at all is rejected by the registry as `InvalidResponse`.
pub fn parse_response(stdout: &[u8]) -> ProviderResponse {
	let text = String::from_utf8_lossy(stdout);
	let trimmed = text.trim();

	match serde_json::from_str::<Value>(trimmed) {
		Ok(Value::Object(map)) => response_from_object(map, trimmed),
		Ok(Value::Array(records)) => {
			let mut parser = StreamParser::new();
			for record in records {
				parser.push_value(record);
			}
			parser.finish()
		}
		Ok(_) | Err(_) => match parse_line_records(trimmed) {
			Some(response) => response,
			None => {
				debug!(bytes = stdout.len(), "provider output is not structured, using plain text");
				ProviderResponse::plain(trimmed)
			}
		},
	}
}

/// Stdout captured from a line-delimited run; only taken when every
/// non-empty line is a JSON object.
fn parse_line_records(text: &str) -> Option<ProviderResponse> {
	let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
	if lines.len() < 2 {
		return None;
	}
	let values: Vec<Value> = lines
		.iter()
		.map(|l| serde_json::from_str::<Value>(l).ok().filter(Value::is_object))
		.collect::<Option<_>>()?;

	let mut parser = StreamParser::new();
	for value in values {
		parser.push_value(value);
	}
	Some(parser.finish())
}

fn response_from_object(mut map: Map<String, Value>, raw: &str) -> ProviderResponse {
	let content = take_first(&mut map, CONTENT_KEYS).and_then(|v| content_text(&v));
	let session_token = take_first(&mut map, TOKEN_KEYS)
		.and_then(|v| v.as_str().map(str::to_string))
		.filter(|t| !t.is_empty());
	let flagged = take_first(&mut map, ERROR_KEYS)
		.and_then(|v| v.as_bool())
		.unwrap_or(false);
	let subtype_error = map
		.get("subtype")
		.and_then(Value::as_str)
		.filter(|s| s.starts_with("error"))
		.map(str::to_string);

	let is_error = flagged || subtype_error.is_some();
	let content = match (content, subtype_error) {
		(Some(c), _) if !c.is_empty() => c,
		(_, Some(subtype)) => subtype,
		(Some(c), None) => c,
		(None, None) => raw.to_string(),
	};

	ProviderResponse {
		content,
		session_token,
		is_error,
		metadata: map,
	}
}

fn take_first(map: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
	keys.iter().find_map(|k| map.remove(*k))
}

/// Text of a `result`/`content` value: a string, or an array of text blocks.
fn content_text(value: &Value) -> Option<String> {
	match value {
		Value::String(s) => Some(s.clone()),
		Value::Array(blocks) => {
			let parts: Vec<&str> = blocks
				.iter()
				.filter_map(|b| match b {
					Value::String(s) => Some(s.as_str()),
					Value::Object(o) => o.get("text").and_then(Value::as_str),
					_ => None,
				})
				.collect();
			Some(parts.join(""))
		}
		Value::Null => None,
		other => Some(other.to_string()),
	}
}

/// Incremental decoder for line-delimited provider output.
#[derive(Debug, Default)]
pub struct StreamParser {
	session_token: Option<String>,
	text: String,
	result: Option<String>,
	error: Option<String>,
	is_error: bool,
	metadata: Map<String, Value>,
	records: u64,
}

impl StreamParser {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn session_token(&self) -> Option<&str> {
		self.session_token.as_deref()
	}

	pub fn records(&self) -> u64 {
		self.records
	}

	/// Decode one line. Blank lines yield nothing; undecodable lines become text.
	pub fn push_line(&mut self, line: &str) -> Vec<ProviderEvent> {
		let trimmed = line.trim();
		if trimmed.is_empty() {
			return Vec::new();
		}

		match serde_json::from_str::<Value>(trimmed) {
			Ok(value @ Value::Object(_)) => self.push_value(value),
			_ => {
				warn!(line = %truncate(trimmed, 200), "undecodable provider line, treating as text");
				let text = format!("{trimmed}\n");
				self.text.push_str(&text);
				vec![ProviderEvent::TextDelta { text }]
			}
		}
	}

	/// Decode one structured record.
	pub fn push_value(&mut self, value: Value) -> Vec<ProviderEvent> {
		self.records += 1;
		let mut events = Vec::new();

		let Value::Object(record) = value else {
			debug!("ignoring non-object provider record");
			return events;
		};

		if let Some(token) = TOKEN_KEYS
			.iter()
			.find_map(|k| record.get(*k).and_then(Value::as_str))
			.filter(|t| !t.is_empty())
		{
			if self.session_token.as_deref() != Some(token) {
				self.session_token = Some(token.to_string());
				events.push(ProviderEvent::SessionToken {
					token: token.to_string(),
				});
			}
		}

		let record_type = record.get("type").and_then(Value::as_str).unwrap_or("");
		match record_type {
			"system" => {}
			"assistant" | "user" => {
				for block in message_blocks(&record) {
					if let Some(event) = block_event(block) {
						if let ProviderEvent::TextDelta { text } = &event {
							self.text.push_str(text);
						}
						events.push(event);
					}
				}
			}
			"result" => events.extend(self.push_result(&record)),
			"error" => {
				let message = record
					.get("error")
					.and_then(|e| e.get("message").or(Some(e)))
					.and_then(content_text)
					.or_else(|| record.get("message").and_then(content_text))
					.unwrap_or_else(|| "provider error".to_string());
				self.is_error = true;
				self.error = Some(message.clone());
				events.push(ProviderEvent::Error { message });
			}
			"" => {
				// untyped record in the single-document shape
				if let Some(text) = CONTENT_KEYS
					.iter()
					.find_map(|k| record.get(*k))
					.and_then(content_text)
				{
					let flagged = ERROR_KEYS
						.iter()
						.find_map(|k| record.get(*k).and_then(Value::as_bool))
						.unwrap_or(false);
					if flagged {
						self.is_error = true;
						self.error = Some(text.clone());
						events.push(ProviderEvent::Error { message: text });
					} else {
						self.text.push_str(&text);
						events.push(ProviderEvent::TextDelta { text });
					}
				}
			}
			other => debug!(record_type = other, "ignoring provider record"),
		}

		events
	}

	fn push_result(&mut self, record: &Map<String, Value>) -> Vec<ProviderEvent> {
		let result = record.get("result").and_then(content_text);
		let subtype = record.get("subtype").and_then(Value::as_str).unwrap_or("");
		let is_error = record
			.get("is_error")
			.and_then(Value::as_bool)
			.unwrap_or(false)
			|| subtype.starts_with("error");
		let duration_ms = record.get("duration_ms").and_then(Value::as_u64);
		let cost_usd = record.get("total_cost_usd").and_then(Value::as_f64);

		for key in ["duration_ms", "total_cost_usd", "num_turns", "usage", "subtype"] {
			if let Some(v) = record.get(key) {
				self.metadata.insert(key.to_string(), v.clone());
			}
		}

		let mut events = Vec::new();
		if is_error {
			let message = result
				.clone()
				.filter(|r| !r.is_empty())
				.unwrap_or_else(|| subtype.to_string());
			self.is_error = true;
			self.error = Some(message.clone());
			events.push(ProviderEvent::Error { message });
		}
		self.result = result.clone();
		events.push(ProviderEvent::Completed {
			result,
			is_error,
			duration_ms,
			cost_usd,
		});
		events
	}

	/// Summary of everything decoded so far.
	pub fn finish(self) -> ProviderResponse {
		let content = if self.is_error {
			self.error.unwrap_or_default()
		} else {
			self.result.unwrap_or(self.text)
		};
		ProviderResponse {
			content,
			session_token: self.session_token,
			is_error: self.is_error,
			metadata: self.metadata,
		}
	}
}

fn message_blocks(record: &Map<String, Value>) -> Vec<&Value> {
	match record.get("message").and_then(|m| m.get("content")) {
		Some(Value::Array(blocks)) => blocks.iter().collect(),
		_ => Vec::new(),
	}
}

fn block_event(block: &Value) -> Option<ProviderEvent> {
	let kind = block.get("type").and_then(Value::as_str)?;
	let str_field = |key: &str| block.get(key).and_then(Value::as_str).map(str::to_string);

	match kind {
		"text" => str_field("text")
			.filter(|t| !t.is_empty())
			.map(|text| ProviderEvent::TextDelta { text }),
		"thinking" => str_field("thinking")
			.filter(|t| !t.is_empty())
			.map(|text| ProviderEvent::ThinkingDelta { text }),
		"tool_use" => Some(ProviderEvent::ToolCallStart {
			id: str_field("id")?,
			name: str_field("name").unwrap_or_default(),
			input: block.get("input").cloned().unwrap_or(Value::Null),
		}),
		"tool_result" => Some(ProviderEvent::ToolCallResult {
			id: str_field("tool_use_id")?,
			output: block.get("content").and_then(content_text).unwrap_or_default(),
			is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
		}),
		other => {
			debug!(block_type = other, "ignoring content block");
			None
		}
	}
}

fn truncate(s: &str, max: usize) -> &str {
	match s.char_indices().nth(max) {
		Some((idx, _)) => &s[..idx],
		None => s,
	}
}
