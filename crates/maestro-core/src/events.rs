// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Typed session events for presentation layers.
//!
//! The core only publishes; subscribers decide how and when to render.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::lifecycle::{MessageMetadata, Step, StepKind};
use crate::registry::SessionState;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
	#[serde(rename_all = "camelCase")]
	StepOpened {
		session_id: String,
		message_id: String,
		index: usize,
		kind: StepKind,
	},
	#[serde(rename_all = "camelCase")]
	StepCompleted {
		session_id: String,
		message_id: String,
		step: Step,
	},
	#[serde(rename_all = "camelCase")]
	MessageCompleted {
		session_id: String,
		message_id: String,
		content: String,
		metadata: MessageMetadata,
	},
	#[serde(rename_all = "camelCase")]
	MessageFailed {
		session_id: String,
		message_id: String,
		code: String,
		detail: String,
	},
	#[serde(rename_all = "camelCase")]
	SessionStateChanged {
		session_id: String,
		from: SessionState,
		to: SessionState,
	},
	#[serde(rename_all = "camelCase")]
	ProviderTokenUpdated { session_id: String, token: String },
}

impl SessionEvent {
	pub fn session_id(&self) -> &str {
		match self {
			Self::StepOpened { session_id, .. }
			| Self::StepCompleted { session_id, .. }
			| Self::MessageCompleted { session_id, .. }
			| Self::MessageFailed { session_id, .. }
			| Self::SessionStateChanged { session_id, .. }
			| Self::ProviderTokenUpdated { session_id, .. } => session_id,
		}
	}
}

/// Fan-out of [`SessionEvent`]s. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	pub fn publish(&self, event: SessionEvent) {
		// No subscribers is not an error.
		if self.sender.send(event).is_err() {
			tracing::trace!("session event dropped, no subscribers");
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.sender.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_EVENT_CAPACITY)
	}
}
