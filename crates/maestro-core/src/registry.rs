// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Session registry: projects, sessions, and message routing.
//!
//! A message travels resolver -> bridge -> parser -> step engine, with every
//! invocation on a workspace serialized by that workspace's lock. Registry
//! state (tokens, branches, messages) is only updated after the underlying
//! git or process operation has succeeded.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{CommandBridge, Invocation, ProcessBridge};
use crate::config::{CoreConfig, WorkspaceFailurePolicy};
use crate::error::{ConfigError, CoreError, Result};
use crate::events::{EventBus, SessionEvent, DEFAULT_EVENT_CAPACITY};
use crate::lifecycle::{MessageMetadata, Step, StepEngine, StepNotice};
use crate::parser::{parse_response, ProviderEvent, ProviderResponse, StreamParser};
use crate::provider::{Capability, OutputMode, Provider, ProviderRegistry, ProviderRequest};
use crate::resolver::{ExecutableResolver, ResolvedExecutable};
use crate::workspace::{WorkspaceLocks, WorkspaceManager};

const STREAM_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	#[default]
	Idle,
	Starting,
	Active,
	Paused,
	Queued,
	Stopping,
	Error,
	Failed,
	Archived,
}

impl SessionState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Idle => "idle",
			Self::Starting => "starting",
			Self::Active => "active",
			Self::Paused => "paused",
			Self::Queued => "queued",
			Self::Stopping => "stopping",
			Self::Error => "error",
			Self::Failed => "failed",
			Self::Archived => "archived",
		}
	}

	pub fn can_transition_to(self, to: SessionState) -> bool {
		use SessionState::*;
		match (self, to) {
			(Archived, Archived) => false,
			(_, Archived) => true,
			(Idle, Starting)
			| (Starting, Active)
			| (Starting, Failed)
			| (Active, Paused)
			| (Paused, Active)
			| (Active, Stopping)
			| (Stopping, Idle)
			| (Stopping, Error)
			| (Active, Queued)
			| (Idle, Queued)
			| (Queued, Active)
			| (Archived, Active)
			| (Error, Starting)
			| (Failed, Starting) => true,
			_ => false,
		}
	}
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Isolation {
	/// Sessions run in the project's worktree on their own branches.
	Isolated,
	/// Worktree creation failed; sessions share the project root.
	Degraded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
	pub id: String,
	pub path: PathBuf,
	/// Directory provider processes run in.
	pub workspace_path: PathBuf,
	pub isolation: Isolation,
}

impl Project {
	pub fn is_isolated(&self) -> bool {
		matches!(self.isolation, Isolation::Isolated)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAuthor {
	User,
	Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageStatus {
	Accumulating,
	Complete,
	Failed { code: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: String,
	pub author: MessageAuthor,
	pub steps: Vec<Step>,
	pub content: String,
	pub metadata: MessageMetadata,
	pub status: MessageStatus,
	pub created_at: DateTime<Utc>,
}

impl Message {
	fn user(content: &str) -> Self {
		Self {
			id: Uuid::new_v4().to_string(),
			author: MessageAuthor::User,
			steps: Vec::new(),
			content: content.to_string(),
			metadata: MessageMetadata::default(),
			status: MessageStatus::Complete,
			created_at: Utc::now(),
		}
	}

	fn pending_reply(id: &str) -> Self {
		Self {
			id: id.to_string(),
			author: MessageAuthor::Assistant,
			steps: Vec::new(),
			content: String::new(),
			metadata: MessageMetadata::default(),
			status: MessageStatus::Accumulating,
			created_at: Utc::now(),
		}
	}

	pub fn is_failed(&self) -> bool {
		matches!(self.status, MessageStatus::Failed { .. })
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
	pub id: String,
	pub project_id: String,
	pub name: String,
	pub state: SessionState,
	pub branch: Option<String>,
	pub provider: String,
	pub provider_token: Option<String>,
	pub priority: i32,
	pub tags: BTreeSet<String>,
	pub created_at: DateTime<Utc>,
	pub last_active_at: DateTime<Utc>,
	pub duration_estimate_ms: Option<u64>,
	pub duration_actual_ms: u64,
	pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
	pub projects: Vec<Project>,
	pub sessions: Vec<Session>,
}

struct SessionEntry {
	session: Session,
	cancel: CancellationToken,
}

impl SessionEntry {
	/// Cancel in-flight work and arm a fresh token for later sends.
	fn rotate_cancel(&mut self) {
		self.cancel.cancel();
		self.cancel = CancellationToken::new();
	}
}

#[derive(Default)]
struct RegistryState {
	projects: HashMap<String, Project>,
	sessions: HashMap<String, SessionEntry>,
}

impl RegistryState {
	fn entry_mut(&mut self, session_id: &str) -> Result<&mut SessionEntry> {
		self.sessions
			.get_mut(session_id)
			.ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))
	}
}

/// What an operation needs to know about a session, copied out of the lock.
struct Target {
	project: Project,
	name: String,
	state: SessionState,
	branch: Option<String>,
	provider: String,
}

pub struct SessionRegistry {
	providers: ProviderRegistry,
	workspaces: WorkspaceManager,
	bridge: Arc<dyn ProcessBridge>,
	resolver: Arc<ExecutableResolver>,
	events: EventBus,
	locks: WorkspaceLocks,
	on_failure: WorkspaceFailurePolicy,
	streaming: bool,
	resolved: Mutex<HashMap<String, ResolvedExecutable>>,
	state: Mutex<RegistryState>,
}

impl SessionRegistry {
	pub fn new(
		config: &CoreConfig,
		providers: ProviderRegistry,
		bridge: Arc<dyn ProcessBridge>,
		resolver: ExecutableResolver,
	) -> Self {
		Self {
			providers,
			workspaces: WorkspaceManager::new(&config.workspace),
			bridge,
			resolver: Arc::new(resolver),
			events: EventBus::new(config.bridge.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY)),
			locks: WorkspaceLocks::new(),
			on_failure: config.workspace.on_failure,
			streaming: config.provider.streaming,
			resolved: Mutex::new(HashMap::new()),
			state: Mutex::new(RegistryState::default()),
		}
	}

	/// Registry wired to the real process bridge and resolver.
	pub fn from_config(config: &CoreConfig) -> Self {
		Self::new(
			config,
			ProviderRegistry::from_config(&config.provider),
			Arc::new(CommandBridge::from_config(&config.bridge)),
			ExecutableResolver::from_config(&config.provider),
		)
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	pub fn providers(&self) -> &ProviderRegistry {
		&self.providers
	}

	// Projects

	/// Register a project and set up its worktree.
	///
	/// Returns the existing project when the path is already registered.
	/// `NotAGitRepository` always fails; other worktree errors follow the
	/// configured failure policy.
	pub async fn add_project(&self, path: impl Into<PathBuf>) -> Result<Project> {
		let path: PathBuf = path.into();
		let canonical = match tokio::fs::canonicalize(&path).await {
			Ok(p) => p,
			Err(_) => path.clone(),
		};

		let registered = |registry: &Self| {
			registry.with_state(|s| s.projects.values().find(|p| p.path == canonical).cloned())
		};
		if let Some(existing) = registered(self) {
			debug!(project_id = %existing.id, "project already registered");
			return Ok(existing);
		}

		let lock = self.locks.lock_for(&canonical);
		let _guard = lock.lock().await;
		// a concurrent add may have finished while we waited
		if let Some(existing) = registered(self) {
			return Ok(existing);
		}

		let (workspace_path, isolation) = match self.workspaces.create_workspace(&canonical).await {
			Ok(workspace) => (workspace, Isolation::Isolated),
			Err(err @ CoreError::NotAGitRepository(_)) => return Err(err),
			Err(err) if self.on_failure == WorkspaceFailurePolicy::Degrade => {
				warn!(
					path = %canonical.display(),
					error = %err,
					"worktree unavailable, project added without isolation"
				);
				(
					canonical.clone(),
					Isolation::Degraded {
						reason: err.to_string(),
					},
				)
			}
			Err(err) => return Err(err),
		};

		let project = Project {
			id: Uuid::new_v4().to_string(),
			path: canonical,
			workspace_path,
			isolation,
		};
		self.with_state(|s| s.projects.insert(project.id.clone(), project.clone()));
		info!(project_id = %project.id, path = %project.path.display(), isolated = project.is_isolated(), "added project");
		Ok(project)
	}

	/// Delete every session of the project, then its worktree.
	pub async fn remove_project(&self, project_id: &str) -> Result<()> {
		let project = self.get_project(project_id)?;
		let session_ids: Vec<String> = self.with_state(|s| {
			s.sessions
				.values()
				.filter(|e| e.session.project_id == project_id)
				.map(|e| e.session.id.clone())
				.collect()
		});
		for id in session_ids {
			self.delete_session(&id).await?;
		}

		if project.is_isolated() {
			let lock = self.locks.lock_for(&project.workspace_path);
			let _guard = lock.lock().await;
			self.workspaces.destroy_workspace(&project.path).await?;
		}

		self.with_state(|s| s.projects.remove(project_id));
		self.locks.forget(&project.workspace_path);
		self.locks.forget(&project.path);
		info!(project_id = %project_id, "removed project");
		Ok(())
	}

	pub fn get_project(&self, project_id: &str) -> Result<Project> {
		self.with_state(|s| s.projects.get(project_id).cloned())
			.ok_or_else(|| CoreError::ProjectNotFound(project_id.to_string()))
	}

	pub fn list_projects(&self) -> Vec<Project> {
		let mut projects: Vec<Project> = self.with_state(|s| s.projects.values().cloned().collect());
		projects.sort_by(|a, b| a.path.cmp(&b.path));
		projects
	}

	// Sessions

	/// Allocate a session and, for isolated projects, its checked-out branch.
	pub async fn create_session(
		&self,
		project_id: &str,
		name: &str,
		provider: Option<&str>,
	) -> Result<Session> {
		let project = self.get_project(project_id)?;
		let provider_id = provider.unwrap_or(self.providers.default_id()).to_string();
		self.provider(&provider_id)?;

		let id = Uuid::new_v4().to_string();
		let branch = if project.is_isolated() {
			let lock = self.locks.lock_for(&project.workspace_path);
			let _guard = lock.lock().await;
			self.workspaces.create_workspace(&project.path).await?;
			Some(self.workspaces.create_session_branch(&project.path, &id, name).await?)
		} else {
			None
		};

		let now = Utc::now();
		let session = Session {
			id: id.clone(),
			project_id: project.id.clone(),
			name: name.to_string(),
			state: SessionState::Idle,
			branch,
			provider: provider_id,
			provider_token: None,
			priority: 0,
			tags: BTreeSet::new(),
			created_at: now,
			last_active_at: now,
			duration_estimate_ms: None,
			duration_actual_ms: 0,
			messages: Vec::new(),
		};

		self.with_state(|s| {
			s.sessions.insert(
				id.clone(),
				SessionEntry {
					session: session.clone(),
					cancel: CancellationToken::new(),
				},
			)
		});
		info!(session_id = %id, project_id = %project.id, branch = ?session.branch, "created session");
		Ok(session)
	}

	/// Route one user message through the provider and record the reply.
	///
	/// Execution failures are scoped to the message: it is recorded as
	/// failed, the session stays active, and the error is returned.
	pub async fn send(&self, session_id: &str, text: &str) -> Result<Message> {
		let target = self.target(session_id)?;
		if !matches!(target.state, SessionState::Idle | SessionState::Active) {
			return Err(CoreError::InvalidTransition {
				from: target.state,
				to: SessionState::Active,
			});
		}
		let provider = self.provider(&target.provider)?;
		let resolved = self.resolve(&provider).await?;

		let (was_idle, cancel) = self.with_state(|s| -> Result<(bool, CancellationToken)> {
			let entry = s.entry_mut(session_id)?;
			let was_idle = match entry.session.state {
				SessionState::Idle => {
					entry.session.state = SessionState::Starting;
					true
				}
				SessionState::Active => false,
				other => {
					return Err(CoreError::InvalidTransition {
						from: other,
						to: SessionState::Active,
					})
				}
			};
			Ok((was_idle, entry.cancel.clone()))
		})?;
		if was_idle {
			self.announce(session_id, SessionState::Idle, SessionState::Starting);
		}

		let workspace = target.project.workspace_path.clone();
		let lock = self.locks.lock_for(&workspace);
		let _guard = lock.lock().await;

		if let Err(err) = self.prepare_workspace(&target, &cancel).await {
			if was_idle {
				self.settle(session_id, SessionState::Failed);
			}
			return Err(err);
		}
		if was_idle {
			self.activate(session_id)?;
		}

		// Read the token under the workspace lock so a queued send resumes the
		// conversation the previous exchange just committed.
		let message_id = Uuid::new_v4().to_string();
		let token = self.with_state(|s| -> Result<Option<String>> {
			let entry = s.entry_mut(session_id)?;
			if entry.session.state != SessionState::Active {
				return Err(CoreError::InvalidTransition {
					from: entry.session.state,
					to: SessionState::Active,
				});
			}
			entry.session.messages.push(Message::user(text));
			entry.session.messages.push(Message::pending_reply(&message_id));
			Ok(entry.session.provider_token.clone())
		})?;

		let output = if self.streaming && provider.supports(Capability::StreamingOutput) {
			OutputMode::StreamJson
		} else {
			OutputMode::Json
		};
		let resume = token.as_deref().filter(|_| provider.supports(Capability::Resume));
		let args = provider.build_args(&ProviderRequest {
			message: text,
			resume_token: resume,
			output,
		});
		let invocation = Invocation::from_resolved(&resolved, args, &workspace).with_cancel(cancel);

		info!(
			session_id = %session_id,
			message_id = %message_id,
			provider_id = %provider.id(),
			resumed = resume.is_some(),
			"sending message"
		);
		let started = Instant::now();
		let (outcome, mut engine) = match output {
			OutputMode::StreamJson => self.exchange_streaming(session_id, &message_id, invocation).await,
			OutputMode::Json => self.exchange_batch(session_id, &message_id, invocation).await,
		};
		let notices = engine.finish();
		self.publish_notices(session_id, &message_id, notices);
		let elapsed_ms = started.elapsed().as_millis() as u64;

		let mut metadata = engine.metadata().clone();
		metadata.duration_ms = Some(elapsed_ms);
		let streamed_text = engine.text();
		let steps = engine.into_steps();

		let outcome = outcome
			.and_then(ProviderResponse::into_result)
			.and_then(|response| {
				if response.content.trim().is_empty() && streamed_text.trim().is_empty() && steps.is_empty() {
					Err(CoreError::InvalidResponse("provider produced no output".to_string()))
				} else {
					Ok(response)
				}
			});
		if let Err(CoreError::ExecutableNotFound { .. }) = &outcome {
			self.forget_resolved(provider.id());
		}

		let (status, content, new_token, result) = match outcome {
			Ok(response) => {
				metadata.provider_token = response.session_token.clone();
				let content = if response.content.is_empty() {
					streamed_text
				} else {
					response.content
				};
				(MessageStatus::Complete, content, response.session_token, Ok(()))
			}
			Err(err) => {
				warn!(session_id = %session_id, message_id = %message_id, error = %err, "message failed");
				let status = MessageStatus::Failed {
					code: err.code().to_string(),
					detail: failure_detail(&err),
				};
				(status, String::new(), None, Err(err))
			}
		};

		let message = Message {
			id: message_id.clone(),
			author: MessageAuthor::Assistant,
			steps,
			content,
			metadata,
			status,
			created_at: Utc::now(),
		};

		let token_changed = self.with_state(|s| -> Result<bool> {
			let entry = s.entry_mut(session_id)?;
			let session = &mut entry.session;
			match session.messages.iter_mut().find(|m| m.id == message.id) {
				Some(slot) => *slot = message.clone(),
				None => session.messages.push(message.clone()),
			}
			session.duration_actual_ms += elapsed_ms;
			session.last_active_at = Utc::now();
			Ok(match &new_token {
				Some(t) if session.provider_token.as_deref() != Some(t.as_str()) => {
					session.provider_token = Some(t.clone());
					true
				}
				_ => false,
			})
		})?;

		if let (true, Some(token)) = (token_changed, new_token) {
			debug!(session_id = %session_id, "provider token updated");
			self.events.publish(SessionEvent::ProviderTokenUpdated {
				session_id: session_id.to_string(),
				token,
			});
		}

		match result {
			Ok(()) => {
				self.events.publish(SessionEvent::MessageCompleted {
					session_id: session_id.to_string(),
					message_id,
					content: message.content.clone(),
					metadata: message.metadata.clone(),
				});
				Ok(message)
			}
			Err(err) => {
				self.events.publish(SessionEvent::MessageFailed {
					session_id: session_id.to_string(),
					message_id,
					code: err.code().to_string(),
					detail: failure_detail(&err),
				});
				Err(err)
			}
		}
	}

	/// Cancel in-flight work, wait for it to release the workspace, and go idle.
	pub async fn stop(&self, session_id: &str) -> Result<Session> {
		self.shift(session_id, SessionState::Stopping, &[], SessionEntry::rotate_cancel)?;
		let target = self.target(session_id)?;

		let lock = self.locks.lock_for(&target.project.workspace_path);
		let _guard = lock.lock().await;

		let healthy = match (&target.branch, target.project.is_isolated()) {
			(Some(_), true) => match self.workspaces.current_branch(&target.project.workspace_path).await {
				Ok(_) => true,
				Err(e) => {
					warn!(session_id = %session_id, error = %e, "workspace unreadable after stop");
					false
				}
			},
			_ => true,
		};
		let next = if healthy {
			SessionState::Idle
		} else {
			SessionState::Error
		};
		self.shift(session_id, next, &[SessionState::Stopping], |_| {})?;
		self.get_session(session_id)
	}

	/// Recover an `error` or `failed` session: re-establish its branch and
	/// make it active again.
	pub async fn restart(&self, session_id: &str) -> Result<Session> {
		self.shift(
			session_id,
			SessionState::Starting,
			&[SessionState::Error, SessionState::Failed],
			|_| {},
		)?;
		let target = self.target(session_id)?;

		if target.project.is_isolated() {
			let lock = self.locks.lock_for(&target.project.workspace_path);
			let _guard = lock.lock().await;

			let branch = async {
				self.workspaces.create_workspace(&target.project.path).await?;
				self.workspaces
					.create_session_branch(&target.project.path, session_id, &target.name)
					.await
			}
			.await;

			match branch {
				Ok(branch) => {
					self.with_state(|s| {
						s.entry_mut(session_id).map(|e| e.session.branch = Some(branch))
					})?;
				}
				Err(err) => {
					self.settle(session_id, SessionState::Failed);
					return Err(err);
				}
			}
		}

		self.activate(session_id)?;
		self.get_session(session_id)
	}

	pub fn pause(&self, session_id: &str) -> Result<Session> {
		self.shift(session_id, SessionState::Paused, &[SessionState::Active], |_| {})?;
		self.get_session(session_id)
	}

	pub fn resume(&self, session_id: &str) -> Result<Session> {
		self.shift(session_id, SessionState::Active, &[SessionState::Paused], |_| {})?;
		self.get_session(session_id)
	}

	pub fn queue(&self, session_id: &str) -> Result<Session> {
		self.shift(
			session_id,
			SessionState::Queued,
			&[SessionState::Active, SessionState::Idle],
			|_| {},
		)?;
		self.get_session(session_id)
	}

	pub fn unqueue(&self, session_id: &str) -> Result<Session> {
		self.shift(session_id, SessionState::Active, &[SessionState::Queued], |_| {})?;
		self.get_session(session_id)
	}

	/// Archive from any state but `archived`; in-flight work is cancelled.
	pub fn archive(&self, session_id: &str) -> Result<Session> {
		self.shift(session_id, SessionState::Archived, &[], SessionEntry::rotate_cancel)?;
		self.get_session(session_id)
	}

	pub fn unarchive(&self, session_id: &str) -> Result<Session> {
		self.shift(session_id, SessionState::Active, &[SessionState::Archived], |_| {})?;
		self.get_session(session_id)
	}

	pub fn update_priority(&self, session_id: &str, priority: i32) -> Result<Session> {
		self.update(session_id, |session| session.priority = priority)
	}

	pub fn set_tags<I, T>(&self, session_id: &str, tags: I) -> Result<Session>
	where
		I: IntoIterator<Item = T>,
		T: Into<String>,
	{
		let tags: BTreeSet<String> = tags
			.into_iter()
			.map(|t| {
				let t: String = t.into();
				t.trim().to_string()
			})
			.filter(|t| !t.is_empty())
			.collect();
		self.update(session_id, move |session| session.tags = tags)
	}

	pub fn set_duration_estimate(&self, session_id: &str, estimate_ms: Option<u64>) -> Result<Session> {
		self.update(session_id, |session| session.duration_estimate_ms = estimate_ms)
	}

	/// Cancel in-flight work, delete the session branch, and drop the entry.
	/// The worktree is destroyed when this was the project's last session.
	pub async fn delete_session(&self, session_id: &str) -> Result<()> {
		let target = self.target(session_id)?;
		self.with_state(|s| s.entry_mut(session_id).map(SessionEntry::rotate_cancel))?;

		let lock = self.locks.lock_for(&target.project.workspace_path);
		let _guard = lock.lock().await;

		if let (true, Some(branch)) = (target.project.is_isolated(), target.branch.as_deref()) {
			self.workspaces
				.delete_session_branch(&target.project.workspace_path, branch)
				.await?;
		}

		let remaining = self.with_state(|s| {
			s.sessions.remove(session_id);
			s.sessions
				.values()
				.filter(|e| e.session.project_id == target.project.id)
				.count()
		});
		info!(session_id = %session_id, remaining, "deleted session");

		if remaining == 0 && target.project.is_isolated() {
			if let Err(e) = self.workspaces.destroy_workspace(&target.project.path).await {
				warn!(project_id = %target.project.id, error = %e, "failed to clean up worktree");
			}
		}
		Ok(())
	}

	pub fn get_session(&self, session_id: &str) -> Result<Session> {
		self.with_state(|s| s.sessions.get(session_id).map(|e| e.session.clone()))
			.ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))
	}

	/// Sessions ordered by priority (highest first), then creation time.
	pub fn list_sessions(&self, project_id: Option<&str>) -> Vec<Session> {
		let mut sessions: Vec<Session> = self.with_state(|s| {
			s.sessions
				.values()
				.filter(|e| project_id.map_or(true, |p| e.session.project_id == p))
				.map(|e| e.session.clone())
				.collect()
		});
		sessions.sort_by(|a, b| {
			b.priority
				.cmp(&a.priority)
				.then_with(|| a.created_at.cmp(&b.created_at))
		});
		sessions
	}

	pub fn find_by_provider_token(&self, token: &str) -> Result<Session> {
		self.with_state(|s| {
			s.sessions
				.values()
				.find(|e| e.session.provider_token.as_deref() == Some(token))
				.map(|e| e.session.clone())
		})
		.ok_or_else(|| CoreError::SessionNotFound(token.to_string()))
	}

	pub fn snapshot(&self) -> RegistrySnapshot {
		RegistrySnapshot {
			projects: self.list_projects(),
			sessions: self.list_sessions(None),
		}
	}

	// Internals

	fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
		let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		f(&mut state)
	}

	fn target(&self, session_id: &str) -> Result<Target> {
		self.with_state(|s| {
			let entry = s
				.sessions
				.get(session_id)
				.ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
			let project = s
				.projects
				.get(&entry.session.project_id)
				.cloned()
				.ok_or_else(|| CoreError::ProjectNotFound(entry.session.project_id.clone()))?;
			Ok(Target {
				project,
				name: entry.session.name.clone(),
				state: entry.session.state,
				branch: entry.session.branch.clone(),
				provider: entry.session.provider.clone(),
			})
		})
	}

	fn provider(&self, id: &str) -> Result<Arc<dyn Provider>> {
		self.providers.get(id).ok_or_else(|| {
			CoreError::Config(ConfigError::invalid_value(
				"provider",
				format!("unknown provider '{id}'"),
			))
		})
	}

	/// Resolve the provider's executable once, off the async workers.
	async fn resolve(&self, provider: &Arc<dyn Provider>) -> Result<ResolvedExecutable> {
		let cached = self
			.resolved
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.get(provider.id())
			.cloned();
		if let Some(hit) = cached {
			return Ok(hit);
		}

		let resolver = Arc::clone(&self.resolver);
		let name = provider.executable_name().to_string();
		let resolved = tokio::task::spawn_blocking(move || resolver.resolve(&name))
			.await
			.map_err(|e| CoreError::ExecutionFailed(format!("executable resolution aborted: {e}")))??;

		self.resolved
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.insert(provider.id().to_string(), resolved.clone());
		Ok(resolved)
	}

	fn forget_resolved(&self, provider_id: &str) {
		let evicted = self
			.resolved
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.remove(provider_id);
		if evicted.is_some() {
			debug!(provider_id = %provider_id, "dropped cached executable after launch failure");
		}
	}

	/// Check the session's branch out before its provider runs.
	async fn prepare_workspace(&self, target: &Target, cancel: &CancellationToken) -> Result<()> {
		if cancel.is_cancelled() {
			return Err(CoreError::Cancelled);
		}
		if let (true, Some(branch)) = (target.project.is_isolated(), target.branch.as_deref()) {
			self.workspaces
				.switch_branch(&target.project.workspace_path, branch)
				.await?;
		}
		Ok(())
	}

	async fn exchange_batch(
		&self,
		session_id: &str,
		message_id: &str,
		invocation: Invocation,
	) -> (Result<ProviderResponse>, StepEngine) {
		let mut engine = StepEngine::new();
		let outcome = self
			.bridge
			.invoke(invocation)
			.await
			.map(|output| parse_response(&output.stdout));

		if let Ok(response) = &outcome {
			if !response.is_error && !response.content.is_empty() {
				let notices = engine.apply(&ProviderEvent::TextDelta {
					text: response.content.clone(),
				});
				self.publish_notices(session_id, message_id, notices);
			}
		}
		(outcome, engine)
	}

	async fn exchange_streaming(
		&self,
		session_id: &str,
		message_id: &str,
		invocation: Invocation,
	) -> (Result<ProviderResponse>, StepEngine) {
		let (tx, rx) = mpsc::channel(STREAM_BUFFER);
		let (result, (parser, engine)) = tokio::join!(
			self.bridge.invoke_streaming(invocation, tx),
			self.consume_stream(session_id, message_id, rx)
		);
		(result.map(|_| parser.finish()), engine)
	}

	async fn consume_stream(
		&self,
		session_id: &str,
		message_id: &str,
		mut lines: mpsc::Receiver<String>,
	) -> (StreamParser, StepEngine) {
		let mut parser = StreamParser::new();
		let mut engine = StepEngine::new();
		while let Some(line) = lines.recv().await {
			for event in parser.push_line(&line) {
				let notices = engine.apply(&event);
				self.publish_notices(session_id, message_id, notices);
			}
		}
		debug!(session_id = %session_id, records = parser.records(), "provider stream ended");
		(parser, engine)
	}

	fn publish_notices(&self, session_id: &str, message_id: &str, notices: Vec<StepNotice>) {
		for notice in notices {
			let event = match notice {
				StepNotice::StepOpened { index, kind } => SessionEvent::StepOpened {
					session_id: session_id.to_string(),
					message_id: message_id.to_string(),
					index,
					kind,
				},
				StepNotice::StepCompleted { step } => SessionEvent::StepCompleted {
					session_id: session_id.to_string(),
					message_id: message_id.to_string(),
					step,
				},
				// announced with content once the reply is recorded
				StepNotice::MessageCompleted { .. } => continue,
			};
			self.events.publish(event);
		}
	}

	fn update(&self, session_id: &str, f: impl FnOnce(&mut Session)) -> Result<Session> {
		self.with_state(|s| {
			let entry = s.entry_mut(session_id)?;
			f(&mut entry.session);
			Ok(entry.session.clone())
		})
	}

	/// Finish a start. Only a session still `starting` becomes active; one
	/// archived or stopped meanwhile keeps that state.
	fn activate(&self, session_id: &str) -> Result<SessionState> {
		self.shift(session_id, SessionState::Active, &[SessionState::Starting], |_| {})
	}

	fn transition(&self, session_id: &str, to: SessionState) -> Result<SessionState> {
		self.shift(session_id, to, &[], |_| {})
	}

	/// Best-effort transition after a failure; the original error wins.
	fn settle(&self, session_id: &str, to: SessionState) {
		if let Err(e) = self.transition(session_id, to) {
			debug!(session_id = %session_id, error = %e, "could not settle session state");
		}
	}

	/// Move a session to `to` if the state machine allows it and, when
	/// `allowed` is non-empty, the current state is listed there.
	fn shift(
		&self,
		session_id: &str,
		to: SessionState,
		allowed: &[SessionState],
		side_effect: impl FnOnce(&mut SessionEntry),
	) -> Result<SessionState> {
		let from = self.with_state(|s| -> Result<SessionState> {
			let entry = s.entry_mut(session_id)?;
			let from = entry.session.state;
			if !from.can_transition_to(to) || !(allowed.is_empty() || allowed.contains(&from)) {
				return Err(CoreError::InvalidTransition { from, to });
			}
			entry.session.state = to;
			entry.session.last_active_at = Utc::now();
			side_effect(entry);
			Ok(from)
		})?;
		self.announce(session_id, from, to);
		Ok(from)
	}

	fn announce(&self, session_id: &str, from: SessionState, to: SessionState) {
		info!(session_id = %session_id, from = %from, to = %to, "session state changed");
		self.events.publish(SessionEvent::SessionStateChanged {
			session_id: session_id.to_string(),
			from,
			to,
		});
	}
}

fn failure_detail(err: &CoreError) -> String {
	match err {
		CoreError::ExecutionFailed(detail) | CoreError::InvalidResponse(detail) => detail.clone(),
		other => other.to_string(),
	}
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use crate::bridge::ProcessOutput;
	use crate::lifecycle::{CloseReason, StepKind};
	use crate::resolver::NoShellLookup;
	use async_trait::async_trait;
	use std::collections::VecDeque;
	use std::fs;
	use std::os::unix::fs::PermissionsExt;
	use std::path::Path;
	use std::process::Command as StdCommand;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;
	use tempfile::TempDir;

	enum Reply {
		Stdout(&'static str),
		Lines(Vec<&'static str>),
		/// Stdout after a delay, for overlapping sends.
		Slow(&'static str, u64),
		Fail(&'static str),
		Missing,
		Hang,
	}

	#[derive(Default)]
	struct ScriptedBridge {
		replies: Mutex<VecDeque<Reply>>,
		calls: Mutex<Vec<Invocation>>,
		running: AtomicUsize,
		peak: AtomicUsize,
	}

	/// Counts an invocation as running until dropped.
	struct Running<'a>(&'a AtomicUsize);

	impl Drop for Running<'_> {
		fn drop(&mut self) {
			self.0.fetch_sub(1, Ordering::SeqCst);
		}
	}

	impl ScriptedBridge {
		fn with(replies: Vec<Reply>) -> Arc<Self> {
			Arc::new(Self {
				replies: Mutex::new(replies.into()),
				..Default::default()
			})
		}

		fn calls(&self) -> Vec<Invocation> {
			self.calls.lock().unwrap().clone()
		}

		fn peak(&self) -> usize {
			self.peak.load(Ordering::SeqCst)
		}

		fn next(&self, invocation: &Invocation) -> (Reply, Running<'_>) {
			let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);
			self.calls.lock().unwrap().push(invocation.clone());
			let reply = self
				.replies
				.lock()
				.unwrap()
				.pop_front()
				.unwrap_or(Reply::Stdout(""));
			(reply, Running(&self.running))
		}

		async fn play(
			&self,
			invocation: Invocation,
			tx: Option<mpsc::Sender<String>>,
		) -> Result<ProcessOutput> {
			let (reply, _running) = self.next(&invocation);
			match reply {
				Reply::Stdout(s) => {
					if let Some(tx) = &tx {
						let _ = tx.send(s.to_string()).await;
					}
					Ok(output(s))
				}
				Reply::Lines(lines) => {
					if let Some(tx) = &tx {
						for line in &lines {
							let _ = tx.send(line.to_string()).await;
						}
					}
					Ok(output(lines.join("\n")))
				}
				Reply::Slow(s, ms) => {
					tokio::time::sleep(Duration::from_millis(ms)).await;
					if let Some(tx) = &tx {
						let _ = tx.send(s.to_string()).await;
					}
					Ok(output(s))
				}
				Reply::Fail(detail) => Err(CoreError::ExecutionFailed(detail.to_string())),
				Reply::Missing => Err(CoreError::ExecutableNotFound {
					name: invocation.program.display().to_string(),
				}),
				Reply::Hang => {
					invocation.cancel.cancelled().await;
					Err(CoreError::Cancelled)
				}
			}
		}
	}

	fn output(stdout: impl Into<Vec<u8>>) -> ProcessOutput {
		ProcessOutput {
			stdout: stdout.into(),
			stderr: String::new(),
			exit_code: Some(0),
			duration: Duration::from_millis(5),
		}
	}

	#[async_trait]
	impl ProcessBridge for ScriptedBridge {
		async fn invoke(&self, invocation: Invocation) -> Result<ProcessOutput> {
			self.play(invocation, None).await
		}

		async fn invoke_streaming(
			&self,
			invocation: Invocation,
			tx: mpsc::Sender<String>,
		) -> Result<ProcessOutput> {
			self.play(invocation, Some(tx)).await
		}
	}

	fn git(dir: &Path, args: &[&str]) {
		let out = StdCommand::new("git").args(args).current_dir(dir).output().unwrap();
		assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
	}

	fn init_repo() -> TempDir {
		let temp = TempDir::new().unwrap();
		git(temp.path(), &["init", "-q"]);
		git(temp.path(), &["config", "user.email", "test@test.com"]);
		git(temp.path(), &["config", "user.name", "Test"]);
		fs::write(temp.path().join("README.md"), "# Test").unwrap();
		git(temp.path(), &["add", "."]);
		git(temp.path(), &["commit", "-q", "-m", "Initial commit"]);
		temp
	}

	fn fake_executable(dir: &Path) -> PathBuf {
		let path = dir.join("claude");
		fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	fn resolver(exe: Option<PathBuf>) -> ExecutableResolver {
		ExecutableResolver::new(Vec::new())
			.with_explicit(exe)
			.with_runtime_dirs(Vec::new())
			.with_ambient_path(None)
			.with_shell_lookup(Box::new(NoShellLookup))
	}

	struct Fixture {
		registry: Arc<SessionRegistry>,
		bridge: Arc<ScriptedBridge>,
		_bin: TempDir,
	}

	fn fixture(replies: Vec<Reply>, configure: impl FnOnce(&mut CoreConfig)) -> Fixture {
		let bin = TempDir::new().unwrap();
		let exe = fake_executable(bin.path());
		let mut config = CoreConfig::default();
		configure(&mut config);
		let bridge = ScriptedBridge::with(replies);
		let registry = SessionRegistry::new(
			&config,
			ProviderRegistry::from_config(&config.provider),
			bridge.clone(),
			resolver(Some(exe)),
		);
		Fixture {
			registry: Arc::new(registry),
			bridge,
			_bin: bin,
		}
	}

	fn batch(config: &mut CoreConfig) {
		config.provider.streaming = false;
	}

	#[test]
	fn state_machine_edges() {
		use SessionState::*;
		let allowed = [
			(Idle, Starting),
			(Starting, Active),
			(Active, Paused),
			(Paused, Active),
			(Active, Stopping),
			(Stopping, Idle),
			(Stopping, Error),
			(Active, Queued),
			(Idle, Queued),
			(Queued, Active),
			(Archived, Active),
			(Error, Starting),
			(Failed, Starting),
			(Paused, Archived),
			(Error, Archived),
		];
		for (from, to) in allowed {
			assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
		}

		let rejected = [
			(Idle, Active),
			(Paused, Stopping),
			(Archived, Archived),
			(Archived, Paused),
			(Queued, Idle),
			(Error, Active),
			(Stopping, Active),
		];
		for (from, to) in rejected {
			assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
		}
	}

	#[test]
	fn state_serializes_snake_case() {
		assert_eq!(serde_json::to_value(SessionState::Archived).unwrap(), "archived");
		assert_eq!(SessionState::Stopping.to_string(), "stopping");
	}

	#[tokio::test]
	async fn create_session_checks_out_branch() {
		let repo = init_repo();
		let f = fixture(vec![], |_| {});
		let project = f.registry.add_project(repo.path()).await.unwrap();
		assert!(project.is_isolated());

		let session = f
			.registry
			.create_session(&project.id, "Add login", None)
			.await
			.unwrap();
		assert_eq!(session.state, SessionState::Idle);
		assert_eq!(session.provider, "claude_code");
		let branch = session.branch.unwrap();
		assert!(branch.starts_with("maestro/add-login-"));

		let head = StdCommand::new("git")
			.args(["symbolic-ref", "--short", "HEAD"])
			.current_dir(&project.workspace_path)
			.output()
			.unwrap();
		assert_eq!(String::from_utf8_lossy(&head.stdout).trim(), branch);
	}

	#[tokio::test]
	async fn add_project_is_idempotent() {
		let repo = init_repo();
		let f = fixture(vec![], |_| {});
		let first = f.registry.add_project(repo.path()).await.unwrap();
		let second = f.registry.add_project(repo.path()).await.unwrap();
		assert_eq!(first, second);
		assert_eq!(f.registry.list_projects().len(), 1);
	}

	#[tokio::test]
	async fn batch_send_records_reply_and_token() {
		let repo = init_repo();
		let f = fixture(
			vec![
				Reply::Stdout(r#"{"result":"Hi!","session_id":"abc123","is_error":false}"#),
				Reply::Stdout(r#"{"result":"Again","session_id":"abc123"}"#),
			],
			batch,
		);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "chat", None).await.unwrap();
		let mut events = f.registry.subscribe();

		let reply = f.registry.send(&session.id, "Hello").await.unwrap();
		assert_eq!(reply.content, "Hi!");
		assert_eq!(reply.status, MessageStatus::Complete);
		assert_eq!(reply.steps.len(), 1);
		assert_eq!(reply.metadata.provider_token.as_deref(), Some("abc123"));

		let session = f.registry.get_session(&session.id).unwrap();
		assert_eq!(session.state, SessionState::Active);
		assert_eq!(session.provider_token.as_deref(), Some("abc123"));
		assert_eq!(session.messages.len(), 2);
		assert_eq!(session.messages[0].author, MessageAuthor::User);

		f.registry.send(&session.id, "More").await.unwrap();
		let calls = f.bridge.calls();
		assert_eq!(calls[0].args, vec!["-p", "--output-format", "json", "Hello"]);
		assert_eq!(
			calls[1].args,
			vec!["-p", "--output-format", "json", "--resume", "abc123", "More"]
		);
		assert_eq!(calls[0].working_dir, project.workspace_path);

		let mut saw_token = false;
		let mut saw_completed = false;
		while let Ok(event) = events.try_recv() {
			match event {
				SessionEvent::ProviderTokenUpdated { token, .. } => {
					assert_eq!(token, "abc123");
					saw_token = true;
				}
				SessionEvent::MessageCompleted { .. } => saw_completed = true,
				_ => {}
			}
		}
		assert!(saw_token && saw_completed);
		assert_eq!(f.registry.find_by_provider_token("abc123").unwrap().id, session.id);
	}

	#[tokio::test]
	async fn provider_error_fails_message_but_not_session() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout(r#"{"result":"boom","is_error":true,"session_id":"t9"}"#)], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();

		let err = f.registry.send(&session.id, "go").await.unwrap_err();
		assert!(matches!(err, CoreError::ExecutionFailed(ref d) if d == "boom"));
		assert!(err.is_retryable());

		let session = f.registry.get_session(&session.id).unwrap();
		assert_eq!(session.state, SessionState::Active);
		assert_eq!(session.provider_token, None, "token is not committed on failure");
		let reply = session.messages.last().unwrap();
		assert_eq!(
			reply.status,
			MessageStatus::Failed {
				code: "execution_failed".into(),
				detail: "boom".into()
			}
		);
	}

	#[tokio::test]
	async fn process_failure_is_scoped_to_message() {
		let repo = init_repo();
		let f = fixture(
			vec![
				Reply::Fail("permission denied"),
				Reply::Stdout(r#"{"result":"ok"}"#),
			],
			batch,
		);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();
		let mut events = f.registry.subscribe();

		let err = f.registry.send(&session.id, "first").await.unwrap_err();
		assert!(matches!(err, CoreError::ExecutionFailed(ref d) if d == "permission denied"));
		assert!(matches!(
			events.recv().await.unwrap(),
			SessionEvent::SessionStateChanged { to: SessionState::Starting, .. }
		));

		let retry = f.registry.send(&session.id, "first").await.unwrap();
		assert_eq!(retry.content, "ok");
		let session = f.registry.get_session(&session.id).unwrap();
		assert_eq!(session.messages.len(), 4);
		assert!(session.messages[1].is_failed());
	}

	#[tokio::test]
	async fn plain_text_reply_is_taken_literally() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout("plain text reply")], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();

		let reply = f.registry.send(&session.id, "hi").await.unwrap();
		assert_eq!(reply.content, "plain text reply");
		assert_eq!(f.registry.get_session(&session.id).unwrap().provider_token, None);
	}

	#[tokio::test]
	async fn streaming_send_builds_steps() {
		let repo = init_repo();
		let f = fixture(
			vec![Reply::Lines(vec![
				r#"{"type":"system","subtype":"init","session_id":"tok-1"}"#,
				r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"Let me look"}]}}"#,
				r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu1","name":"Read","input":{"file_path":"src/lib.rs"}}]}}"#,
				r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu1","content":"fn main() {}"}]}}"#,
				r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Done."}]}}"#,
				r#"{"type":"result","subtype":"success","result":"Done.","session_id":"tok-1","is_error":false}"#,
			])],
			|_| {},
		);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();
		let mut events = f.registry.subscribe();

		let reply = f.registry.send(&session.id, "read it").await.unwrap();
		assert_eq!(reply.content, "Done.");
		let kinds: Vec<StepKind> = reply.steps.iter().map(|s| s.kind).collect();
		assert_eq!(kinds, vec![StepKind::Thinking, StepKind::ToolCall, StepKind::Text]);
		assert!(reply.steps.iter().all(|s| !s.open));
		assert_eq!(reply.steps[1].closed_by, Some(CloseReason::ToolResult));
		assert_eq!(reply.steps[1].result.as_ref().unwrap().output, "fn main() {}");
		assert!(reply.metadata.files_touched.contains("src/lib.rs"));
		assert_eq!(reply.metadata.tools_invoked, vec!["Read"]);

		let args = &f.bridge.calls()[0].args;
		assert!(args.contains(&"stream-json".to_string()));
		assert_eq!(
			f.registry.get_session(&session.id).unwrap().provider_token.as_deref(),
			Some("tok-1")
		);

		let mut completed = Vec::new();
		while let Ok(event) = events.try_recv() {
			if let SessionEvent::StepCompleted { step, .. } = event {
				completed.push(step.kind);
			}
		}
		assert_eq!(completed, vec![StepKind::Thinking, StepKind::ToolCall, StepKind::Text]);
	}

	#[tokio::test]
	async fn lifecycle_operations_follow_state_machine() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout(r#"{"result":"ok"}"#)], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();
		let id = session.id.as_str();

		assert!(matches!(
			f.registry.pause(id).unwrap_err(),
			CoreError::InvalidTransition { from: SessionState::Idle, to: SessionState::Paused }
		));

		assert_eq!(f.registry.queue(id).unwrap().state, SessionState::Queued);
		assert!(f.registry.send(id, "nope").await.is_err());
		assert_eq!(f.registry.unqueue(id).unwrap().state, SessionState::Active);

		f.registry.send(id, "hi").await.unwrap();
		assert_eq!(f.registry.pause(id).unwrap().state, SessionState::Paused);
		let err = f.registry.send(id, "while paused").await.unwrap_err();
		assert!(matches!(err, CoreError::InvalidTransition { from: SessionState::Paused, .. }));
		assert_eq!(f.registry.resume(id).unwrap().state, SessionState::Active);

		assert_eq!(f.registry.archive(id).unwrap().state, SessionState::Archived);
		let err = f.registry.pause(id).unwrap_err();
		assert_eq!(err.to_string(), "invalid session transition: archived -> paused");
		assert!(f.registry.archive(id).is_err());
		assert_eq!(f.registry.unarchive(id).unwrap().state, SessionState::Active);

		assert!(matches!(
			f.registry.restart(id).await.unwrap_err(),
			CoreError::InvalidTransition { from: SessionState::Active, to: SessionState::Starting }
		));
	}

	#[tokio::test]
	async fn priority_tags_and_listing() {
		let repo = init_repo();
		let f = fixture(vec![], |_| {});
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let low = f.registry.create_session(&project.id, "low", None).await.unwrap();
		let high = f.registry.create_session(&project.id, "high", None).await.unwrap();

		f.registry.update_priority(&high.id, 10).unwrap();
		let tagged = f.registry.set_tags(&low.id, ["bug", " ", "ui"]).unwrap();
		assert_eq!(tagged.tags, BTreeSet::from(["bug".to_string(), "ui".to_string()]));
		f.registry.set_duration_estimate(&low.id, Some(60_000)).unwrap();

		let listed: Vec<String> = f
			.registry
			.list_sessions(Some(&project.id))
			.into_iter()
			.map(|s| s.id)
			.collect();
		assert_eq!(listed, vec![high.id.clone(), low.id.clone()]);
		assert!(f.registry.list_sessions(Some("other")).is_empty());

		let snapshot = f.registry.snapshot();
		assert_eq!(snapshot.projects.len(), 1);
		assert_eq!(snapshot.sessions.len(), 2);
		let json = serde_json::to_value(&snapshot).unwrap();
		assert_eq!(json["sessions"][1]["durationEstimateMs"], 60_000);
	}

	#[tokio::test]
	async fn unknown_ids_and_tokens() {
		let f = fixture(vec![], |_| {});
		assert!(matches!(
			f.registry.find_by_provider_token("missing").unwrap_err(),
			CoreError::SessionNotFound(_)
		));
		assert!(matches!(
			f.registry.send("nope", "hi").await.unwrap_err(),
			CoreError::SessionNotFound(_)
		));
		assert!(matches!(
			f.registry.create_session("nope", "s", None).await.unwrap_err(),
			CoreError::ProjectNotFound(_)
		));
	}

	#[tokio::test]
	async fn stop_cancels_in_flight_invocation() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Hang], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();

		let registry = Arc::clone(&f.registry);
		let id = session.id.clone();
		let pending = tokio::spawn(async move { registry.send(&id, "long job").await });

		for _ in 0..200 {
			if !f.bridge.calls().is_empty() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(f.bridge.calls().len(), 1, "invocation never started");

		let stopped = f.registry.stop(&session.id).await.unwrap();
		assert_eq!(stopped.state, SessionState::Idle);

		let result = pending.await.unwrap();
		assert!(matches!(result, Err(CoreError::Cancelled)));
		let reply = stopped.messages.last().unwrap();
		assert!(matches!(reply.status, MessageStatus::Failed { ref code, .. } if code == "cancelled"));
	}

	#[tokio::test]
	async fn delete_last_session_cleans_up_worktree() {
		let repo = init_repo();
		let f = fixture(vec![], |_| {});
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let a = f.registry.create_session(&project.id, "a", None).await.unwrap();
		let b = f.registry.create_session(&project.id, "b", None).await.unwrap();

		f.registry.delete_session(&a.id).await.unwrap();
		assert!(project.workspace_path.exists());
		assert!(matches!(
			f.registry.get_session(&a.id).unwrap_err(),
			CoreError::SessionNotFound(_)
		));

		f.registry.delete_session(&b.id).await.unwrap();
		assert!(!project.workspace_path.exists());

		let branches = StdCommand::new("git")
			.args(["branch", "--list", "maestro/*"])
			.current_dir(repo.path())
			.output()
			.unwrap();
		assert!(String::from_utf8_lossy(&branches.stdout).trim().is_empty());

		// A new session brings the worktree back.
		let c = f.registry.create_session(&project.id, "c", None).await.unwrap();
		assert!(c.branch.is_some());
		assert!(project.workspace_path.exists());

		f.registry.remove_project(&project.id).await.unwrap();
		assert!(!project.workspace_path.exists());
		assert!(f.registry.list_projects().is_empty());
	}

	#[tokio::test]
	async fn failed_start_can_be_restarted() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout(r#"{"result":"back"}"#)], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let a = f.registry.create_session(&project.id, "a", None).await.unwrap();
		let _b = f.registry.create_session(&project.id, "b", None).await.unwrap();

		// Branch vanishes behind the registry's back.
		git(repo.path(), &["branch", "-D", a.branch.as_deref().unwrap()]);

		let err = f.registry.send(&a.id, "hi").await.unwrap_err();
		assert!(matches!(err, CoreError::Git { .. }), "got {err:?}");
		assert_eq!(f.registry.get_session(&a.id).unwrap().state, SessionState::Failed);
		assert!(f.bridge.calls().is_empty());

		let restarted = f.registry.restart(&a.id).await.unwrap();
		assert_eq!(restarted.state, SessionState::Active);
		let reply = f.registry.send(&a.id, "hi").await.unwrap();
		assert_eq!(reply.content, "back");
	}

	#[tokio::test]
	async fn stop_with_vanished_worktree_lands_in_error() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout(r#"{"result":"ok"}"#)], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();
		f.registry.send(&session.id, "hi").await.unwrap();

		fs::remove_dir_all(&project.workspace_path).unwrap();
		let stopped = f.registry.stop(&session.id).await.unwrap();
		assert_eq!(stopped.state, SessionState::Error);

		let restarted = f.registry.restart(&session.id).await.unwrap();
		assert_eq!(restarted.state, SessionState::Active);
		assert_eq!(restarted.branch, session.branch);
		assert!(project.workspace_path.join(".git").exists());
	}

	async fn wait_for_calls(bridge: &ScriptedBridge, n: usize) {
		for _ in 0..300 {
			if bridge.calls().len() >= n {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("bridge never reached {n} calls");
	}

	fn spawn_send(
		registry: &Arc<SessionRegistry>,
		id: &str,
		text: &'static str,
	) -> tokio::task::JoinHandle<Result<Message>> {
		let registry = Arc::clone(registry);
		let id = id.to_string();
		tokio::spawn(async move { registry.send(&id, text).await })
	}

	#[tokio::test]
	async fn queued_send_resumes_token_from_previous_exchange() {
		let repo = init_repo();
		let f = fixture(
			vec![
				Reply::Stdout(r#"{"result":"one","session_id":"T1"}"#),
				Reply::Slow(r#"{"result":"two","session_id":"T2"}"#, 200),
				Reply::Stdout(r#"{"result":"three","session_id":"T2"}"#),
			],
			batch,
		);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();
		f.registry.send(&session.id, "one").await.unwrap();

		let second = spawn_send(&f.registry, &session.id, "two");
		wait_for_calls(&f.bridge, 2).await;
		let third = spawn_send(&f.registry, &session.id, "three");
		second.await.unwrap().unwrap();
		third.await.unwrap().unwrap();

		let calls = f.bridge.calls();
		assert_eq!(
			calls[1].args,
			vec!["-p", "--output-format", "json", "--resume", "T1", "two"]
		);
		assert_eq!(
			calls[2].args,
			vec!["-p", "--output-format", "json", "--resume", "T2", "three"]
		);
	}

	#[tokio::test]
	async fn invocations_on_one_worktree_never_overlap() {
		let repo = init_repo();
		let other = init_repo();
		let f = fixture(
			vec![
				Reply::Slow(r#"{"result":"a"}"#, 150),
				Reply::Slow(r#"{"result":"b"}"#, 150),
				Reply::Slow(r#"{"result":"c"}"#, 300),
				Reply::Slow(r#"{"result":"d"}"#, 300),
			],
			batch,
		);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let a = f.registry.create_session(&project.id, "a", None).await.unwrap();
		let b = f.registry.create_session(&project.id, "b", None).await.unwrap();

		let first = spawn_send(&f.registry, &a.id, "go");
		let second = spawn_send(&f.registry, &b.id, "go");
		first.await.unwrap().unwrap();
		second.await.unwrap().unwrap();
		assert_eq!(f.bridge.calls().len(), 2);
		assert_eq!(f.bridge.peak(), 1, "sessions sharing a worktree ran concurrently");

		// separate projects do not share a lock
		let other_project = f.registry.add_project(other.path()).await.unwrap();
		let c = f.registry.create_session(&project.id, "c", None).await.unwrap();
		let d = f.registry.create_session(&other_project.id, "d", None).await.unwrap();
		let third = spawn_send(&f.registry, &c.id, "go");
		let fourth = spawn_send(&f.registry, &d.id, "go");
		third.await.unwrap().unwrap();
		fourth.await.unwrap().unwrap();
		assert_eq!(f.bridge.peak(), 2);
	}

	#[tokio::test]
	async fn archive_during_start_keeps_session_archived() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout(r#"{"result":"ok"}"#)], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();

		let lock = f.registry.locks.lock_for(&project.workspace_path);
		let guard = lock.lock().await;
		let pending = spawn_send(&f.registry, &session.id, "hi");
		for _ in 0..300 {
			if f.registry.get_session(&session.id).unwrap().state == SessionState::Starting {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		f.registry.archive(&session.id).unwrap();
		drop(guard);

		assert!(matches!(pending.await.unwrap(), Err(CoreError::Cancelled)));
		let archived = f.registry.get_session(&session.id).unwrap();
		assert_eq!(archived.state, SessionState::Archived);
		assert!(archived.messages.is_empty());
		assert!(f.bridge.calls().is_empty());

		// completing a start never revives a session that left `starting`
		assert!(matches!(
			f.registry.activate(&session.id).unwrap_err(),
			CoreError::InvalidTransition {
				from: SessionState::Archived,
				to: SessionState::Active
			}
		));
		assert_eq!(
			f.registry.get_session(&session.id).unwrap().state,
			SessionState::Archived
		);
	}

	#[tokio::test]
	async fn launch_failure_drops_cached_executable() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout(r#"{"result":"ok"}"#), Reply::Missing], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();
		let cached = |f: &Fixture| f.registry.resolved.lock().unwrap().contains_key("claude_code");

		f.registry.send(&session.id, "hi").await.unwrap();
		assert!(cached(&f));

		let err = f.registry.send(&session.id, "again").await.unwrap_err();
		assert!(matches!(err, CoreError::ExecutableNotFound { .. }));
		assert!(!cached(&f));

		// the next send resolves afresh and sees the executable is gone
		fs::remove_file(f._bin.path().join("claude")).unwrap();
		let err = f.registry.send(&session.id, "third").await.unwrap_err();
		assert!(matches!(err, CoreError::ExecutableNotFound { ref name } if name == "claude"));
		assert_eq!(f.bridge.calls().len(), 2);
	}

	#[tokio::test]
	async fn empty_reply_is_an_invalid_response() {
		let repo = init_repo();
		let f = fixture(vec![Reply::Stdout("")], batch);
		let project = f.registry.add_project(repo.path()).await.unwrap();
		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();

		let err = f.registry.send(&session.id, "hi").await.unwrap_err();
		assert!(matches!(err, CoreError::InvalidResponse(_)));
		let session = f.registry.get_session(&session.id).unwrap();
		assert_eq!(session.state, SessionState::Active);
		assert!(matches!(
			session.messages.last().unwrap().status,
			MessageStatus::Failed { ref code, .. } if code == "invalid_response"
		));
	}

	#[tokio::test]
	async fn degraded_project_runs_in_root() {
		let temp = TempDir::new().unwrap();
		git(temp.path(), &["init", "-q"]);
		let f = fixture(vec![Reply::Stdout(r#"{"result":"ok"}"#)], batch);

		let project = f.registry.add_project(temp.path()).await.unwrap();
		assert!(matches!(project.isolation, Isolation::Degraded { .. }));
		assert_eq!(project.workspace_path, project.path);

		let session = f.registry.create_session(&project.id, "s", None).await.unwrap();
		assert_eq!(session.branch, None);
		f.registry.send(&session.id, "hi").await.unwrap();
		assert_eq!(f.bridge.calls()[0].working_dir, project.path);
	}

	#[tokio::test]
	async fn fail_policy_rejects_project() {
		let temp = TempDir::new().unwrap();
		git(temp.path(), &["init", "-q"]);
		let f = fixture(vec![], |c| c.workspace.on_failure = WorkspaceFailurePolicy::Fail);

		let err = f.registry.add_project(temp.path()).await.unwrap_err();
		assert!(matches!(err, CoreError::WorktreeCreationFailed(_)));
		assert!(f.registry.list_projects().is_empty());
	}

	#[tokio::test]
	async fn non_repository_always_fails() {
		let temp = TempDir::new().unwrap();
		let f = fixture(vec![], |_| {});
		let err = f.registry.add_project(temp.path()).await.unwrap_err();
		assert!(matches!(err, CoreError::NotAGitRepository(_)));
	}

	#[tokio::test]
	async fn unresolvable_executable_leaves_session_untouched() {
		let repo = init_repo();
		let config = CoreConfig::default();
		let bridge = ScriptedBridge::with(vec![]);
		let registry = SessionRegistry::new(
			&config,
			ProviderRegistry::from_config(&config.provider),
			bridge.clone(),
			resolver(None),
		);
		let project = registry.add_project(repo.path()).await.unwrap();
		let session = registry.create_session(&project.id, "s", None).await.unwrap();

		let err = registry.send(&session.id, "hi").await.unwrap_err();
		assert!(matches!(err, CoreError::ExecutableNotFound { ref name } if name == "claude"));
		let session = registry.get_session(&session.id).unwrap();
		assert_eq!(session.state, SessionState::Idle);
		assert!(session.messages.is_empty());
		assert!(bridge.calls().is_empty());
	}
}
