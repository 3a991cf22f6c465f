// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::SessionState;

#[derive(Debug, Error)]
pub enum CoreError {
	#[error("executable not found: {name}")]
	ExecutableNotFound { name: String },

	#[error("runtime '{runtime}' required by {script} not found")]
	RuntimeNotFound { runtime: String, script: PathBuf },

	#[error("execution failed: {0}")]
	ExecutionFailed(String),

	#[error("invalid response: {0}")]
	InvalidResponse(String),

	#[error("not a git repository: {0}")]
	NotAGitRepository(PathBuf),

	#[error("worktree creation failed: {0}")]
	WorktreeCreationFailed(String),

	#[error("session not found: {0}")]
	SessionNotFound(String),

	#[error("project not found: {0}")]
	ProjectNotFound(String),

	#[error("invalid session transition: {from} -> {to}")]
	InvalidTransition { from: SessionState, to: SessionState },

	#[error("invocation cancelled")]
	Cancelled,

	#[error("git {args:?} failed: {stderr}")]
	Git { args: Vec<String>, stderr: String },

	#[error("git not found in PATH")]
	GitNotInstalled,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Config(#[from] ConfigError),
}

impl CoreError {
	/// Only provider-side execution failures are worth resending.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::ExecutionFailed(_))
	}

	/// Short machine-readable code for UI consumption.
	pub fn code(&self) -> &'static str {
		match self {
			Self::ExecutableNotFound { .. } => "executable_not_found",
			Self::RuntimeNotFound { .. } => "runtime_not_found",
			Self::ExecutionFailed(_) => "execution_failed",
			Self::InvalidResponse(_) => "invalid_response",
			Self::NotAGitRepository(_) => "not_a_git_repository",
			Self::WorktreeCreationFailed(_) => "worktree_creation_failed",
			Self::SessionNotFound(_) => "session_not_found",
			Self::ProjectNotFound(_) => "project_not_found",
			Self::InvalidTransition { .. } => "invalid_transition",
			Self::Cancelled => "cancelled",
			Self::Git { .. } => "git_failed",
			Self::GitNotInstalled => "git_not_installed",
			Self::Io(_) => "io",
			Self::Config(_) => "config",
		}
	}
}

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// I/O error reading config file
	#[error("I/O error reading {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// TOML parsing error
	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	/// Invalid value
	#[error("Invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },

	/// Home directory not found
	#[error("Could not determine home directory")]
	HomeDirNotFound,
}

impl ConfigError {
	pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InvalidValue {
			field: field.into(),
			message: message.into(),
		}
	}
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
