// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Configuration for the session core.
//!
//! Layering, lowest precedence first:
//! - built-in defaults
//! - TOML file (`$XDG_CONFIG_HOME/maestro/config.toml` or an explicit path)
//! - environment variables (`MAESTRO_PROVIDER_BIN`, `MAESTRO_WORKSPACE_ON_FAILURE`)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_PROVIDER_BIN: &str = "MAESTRO_PROVIDER_BIN";
pub const ENV_WORKSPACE_ON_FAILURE: &str = "MAESTRO_WORKSPACE_ON_FAILURE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
	pub provider: ProviderConfig,
	pub workspace: WorkspaceConfig,
	pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
	/// Provider id used for new sessions.
	pub default: String,
	/// Explicit executable path, skips candidate search when set.
	pub executable: Option<PathBuf>,
	/// Extra directories searched before the built-in candidates.
	pub extra_search_dirs: Vec<PathBuf>,
	/// Extra arguments inserted before the message text.
	pub extra_args: Vec<String>,
	/// Request line-delimited output so steps can be folded as they arrive.
	pub streaming: bool,
}

impl Default for ProviderConfig {
	fn default() -> Self {
		Self {
			default: "claude_code".to_string(),
			executable: None,
			extra_search_dirs: Vec::new(),
			extra_args: Vec::new(),
			streaming: true,
		}
	}
}

/// What happens to project addition when the worktree cannot be created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceFailurePolicy {
	/// Project is added without isolation; sessions run in the project root.
	#[default]
	Degrade,
	/// Project addition fails with the worktree error.
	Fail,
}

impl std::str::FromStr for WorkspaceFailurePolicy {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"degrade" => Ok(Self::Degrade),
			"fail" => Ok(Self::Fail),
			other => Err(ConfigError::invalid_value(
				"workspace.on_failure",
				format!("expected 'degrade' or 'fail', got '{other}'"),
			)),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
	/// Worktree location relative to the project root.
	pub dir_name: PathBuf,
	pub branch_prefix: String,
	pub on_failure: WorkspaceFailurePolicy,
}

impl Default for WorkspaceConfig {
	fn default() -> Self {
		Self {
			dir_name: PathBuf::from(".maestro/worktree"),
			branch_prefix: "maestro/".to_string(),
			on_failure: WorkspaceFailurePolicy::Degrade,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
	/// Host-imposed limit per invocation; unset means no limit.
	pub timeout_secs: Option<u64>,
	/// Extra environment layered over the fixed overrides.
	pub env: BTreeMap<String, String>,
	/// Broadcast channel capacity for session events.
	pub event_capacity: Option<usize>,
}

impl CoreConfig {
	/// Load from `path`, or the default user config location when `None`.
	/// A missing file yields defaults; environment overrides are applied last.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let path = match path {
			Some(p) => p.to_path_buf(),
			None => default_config_path()?,
		};

		let mut config = if path.exists() {
			let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
				path: path.clone(),
				source,
			})?;
			Self::from_toml_str(&content).map_err(|source| ConfigError::TomlParse {
				path: path.clone(),
				source,
			})?
		} else {
			tracing::debug!(path = %path.display(), "no config file, using defaults");
			Self::default()
		};

		config.apply_env(|key| std::env::var(key).ok())?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(content)
	}

	/// Apply environment overrides through `lookup` so tests need not touch the process env.
	pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(bin) = lookup(ENV_PROVIDER_BIN).filter(|v| !v.trim().is_empty()) {
			self.provider.executable = Some(PathBuf::from(bin));
		}
		if let Some(policy) = lookup(ENV_WORKSPACE_ON_FAILURE) {
			self.workspace.on_failure = policy.parse()?;
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.workspace.dir_name.as_os_str().is_empty() || self.workspace.dir_name.is_absolute() {
			return Err(ConfigError::invalid_value(
				"workspace.dir_name",
				"must be a non-empty relative path",
			));
		}
		if self.provider.default.trim().is_empty() {
			return Err(ConfigError::invalid_value("provider.default", "must not be empty"));
		}
		if self.bridge.event_capacity == Some(0) {
			return Err(ConfigError::invalid_value(
				"bridge.event_capacity",
				"must be greater than zero",
			));
		}
		Ok(())
	}
}

/// `$XDG_CONFIG_HOME/maestro/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
	let config_home = match std::env::var_os("XDG_CONFIG_HOME") {
		Some(dir) => PathBuf::from(dir),
		None => dirs::home_dir()
			.ok_or(ConfigError::HomeDirNotFound)?
			.join(".config"),
	};
	Ok(config_home.join("maestro").join("config.toml"))
}
