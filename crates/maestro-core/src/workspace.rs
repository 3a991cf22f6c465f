// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Per-project git worktree and per-session branch management.
//!
//! Each project gets one worktree at a fixed directory beneath its root. Every
//! session owns a branch; the worktree is switched to that branch before the
//! session's provider runs. Uncommitted state is stashed per branch on switch,
//! so one session never observes another's dirty files. All callers must hold
//! the workspace lock from [`WorkspaceLocks`] around these operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use crate::config::WorkspaceConfig;
use crate::error::{CoreError, Result};

/// Stash message prefix; the branch name follows it.
pub const STASH_PREFIX: &str = "maestro-session:";

const MAX_SLUG_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
	dir_name: PathBuf,
	branch_prefix: String,
}

impl WorkspaceManager {
	pub fn new(config: &WorkspaceConfig) -> Self {
		Self {
			dir_name: config.dir_name.clone(),
			branch_prefix: config.branch_prefix.clone(),
		}
	}

	pub fn workspace_path(&self, project: &Path) -> PathBuf {
		project.join(&self.dir_name)
	}

	/// `<prefix><slug(name)>-<first 8 of id>`; stable for a given session.
	pub fn branch_name(&self, session_id: &str, name: &str) -> String {
		let short: String = session_id
			.chars()
			.filter(|c| c.is_ascii_alphanumeric())
			.take(8)
			.collect();
		format!("{}{}-{}", self.branch_prefix, slug(name), short)
	}

	/// Ensure the project's worktree exists and return its path.
	///
	/// Idempotent: a valid registered worktree is reused. A registration whose
	/// directory vanished is pruned and recreated.
	pub async fn create_workspace(&self, project: &Path) -> Result<PathBuf> {
		if !project.join(".git").exists() {
			return Err(CoreError::NotAGitRepository(project.to_path_buf()));
		}
		let project = tokio::fs::canonicalize(project).await?;
		let workspace = self.workspace_path(&project);

		let registered = registered_worktrees(&project)
			.await
			.map_err(worktree_failure)?;
		let is_registered = registered.iter().any(|p| same_path(p, &workspace));

		if is_registered && workspace.join(".git").exists() {
			debug!(path = %workspace.display(), "reusing existing worktree");
			self.ensure_excluded(&project).await?;
			return Ok(workspace);
		}

		if is_registered {
			warn!(path = %workspace.display(), "pruning stale worktree registration");
			run_git(&project, &["worktree", "prune"])
				.await
				.map_err(worktree_failure)?;
		}

		if workspace.exists() {
			warn!(path = %workspace.display(), "removing unregistered worktree directory");
			tokio::fs::remove_dir_all(&workspace).await?;
		}

		let target = workspace.to_string_lossy().into_owned();
		run_git(&project, &["worktree", "add", "--detach", &target, "HEAD"])
			.await
			.map_err(worktree_failure)?;
		self.ensure_excluded(&project).await?;

		info!(project = %project.display(), path = %workspace.display(), "created worktree");
		Ok(workspace)
	}

	/// Create the session's branch from the project's `HEAD` if missing, and
	/// check it out in the worktree. On checkout failure a freshly created
	/// branch is removed again.
	pub async fn create_session_branch(
		&self,
		project: &Path,
		session_id: &str,
		name: &str,
	) -> Result<String> {
		let workspace = self.workspace_path(project);
		let branch = self.branch_name(session_id, name);

		let created = if branch_exists(&workspace, &branch).await {
			false
		} else {
			let base = run_git(project, &["rev-parse", "HEAD"]).await?;
			run_git(&workspace, &["branch", &branch, &base]).await?;
			true
		};

		if let Err(e) = self.switch_branch(&workspace, &branch).await {
			if created {
				let _ = run_git(&workspace, &["branch", "-D", &branch]).await;
			}
			return Err(e);
		}

		debug!(session_id = %session_id, branch = %branch, "session branch ready");
		Ok(branch)
	}

	/// Name of the branch checked out in `workspace`, `None` when detached.
	pub async fn current_branch(&self, workspace: &Path) -> Result<Option<String>> {
		match run_git(workspace, &["symbolic-ref", "--quiet", "--short", "HEAD"]).await {
			Ok(name) if !name.is_empty() => Ok(Some(name)),
			// --quiet: a detached HEAD exits non-zero without output
			Ok(_) => Ok(None),
			Err(CoreError::Git { ref stderr, .. }) if stderr.is_empty() => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Check out `branch`, parking uncommitted work of the previous branch in a
	/// labelled stash and restoring the target branch's stash if one exists.
	pub async fn switch_branch(&self, workspace: &Path, branch: &str) -> Result<()> {
		let current = self.current_branch(workspace).await?;
		if current.as_deref() == Some(branch) {
			return Ok(());
		}

		let stashed = if is_dirty(workspace).await? {
			let label = format!("{STASH_PREFIX}{}", current.as_deref().unwrap_or("detached"));
			run_git(workspace, &["stash", "push", "--include-untracked", "-m", &label]).await?;
			debug!(path = %workspace.display(), stash = %label, "stashed uncommitted changes");
			true
		} else {
			false
		};

		if let Err(e) = run_git(workspace, &["checkout", branch]).await {
			if stashed {
				let _ = run_git(workspace, &["stash", "pop"]).await;
			}
			return Err(e);
		}

		if let Some(stash) = find_stash(workspace, branch).await? {
			run_git(workspace, &["stash", "pop", &stash]).await?;
			debug!(path = %workspace.display(), branch = %branch, "restored stashed changes");
		}

		trace!(path = %workspace.display(), branch = %branch, "switched branch");
		Ok(())
	}

	/// Remove a session branch and any stash parked for it. Missing branches
	/// are not an error.
	pub async fn delete_session_branch(&self, workspace: &Path, branch: &str) -> Result<()> {
		if !workspace.join(".git").exists() {
			debug!(path = %workspace.display(), branch = %branch, "worktree gone, nothing to delete");
			return Ok(());
		}
		if self.current_branch(workspace).await?.as_deref() == Some(branch) {
			if is_dirty(workspace).await? {
				let label = format!("{STASH_PREFIX}{branch}");
				run_git(workspace, &["stash", "push", "--include-untracked", "-m", &label]).await?;
			}
			run_git(workspace, &["checkout", "--detach"]).await?;
		}

		while let Some(stash) = find_stash(workspace, branch).await? {
			run_git(workspace, &["stash", "drop", &stash]).await?;
		}

		if branch_exists(workspace, branch).await {
			run_git(workspace, &["branch", "-D", branch]).await?;
			debug!(branch = %branch, "deleted session branch");
		}
		Ok(())
	}

	/// Remove the worktree registration and its directory.
	pub async fn destroy_workspace(&self, project: &Path) -> Result<()> {
		let workspace = self.workspace_path(project);
		let target = workspace.to_string_lossy().into_owned();

		if workspace.exists() {
			if let Err(e) = run_git(project, &["worktree", "remove", "--force", &target]).await {
				warn!(path = %workspace.display(), error = %e, "git worktree remove failed, deleting directory");
			}
		}
		if workspace.exists() {
			tokio::fs::remove_dir_all(&workspace).await?;
		}
		run_git(project, &["worktree", "prune"]).await?;

		info!(project = %project.display(), "destroyed worktree");
		Ok(())
	}

	async fn ensure_excluded(&self, project: &Path) -> Result<()> {
		let common = run_git(project, &["rev-parse", "--git-common-dir"]).await?;
		let common = PathBuf::from(common);
		let common = if common.is_absolute() {
			common
		} else {
			project.join(common)
		};

		let info_dir = common.join("info");
		tokio::fs::create_dir_all(&info_dir).await?;
		let exclude = info_dir.join("exclude");

		let entry = format!("/{}/", self.dir_name.to_string_lossy().replace('\\', "/"));
		let existing = match tokio::fs::read_to_string(&exclude).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
			Err(e) => return Err(e.into()),
		};
		if existing.lines().any(|line| line.trim() == entry) {
			return Ok(());
		}

		let mut updated = existing;
		if !updated.is_empty() && !updated.ends_with('\n') {
			updated.push('\n');
		}
		updated.push_str(&entry);
		updated.push('\n');
		tokio::fs::write(&exclude, updated).await?;
		debug!(path = %exclude.display(), entry = %entry, "excluded worktree directory");
		Ok(())
	}
}

/// One async mutex per workspace directory.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
	locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceLocks {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
		let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		locks
			.entry(path.to_path_buf())
			.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
			.clone()
	}

	pub fn forget(&self, path: &Path) {
		let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		locks.remove(path);
	}
}

/// Lowercase ASCII slug: runs of other characters become one dash.
pub fn slug(name: &str) -> String {
	let mut out = String::with_capacity(name.len());
	for c in name.chars() {
		if c.is_ascii_alphanumeric() {
			out.push(c.to_ascii_lowercase());
		} else if !out.ends_with('-') {
			out.push('-');
		}
	}
	let trimmed: String = out.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
	let trimmed = trimmed.trim_end_matches('-');
	if trimmed.is_empty() {
		"session".to_string()
	} else {
		trimmed.to_string()
	}
}

/// Runs a git command in `path` and returns trimmed stdout on success.
pub(crate) async fn run_git(path: &Path, args: &[&str]) -> Result<String> {
	let mut cmd = Command::new("git");
	cmd.arg("-C").arg(path).args(args);

	trace!(
		cmd = %format!("git -C {} {}", path.display(), args.join(" ")),
		"running git command"
	);

	let output = cmd.output().await.map_err(|e| {
		if e.kind() == std::io::ErrorKind::NotFound {
			warn!("git not found in PATH");
			CoreError::GitNotInstalled
		} else {
			CoreError::Io(e)
		}
	})?;

	if output.status.success() {
		Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
	} else {
		Err(CoreError::Git {
			args: args.iter().map(|s| s.to_string()).collect(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		})
	}
}

fn worktree_failure(err: CoreError) -> CoreError {
	match err {
		CoreError::Git { stderr, .. } => CoreError::WorktreeCreationFailed(stderr),
		other => other,
	}
}

async fn registered_worktrees(project: &Path) -> Result<Vec<PathBuf>> {
	let output = run_git(project, &["worktree", "list", "--porcelain"]).await?;
	Ok(output
		.lines()
		.filter_map(|line| line.strip_prefix("worktree "))
		.map(PathBuf::from)
		.collect())
}

async fn branch_exists(workspace: &Path, branch: &str) -> bool {
	let reference = format!("refs/heads/{branch}");
	run_git(workspace, &["rev-parse", "--verify", "--quiet", &reference])
		.await
		.is_ok()
}

async fn is_dirty(workspace: &Path) -> Result<bool> {
	let status = run_git(workspace, &["status", "--porcelain"]).await?;
	Ok(!status.is_empty())
}

/// Stash reference (`stash@{n}`) parked for `branch`, if any.
async fn find_stash(workspace: &Path, branch: &str) -> Result<Option<String>> {
	let list = run_git(workspace, &["stash", "list", "--format=%gd %s"]).await?;
	let wanted = format!("{STASH_PREFIX}{branch}");
	Ok(list.lines().find_map(|line| {
		let (reference, subject) = line.split_once(' ')?;
		let message = subject.rsplit_once(": ").map_or(subject, |(_, m)| m);
		(message == wanted).then(|| reference.to_string())
	}))
}

fn same_path(a: &Path, b: &Path) -> bool {
	normalize(a) == normalize(b)
}

fn normalize(path: &Path) -> PathBuf {
	if let Ok(p) = std::fs::canonicalize(path) {
		return p;
	}
	match (path.parent(), path.file_name()) {
		(Some(parent), Some(name)) => std::fs::canonicalize(parent)
			.map(|p| p.join(name))
			.unwrap_or_else(|_| path.to_path_buf()),
		_ => path.to_path_buf(),
	}
}
