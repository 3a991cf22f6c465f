// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Provider executable and script-runtime lookup.
//!
//! GUI-launched processes rarely inherit the user's login `PATH`, so lookup
//! walks an ordered list of well-known install directories, then the ambient
//! `PATH`, then asks the user's login shell. A provider installed as a symlink
//! to a JavaScript entry point is launched through its runtime with the script
//! as the first argument.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{CoreError, Result};

const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];
const NODE_RUNTIME: &str = "node";

/// A launchable program plus the arguments that must precede provider args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutable {
	pub program: PathBuf,
	pub leading_args: Vec<String>,
	/// `PATH` to hand to the child so its own lookups see the same directories.
	pub search_path: Option<OsString>,
}

impl ResolvedExecutable {
	pub fn direct(program: PathBuf) -> Self {
		Self {
			program,
			leading_args: Vec::new(),
			search_path: None,
		}
	}
}

/// Last-resort lookup through an interactive environment.
pub trait ShellLookup: Send + Sync {
	fn lookup(&self, name: &str) -> Option<PathBuf>;
}

/// Asks `$SHELL -l -c 'command -v <name>'`.
pub struct LoginShellLookup;

impl ShellLookup for LoginShellLookup {
	fn lookup(&self, name: &str) -> Option<PathBuf> {
		if !is_plain_program_name(name) {
			warn!(name, "refusing shell lookup for unusual program name");
			return None;
		}

		let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
		let output = Command::new(&shell)
			.args(["-l", "-c", &format!("command -v {name}")])
			.output()
			.ok()?;
		if !output.status.success() {
			debug!(name, shell = %shell, "login shell lookup found nothing");
			return None;
		}

		String::from_utf8_lossy(&output.stdout)
			.lines()
			.map(str::trim)
			.find(|line| line.starts_with('/'))
			.map(PathBuf::from)
			.filter(|p| is_executable(p))
	}
}

/// Shell lookup that never finds anything.
pub struct NoShellLookup;

impl ShellLookup for NoShellLookup {
	fn lookup(&self, _name: &str) -> Option<PathBuf> {
		None
	}
}

pub struct ExecutableResolver {
	explicit: Option<PathBuf>,
	candidate_dirs: Vec<PathBuf>,
	runtime_dirs: Vec<PathBuf>,
	ambient_path: Option<OsString>,
	shell: Box<dyn ShellLookup>,
}

impl ExecutableResolver {
	pub fn new(candidate_dirs: Vec<PathBuf>) -> Self {
		Self {
			explicit: None,
			candidate_dirs,
			runtime_dirs: default_runtime_dirs(),
			ambient_path: std::env::var_os("PATH"),
			shell: Box::new(LoginShellLookup),
		}
	}

	pub fn from_config(config: &ProviderConfig) -> Self {
		let mut candidates = default_candidate_dirs();
		candidates.extend(config.extra_search_dirs.iter().cloned());
		let mut resolver = Self::new(candidates);
		resolver.explicit = config.executable.clone();
		resolver
	}

	pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
		self.explicit = path;
		self
	}

	pub fn with_runtime_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
		self.runtime_dirs = dirs;
		self
	}

	pub fn with_ambient_path(mut self, path: Option<OsString>) -> Self {
		self.ambient_path = path;
		self
	}

	pub fn with_shell_lookup(mut self, shell: Box<dyn ShellLookup>) -> Self {
		self.shell = shell;
		self
	}

	/// Resolve `name` to something launchable.
	pub fn resolve(&self, name: &str) -> Result<ResolvedExecutable> {
		let found = match &self.explicit {
			Some(path) if is_executable(path) => Some(path.clone()),
			Some(path) => {
				warn!(path = %path.display(), "configured executable is not executable, searching");
				None
			}
			None => None,
		};

		let found = found
			.or_else(|| find_in_dirs(name, &self.candidate_dirs))
			.or_else(|| find_on_path(name, self.ambient_path.as_ref()))
			.or_else(|| self.shell.lookup(name))
			.ok_or_else(|| CoreError::ExecutableNotFound {
				name: name.to_string(),
			})?;

		info!(name, path = %found.display(), "resolved provider executable");

		let Some((runtime, script)) = script_runtime(&found) else {
			let search_path = self.search_path(found.parent());
			return Ok(ResolvedExecutable {
				program: found,
				leading_args: Vec::new(),
				search_path,
			});
		};

		let runtime_path = self.resolve_runtime(runtime).ok_or_else(|| CoreError::RuntimeNotFound {
			runtime: runtime.to_string(),
			script: script.clone(),
		})?;

		info!(
			runtime = %runtime_path.display(),
			script = %script.display(),
			"provider is a script, launching through runtime"
		);

		Ok(ResolvedExecutable {
			search_path: self.search_path(runtime_path.parent()),
			program: runtime_path,
			leading_args: vec![script.to_string_lossy().into_owned()],
		})
	}

	fn resolve_runtime(&self, runtime: &str) -> Option<PathBuf> {
		let mut dirs = self.candidate_dirs.clone();
		dirs.extend(self.runtime_dirs.iter().cloned());

		find_in_dirs(runtime, &dirs)
			.or_else(|| {
				let extended = extend_path(self.ambient_path.as_ref(), &self.runtime_dirs);
				find_on_path(runtime, extended.as_ref())
			})
			.or_else(|| self.shell.lookup(runtime))
	}

	fn search_path(&self, program_dir: Option<&Path>) -> Option<OsString> {
		let mut extra: Vec<PathBuf> = program_dir.map(Path::to_path_buf).into_iter().collect();
		extra.extend(self.runtime_dirs.iter().filter(|d| d.is_dir()).cloned());
		extend_path(self.ambient_path.as_ref(), &extra)
	}
}

/// Detect a symlink to an interpreted script. Returns the runtime name and
/// the absolute script path.
pub fn script_runtime(path: &Path) -> Option<(&'static str, PathBuf)> {
	let meta = std::fs::symlink_metadata(path).ok()?;
	if !meta.file_type().is_symlink() {
		return None;
	}

	let target = std::fs::read_link(path).ok()?;
	let target = if target.is_absolute() {
		target
	} else {
		path.parent().unwrap_or_else(|| Path::new("/")).join(target)
	};
	let target = std::fs::canonicalize(&target).unwrap_or(target);

	let by_extension = target
		.extension()
		.and_then(|e| e.to_str())
		.map(|e| SCRIPT_EXTENSIONS.contains(&e))
		.unwrap_or(false);

	if by_extension || shebang_names_node(&target) {
		Some((NODE_RUNTIME, target))
	} else {
		None
	}
}

fn shebang_names_node(path: &Path) -> bool {
	use std::io::{BufRead, BufReader};

	let Ok(file) = std::fs::File::open(path) else {
		return false;
	};
	let mut first = String::new();
	if BufReader::new(file).read_line(&mut first).is_err() {
		return false;
	}
	let Some(interp) = first.strip_prefix("#!") else {
		return false;
	};
	interp
		.split_whitespace()
		.any(|part| part == NODE_RUNTIME || part.ends_with("/node"))
}

fn find_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
	dirs.iter().map(|d| d.join(name)).find(|p| {
		let ok = is_executable(p);
		debug!(candidate = %p.display(), found = ok, "checked candidate");
		ok
	})
}

fn find_on_path(name: &str, path: Option<&OsString>) -> Option<PathBuf> {
	let path = path?;
	let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
	which::which_in(name, Some(path), cwd).ok()
}

fn extend_path(ambient: Option<&OsString>, extra: &[PathBuf]) -> Option<OsString> {
	let mut entries: Vec<PathBuf> = ambient
		.map(|p| std::env::split_paths(p).collect())
		.unwrap_or_default();
	for dir in extra {
		if !entries.contains(dir) {
			entries.push(dir.clone());
		}
	}
	if entries.is_empty() {
		return None;
	}
	std::env::join_paths(entries).ok()
}

fn is_executable(path: &Path) -> bool {
	let Ok(meta) = std::fs::metadata(path) else {
		return false;
	};
	if !meta.is_file() {
		return false;
	}
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		meta.permissions().mode() & 0o111 != 0
	}
	#[cfg(not(unix))]
	{
		true
	}
}

fn is_plain_program_name(name: &str) -> bool {
	!name.is_empty()
		&& name
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Ordered install locations for the provider CLI.
pub fn default_candidate_dirs() -> Vec<PathBuf> {
	let mut candidates = Vec::new();
	if let Some(home) = dirs::home_dir() {
		candidates.push(home.join(".local/bin"));
		candidates.push(home.join(".claude/local"));
		candidates.push(home.join(".npm-global/bin"));
	}
	candidates.push(PathBuf::from("/opt/homebrew/bin"));
	candidates.push(PathBuf::from("/usr/local/bin"));
	candidates.push(PathBuf::from("/usr/bin"));
	candidates
}

/// Runtime-manager install directories, newest node version first.
pub fn default_runtime_dirs() -> Vec<PathBuf> {
	let Some(home) = dirs::home_dir() else {
		return Vec::new();
	};

	let mut managers = vec![home.join(".volta/bin")];
	managers.extend(nvm_bin_dirs(&home.join(".nvm/versions/node")));
	managers.push(home.join(".local/share/fnm/aliases/default/bin"));
	managers.push(home.join(".bun/bin"));
	managers.push(home.join(".asdf/shims"));
	managers.push(home.join(".local/share/mise/shims"));
	managers
}

fn nvm_bin_dirs(versions_dir: &Path) -> Vec<PathBuf> {
	let Ok(entries) = std::fs::read_dir(versions_dir) else {
		return Vec::new();
	};

	let mut versions: Vec<(Vec<u64>, PathBuf)> = entries
		.filter_map(|e| e.ok())
		.filter_map(|e| {
			let name = e.file_name().to_string_lossy().into_owned();
			let parts = name
				.trim_start_matches('v')
				.split('.')
				.map(|p| p.parse::<u64>().ok())
				.collect::<Option<Vec<_>>>()?;
			Some((parts, e.path().join("bin")))
		})
		.collect();
	versions.sort_by(|a, b| b.0.cmp(&a.0));
	versions.into_iter().map(|(_, dir)| dir).collect()
}
