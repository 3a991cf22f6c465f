// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Non-interactive process bridge to the provider executable.
//!
//! One invocation is one request/response exchange. The child runs with piped
//! stdio (no PTY) and both pipes are drained to EOF before the exit status is
//! read. Callers await on the tokio runtime; nothing here blocks a thread.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::error::{CoreError, Result};
use crate::resolver::ResolvedExecutable;

/// Applied over the ambient environment so diagnostics stay off stdout.
pub const FIXED_ENV: &[(&str, &str)] = &[
	("TERM", "xterm-256color"),
	("FORCE_COLOR", "0"),
	("NO_COLOR", "1"),
	("NODE_NO_WARNINGS", "1"),
	("CI", "1"),
];

#[derive(Debug, Clone)]
pub struct Invocation {
	pub program: PathBuf,
	pub args: Vec<String>,
	pub working_dir: PathBuf,
	pub env: BTreeMap<String, String>,
	pub cancel: CancellationToken,
}

impl Invocation {
	pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			working_dir: working_dir.into(),
			env: BTreeMap::new(),
			cancel: CancellationToken::new(),
		}
	}

	/// Build from a resolved executable: its leading args (script path for
	/// interpreted providers) come first and its search path becomes `PATH`.
	pub fn from_resolved(
		resolved: &ResolvedExecutable,
		args: Vec<String>,
		working_dir: impl Into<PathBuf>,
	) -> Self {
		let mut invocation = Self::new(resolved.program.clone(), working_dir);
		invocation.args = resolved.leading_args.iter().cloned().chain(args).collect();
		if let Some(path) = &resolved.search_path {
			invocation
				.env
				.insert("PATH".to_string(), path.to_string_lossy().into_owned());
		}
		invocation
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.insert(key.into(), value.into());
		self
	}

	pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
	pub stdout: Vec<u8>,
	pub stderr: String,
	pub exit_code: Option<i32>,
	pub duration: Duration,
}

#[async_trait]
pub trait ProcessBridge: Send + Sync {
	/// Run to completion and capture both streams.
	async fn invoke(&self, invocation: Invocation) -> Result<ProcessOutput>;

	/// Like [`invoke`](Self::invoke), additionally forwarding each stdout line
	/// to `lines` as it arrives. The returned output still holds all of stdout.
	async fn invoke_streaming(
		&self,
		invocation: Invocation,
		lines: mpsc::Sender<String>,
	) -> Result<ProcessOutput>;
}

/// [`ProcessBridge`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct CommandBridge {
	timeout: Option<Duration>,
	extra_env: BTreeMap<String, String>,
}

impl CommandBridge {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_config(config: &BridgeConfig) -> Self {
		Self {
			timeout: config.timeout_secs.map(Duration::from_secs),
			extra_env: config.env.clone(),
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	fn spawn(&self, invocation: &Invocation) -> Result<Child> {
		let mut cmd = Command::new(&invocation.program);
		cmd.args(&invocation.args)
			.current_dir(&invocation.working_dir)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		for (key, value) in FIXED_ENV {
			cmd.env(key, value);
		}
		for (key, value) in self.extra_env.iter().chain(invocation.env.iter()) {
			cmd.env(key, value);
		}

		debug!(
			program = %invocation.program.display(),
			args = invocation.args.len(),
			cwd = %invocation.working_dir.display(),
			"spawning provider process"
		);

		cmd.spawn().map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				CoreError::ExecutableNotFound {
					name: invocation.program.display().to_string(),
				}
			} else {
				CoreError::Io(e)
			}
		})
	}

	async fn run(
		&self,
		invocation: Invocation,
		lines: Option<mpsc::Sender<String>>,
	) -> Result<ProcessOutput> {
		if invocation.cancel.is_cancelled() {
			return Err(CoreError::Cancelled);
		}

		let started = Instant::now();
		let mut child = self.spawn(&invocation)?;
		let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
			(Some(out), Some(err)) => (out, err),
			_ => {
				kill_and_reap(&mut child).await;
				return Err(CoreError::ExecutionFailed("provider pipes unavailable".into()));
			}
		};

		let outcome = tokio::select! {
			res = collect(&mut child, stdout, stderr, lines.as_ref()) => Outcome::Finished(res),
			_ = invocation.cancel.cancelled() => Outcome::Cancelled,
			_ = deadline(self.timeout) => Outcome::TimedOut,
		};

		let (status, stdout, stderr) = match outcome {
			Outcome::Finished(res) => res?,
			Outcome::Cancelled => {
				debug!(program = %invocation.program.display(), "invocation cancelled, killing process");
				kill_and_reap(&mut child).await;
				return Err(CoreError::Cancelled);
			}
			Outcome::TimedOut => {
				let limit = self.timeout.unwrap_or_default();
				warn!(program = %invocation.program.display(), timeout_ms = limit.as_millis() as u64, "invocation timed out");
				kill_and_reap(&mut child).await;
				return Err(CoreError::ExecutionFailed(format!("timed out after {limit:?}")));
			}
		};

		let duration = started.elapsed();
		let stderr = String::from_utf8_lossy(&stderr).into_owned();
		debug!(
			exit_code = ?status.code(),
			stdout_len = stdout.len(),
			stderr_len = stderr.len(),
			duration_ms = duration.as_millis() as u64,
			"provider process exited"
		);

		if !status.success() {
			return Err(CoreError::ExecutionFailed(failure_detail(status, &stdout, &stderr)));
		}

		Ok(ProcessOutput {
			stdout,
			stderr,
			exit_code: status.code(),
			duration,
		})
	}
}

#[async_trait]
impl ProcessBridge for CommandBridge {
	async fn invoke(&self, invocation: Invocation) -> Result<ProcessOutput> {
		self.run(invocation, None).await
	}

	async fn invoke_streaming(
		&self,
		invocation: Invocation,
		lines: mpsc::Sender<String>,
	) -> Result<ProcessOutput> {
		self.run(invocation, Some(lines)).await
	}
}

enum Outcome {
	Finished(Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
	Cancelled,
	TimedOut,
}

async fn collect(
	child: &mut Child,
	stdout: ChildStdout,
	stderr: ChildStderr,
	lines: Option<&mpsc::Sender<String>>,
) -> Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
	let (out, err) = match lines {
		Some(tx) => tokio::join!(forward_lines(stdout, tx), read_pipe(stderr)),
		None => tokio::join!(read_pipe(stdout), read_pipe(stderr)),
	};
	let status = child.wait().await?;
	Ok((status, out?, err?))
}

async fn read_pipe<R: AsyncRead + Unpin>(mut pipe: R) -> Result<Vec<u8>> {
	let mut buf = Vec::new();
	pipe.read_to_end(&mut buf).await?;
	Ok(buf)
}

/// Forward stdout line by line (lossy UTF-8) while keeping the raw bytes.
/// A dropped receiver stops forwarding but the pipe is still drained.
async fn forward_lines(stdout: ChildStdout, tx: &mpsc::Sender<String>) -> Result<Vec<u8>> {
	let mut reader = BufReader::new(stdout);
	let mut raw = Vec::new();
	let mut line = Vec::new();
	let mut forwarding = true;

	loop {
		line.clear();
		if reader.read_until(b'\n', &mut line).await? == 0 {
			break;
		}
		raw.extend_from_slice(&line);
		if forwarding {
			let text = String::from_utf8_lossy(&line);
			let text = text.trim_end_matches(['\n', '\r']).to_string();
			if tx.send(text).await.is_err() {
				debug!("line receiver dropped, draining remaining output");
				forwarding = false;
			}
		}
	}
	Ok(raw)
}

async fn deadline(timeout: Option<Duration>) {
	match timeout {
		Some(limit) => tokio::time::sleep(limit).await,
		None => std::future::pending().await,
	}
}

async fn kill_and_reap(child: &mut Child) {
	if let Err(e) = child.kill().await {
		warn!(error = %e, "failed to kill provider process");
	}
}

fn failure_detail(status: ExitStatus, stdout: &[u8], stderr: &str) -> String {
	let stderr = stderr.trim();
	if !stderr.is_empty() {
		return stderr.to_string();
	}
	let stdout = String::from_utf8_lossy(stdout);
	let stdout = stdout.trim();
	if !stdout.is_empty() {
		return stdout.to_string();
	}
	match status.code() {
		Some(code) => format!("process exited with status {code}"),
		None => "process terminated by signal".to_string(),
	}
}
