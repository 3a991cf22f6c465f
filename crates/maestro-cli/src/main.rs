// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use maestro_core::lifecycle::StepKind;
use maestro_core::{
	CoreConfig, ExecutableResolver, Isolation, ProviderRegistry, SessionEvent, SessionRegistry,
	WorkspaceManager,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Maestro - run a coding assistant CLI inside isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "maestro", version)]
struct Args {
	/// Config file (defaults to $XDG_CONFIG_HOME/maestro/config.toml)
	#[arg(long, env = "MAESTRO_CONFIG", global = true)]
	config: Option<PathBuf>,

	/// Print machine-readable JSON lines on stdout
	#[arg(long, global = true)]
	json: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Check that the provider executable and git can be found
	Doctor,

	/// Send one message in a fresh session
	Send {
		/// Project repository
		#[arg(long, default_value = ".")]
		project: PathBuf,

		/// Session name, used for the branch name
		#[arg(long, default_value = "cli")]
		name: String,

		/// Provider id (defaults to the configured provider)
		#[arg(long)]
		provider: Option<String>,

		message: String,
	},

	/// Manage a project's worktree
	Worktree {
		#[command(subcommand)]
		action: WorktreeAction,
	},
}

#[derive(Subcommand, Debug)]
enum WorktreeAction {
	/// Create the worktree, or print the existing one
	Create { path: PathBuf },
	/// Remove the worktree and its registration
	Destroy { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
	// stdout carries replies; logs go to stderr
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let config = load_config(args.config.as_deref())?;

	match args.command {
		Command::Doctor => doctor(&config, args.json).await,
		Command::Send {
			project,
			name,
			provider,
			message,
		} => send(config, &project, &name, provider.as_deref(), &message, args.json).await,
		Command::Worktree { action } => worktree(&config, action, args.json).await,
	}
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig> {
	let config = CoreConfig::load(path).context("loading configuration")?;
	info!(
		provider = %config.provider.default,
		on_failure = ?config.workspace.on_failure,
		"configuration loaded"
	);
	Ok(config)
}

async fn doctor(config: &CoreConfig, json: bool) -> Result<()> {
	let providers = ProviderRegistry::from_config(&config.provider);
	let resolver = Arc::new(ExecutableResolver::from_config(&config.provider));
	let mut healthy = true;

	for id in providers.ids() {
		let Some(provider) = providers.get(&id) else {
			continue;
		};
		let name = provider.executable_name().to_string();
		// may spawn a login shell
		let resolution = {
			let resolver = Arc::clone(&resolver);
			tokio::task::spawn_blocking(move || resolver.resolve(&name))
				.await
				.context("resolver task panicked")?
		};

		match resolution {
			Ok(resolved) => emit(
				json,
				serde_json::json!({
					"check": "provider",
					"provider": id,
					"ok": true,
					"program": resolved.program,
					"leadingArgs": resolved.leading_args,
				}),
				&format!(
					"ok    provider {id}: {} {}",
					resolved.program.display(),
					resolved.leading_args.join(" ")
				),
			),
			Err(e) => {
				healthy = false;
				emit(
					json,
					serde_json::json!({"check": "provider", "provider": id, "ok": false, "error": e.to_string(), "code": e.code()}),
					&format!("FAIL  provider {id}: {e}"),
				);
			}
		}
	}

	match tokio::process::Command::new("git").arg("--version").output().await {
		Ok(out) if out.status.success() => {
			let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
			emit(
				json,
				serde_json::json!({"check": "git", "ok": true, "version": version}),
				&format!("ok    {version}"),
			);
		}
		Ok(out) => {
			healthy = false;
			let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
			emit(
				json,
				serde_json::json!({"check": "git", "ok": false, "error": stderr}),
				&format!("FAIL  git: {stderr}"),
			);
		}
		Err(e) => {
			healthy = false;
			emit(
				json,
				serde_json::json!({"check": "git", "ok": false, "error": e.to_string()}),
				&format!("FAIL  git: {e}"),
			);
		}
	}

	if !healthy {
		bail!("doctor found problems");
	}
	Ok(())
}

async fn send(
	config: CoreConfig,
	project: &Path,
	name: &str,
	provider: Option<&str>,
	message: &str,
	json: bool,
) -> Result<()> {
	let registry = Arc::new(SessionRegistry::from_config(&config));

	let project = registry
		.add_project(project)
		.await
		.with_context(|| format!("adding project {}", project.display()))?;
	if let Isolation::Degraded { reason } = &project.isolation {
		warn!(reason = %reason, "running without worktree isolation");
	}

	let session = registry
		.create_session(&project.id, name, provider)
		.await
		.context("creating session")?;
	info!(session_id = %session.id, branch = ?session.branch, "session ready");

	let mut events = registry.subscribe();
	let printer = tokio::spawn(async move {
		while let Ok(event) = events.recv().await {
			render_event(&event, json);
		}
	});

	let outcome = tokio::select! {
		res = registry.send(&session.id, message) => res.map_err(anyhow::Error::from),
		_ = tokio::signal::ctrl_c() => {
			warn!(session_id = %session.id, "interrupted, stopping session");
			if let Err(e) = registry.stop(&session.id).await {
				warn!(error = %e, "stop failed");
			}
			Err(anyhow::anyhow!("interrupted"))
		}
	};

	let snapshot = registry.get_session(&session.id).ok();
	// closing the event channel lets the printer drain and exit
	drop(registry);
	let _ = printer.await;

	let reply = outcome.context("provider exchange failed")?;
	if json {
		println!("{}", serde_json::to_string(&reply)?);
	} else {
		println!("{}", reply.content);
		if let Some(session) = snapshot {
			if let Some(token) = session.provider_token {
				eprintln!("session token: {token}");
			}
		}
	}
	Ok(())
}

async fn worktree(config: &CoreConfig, action: WorktreeAction, json: bool) -> Result<()> {
	let manager = WorkspaceManager::new(&config.workspace);
	match action {
		WorktreeAction::Create { path } => {
			let workspace = manager
				.create_workspace(&path)
				.await
				.with_context(|| format!("creating worktree for {}", path.display()))?;
			emit(
				json,
				serde_json::json!({"worktree": workspace}),
				&workspace.display().to_string(),
			);
		}
		WorktreeAction::Destroy { path } => {
			manager
				.destroy_workspace(&path)
				.await
				.with_context(|| format!("destroying worktree for {}", path.display()))?;
			emit(json, serde_json::json!({"destroyed": path}), "worktree removed");
		}
	}
	Ok(())
}

fn emit(json: bool, value: serde_json::Value, text: &str) {
	if json {
		println!("{value}");
	} else {
		println!("{text}");
	}
}

fn render_event(event: &SessionEvent, json: bool) {
	if json {
		if let Ok(line) = serde_json::to_string(event) {
			println!("{line}");
		}
		return;
	}
	if let Some(line) = describe_event(event) {
		eprintln!("{line}");
	}
}

/// One human-readable line for progress output, if the event warrants one.
fn describe_event(event: &SessionEvent) -> Option<String> {
	match event {
		SessionEvent::StepCompleted { step, .. } => Some(match step.kind {
			StepKind::Thinking => format!("[thinking] {}", first_line(&step.content)),
			StepKind::Text => return None,
			StepKind::ToolCall => {
				let name = step.tool.as_ref().map_or("tool", |t| t.name.as_str());
				match &step.result {
					Some(result) if result.is_error => format!("[tool] {name} failed"),
					Some(_) => format!("[tool] {name}"),
					None => format!("[tool] {name} (interrupted)"),
				}
			}
		}),
		SessionEvent::MessageFailed { detail, .. } => Some(format!("[error] {detail}")),
		SessionEvent::SessionStateChanged { from, to, .. } => Some(format!("[session] {from} -> {to}")),
		_ => None,
	}
}

fn first_line(text: &str) -> &str {
	text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}
