//! Deploy executor
//!
//! Clones or updates the repository, resolves a build command from the
//! repository's build system, and runs it with line-streamed output. The
//! caller bounds the whole execution with a deadline.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

/// Deploy request, decoded from the command payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub build_system: String,
    #[serde(default)]
    pub build_file: String,
    #[serde(default)]
    pub build_cmd: String,
}

/// One line of build output
#[derive(Debug, Clone)]
pub struct LogLine {
    /// "stdout" or "stderr"
    pub stream: String,
    pub line: String,
}

impl LogLine {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            stream: "stdout".to_string(),
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            stream: "stderr".to_string(),
            line: line.into(),
        }
    }
}

/// Result of a completed deploy
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub duration: Duration,
    /// Commit hash actually checked out
    pub commit: String,
}

/// Deploy failures
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("build_system not specified in repository config")]
    MissingBuildSystem,

    #[error("unknown build_system: {0}")]
    UnknownBuildSystem(String),

    #[error("no {0} found")]
    MissingBuildFile(String),

    #[error("{command} exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes deploy commands on behalf of the session
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Run a deploy, streaming output lines onto `logs`. The sender is
    /// dropped when execution finishes.
    async fn execute(
        &self,
        config: &DeployConfig,
        logs: UnboundedSender<LogLine>,
    ) -> Result<DeployOutcome, DeployError>;
}

/// Deployer shelling out to git and the configured build tool
pub struct GitDeployer {
    work_dir: PathBuf,
}

impl GitDeployer {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl Deployer for GitDeployer {
    async fn execute(
        &self,
        config: &DeployConfig,
        logs: UnboundedSender<LogLine>,
    ) -> Result<DeployOutcome, DeployError> {
        let start = Instant::now();

        let repo_dir = if config.path.is_empty() {
            self.work_dir.join(&config.name)
        } else {
            PathBuf::from(&config.path)
        };

        let _ = logs.send(LogLine::stdout(format!("› Deploying {}", config.name)));

        let _ = logs.send(LogLine::stdout("› Cloning/pulling repository..."));
        clone_or_pull(&config.url, &config.branch, &repo_dir, &logs).await?;

        if !config.commit.is_empty() && config.commit != "HEAD" {
            let short: String = config.commit.chars().take(7).collect();
            let _ = logs.send(LogLine::stdout(format!("› Checking out {short}")));
            run_command(&repo_dir, "git", &["checkout", &config.commit], &logs).await?;
        }

        let commit = commit_hash(&repo_dir).await.unwrap_or_default();

        let script = match resolve_command(&repo_dir, config) {
            Ok(script) => script,
            Err(e) => {
                let _ = logs.send(LogLine::stderr(e.to_string()));
                return Err(e);
            }
        };

        let _ = logs.send(LogLine::stdout(format!("› Running: {script}")));
        run_command(&repo_dir, "sh", &["-c", &script], &logs).await?;

        let duration = start.elapsed();
        let _ = logs.send(LogLine::stdout(format!("› Completed in {duration:.1?}")));

        Ok(DeployOutcome { duration, commit })
    }
}

/// Resolve the build command for a repository checkout.
///
/// An explicit `build_cmd` always wins; otherwise the build system picks a
/// convention. Compose projects are namespaced `uruflow-<name>` and
/// dockerfile deploys label their container as managed, which is what the
/// metrics push later keys on.
pub fn resolve_command(repo_dir: &Path, config: &DeployConfig) -> Result<String, DeployError> {
    if !config.build_cmd.is_empty() {
        return Ok(config.build_cmd.clone());
    }

    match config.build_system.as_str() {
        "compose" => {
            let file = if config.build_file.is_empty() {
                find_compose_file(repo_dir)
                    .ok_or_else(|| DeployError::MissingBuildFile("compose file".to_string()))?
            } else {
                config.build_file.clone()
            };
            Ok(format!(
                "docker compose -p uruflow-{} -f {} up -d --build",
                config.name, file
            ))
        }

        "dockerfile" => {
            let container = format!("uruflow-{}", config.name);
            if !config.build_file.is_empty() {
                return Ok(format!(
                    "docker build -f {} -t {} . && docker run -d --name {} --label {}=true {}",
                    config.build_file,
                    config.name,
                    container,
                    crate::docker::MANAGED_LABEL,
                    config.name
                ));
            }
            if !repo_dir.join("Dockerfile").exists() {
                return Err(DeployError::MissingBuildFile("Dockerfile".to_string()));
            }
            Ok(format!(
                "docker build -t {} . && docker run -d --name {} --label {}=true {}",
                config.name,
                container,
                crate::docker::MANAGED_LABEL,
                config.name
            ))
        }

        "makefile" => {
            let file = if config.build_file.is_empty() {
                "Makefile".to_string()
            } else {
                config.build_file.clone()
            };
            if !repo_dir.join(&file).exists() {
                return Err(DeployError::MissingBuildFile(file));
            }
            Ok(format!("make -f {file} deploy"))
        }

        "" => Err(DeployError::MissingBuildSystem),

        other => Err(DeployError::UnknownBuildSystem(other.to_string())),
    }
}

fn find_compose_file(repo_dir: &Path) -> Option<String> {
    for candidate in ["docker-compose.yml", "docker-compose.yaml"] {
        if repo_dir.join(candidate).exists() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn clone_or_pull(
    url: &str,
    branch: &str,
    repo_dir: &Path,
    logs: &UnboundedSender<LogLine>,
) -> Result<(), DeployError> {
    if !repo_dir.join(".git").exists() {
        let parent = repo_dir.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        let dir_name = repo_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return run_command(
            parent,
            "git",
            &["clone", "-b", branch, "--single-branch", url, &dir_name],
            logs,
        )
        .await;
    }

    run_command(repo_dir, "git", &["fetch", "origin"], logs).await?;
    run_command(
        repo_dir,
        "git",
        &["reset", "--hard", &format!("origin/{branch}")],
        logs,
    )
    .await
}

async fn commit_hash(repo_dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command with both pipes line-streamed onto `logs`. The child is
/// killed if the future is dropped, which is how the deploy deadline
/// terminates a runaway build.
async fn run_command(
    dir: &Path,
    program: &str,
    args: &[&str],
    logs: &UnboundedSender<LogLine>,
) -> Result<(), DeployError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_task = stdout.map(|pipe| {
        let logs = logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = logs.send(LogLine::stdout(line));
            }
        })
    });
    let err_task = stderr.map(|pipe| {
        let logs = logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = logs.send(LogLine::stderr(line));
            }
        })
    });

    let status = child.wait().await?;
    if let Some(task) = out_task {
        let _ = task.await;
    }
    if let Some(task) = err_task {
        let _ = task.await;
    }

    if !status.success() {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        return Err(DeployError::CommandFailed {
            command,
            code: status.code().unwrap_or(-1),
        });
    }

    Ok(())
}
