//! Docker-backed workspace. One long-lived container per project, named
//! `yokeflow-<slug>`, with the project directory mounted at /workspace and
//! resource caps from the sandbox config.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, StopContainerOptions,
};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::errors::{YokeError, YokeResult};
use crate::store::models::SessionType;

use super::{ExecOutcome, Workspace, WorkspaceStatus};

/// Residual dev-server processes killed before a coding session reuses a
/// container.
const RESIDUAL_SERVER_NAMES: &[&str] = &["node", "vite", "next-server", "webpack", "uvicorn", "flask"];

pub struct DockerWorkspace {
    docker: Docker,
    container_name: String,
}

fn sandbox_err(context: &str, err: impl std::fmt::Display) -> YokeError {
    YokeError::Sandbox(format!("{context}: {err}"))
}

/// `yokeflow-<slug>`: lowercase, runs of non-alphanumerics collapsed to `-`.
pub fn container_name(project_name: &str) -> String {
    let mut slug = String::with_capacity(project_name.len());
    let mut last_dash = false;
    for c in project_name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-');
    format!("yokeflow-{}", slug)
}

/// Parse a memory limit string like "3g" or "512m" into bytes.
pub fn parse_memory_limit(s: &str) -> YokeResult<i64> {
    let s = s.trim().to_lowercase();
    if let Some(num) = s.strip_suffix('g') {
        let n: f64 = num
            .parse()
            .map_err(|_| YokeError::Validation(format!("invalid memory limit: {s}")))?;
        Ok((n * 1_073_741_824.0) as i64)
    } else if let Some(num) = s.strip_suffix('m') {
        let n: f64 = num
            .parse()
            .map_err(|_| YokeError::Validation(format!("invalid memory limit: {s}")))?;
        Ok((n * 1_048_576.0) as i64)
    } else {
        s.parse::<i64>()
            .map_err(|_| YokeError::Validation(format!("invalid memory limit: {s} (use '3g' or '512m')")))
    }
}

impl DockerWorkspace {
    /// Handle to an existing (or absent) container by project name, without
    /// creating anything. Used for stop/remove outside a session.
    pub async fn open(project_name: &str) -> YokeResult<Self> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| sandbox_err("failed to connect to Docker", e))?;
        docker
            .ping()
            .await
            .map_err(|e| sandbox_err("Docker daemon unreachable", e))?;
        Ok(Self {
            docker,
            container_name: container_name(project_name),
        })
    }

    /// Acquire the container for a project.
    ///
    /// Initializer sessions remove any existing container and start fresh
    /// with the setup script run; coding and review sessions reuse a
    /// running container (after killing residual dev servers), start a
    /// stopped one, or create one when missing.
    pub async fn acquire(
        project_name: &str,
        workspace_dir: &Path,
        session_type: SessionType,
        config: &SandboxConfig,
    ) -> YokeResult<Self> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| sandbox_err("failed to connect to Docker", e))?;
        docker
            .ping()
            .await
            .map_err(|e| sandbox_err("Docker daemon unreachable", e))?;

        let workspace = Self {
            docker,
            container_name: container_name(project_name),
        };

        let existing = workspace
            .docker
            .inspect_container(&workspace.container_name, None)
            .await
            .ok();

        match session_type {
            SessionType::Initializer => {
                if existing.is_some() {
                    workspace.remove_container().await?;
                }
                workspace.create_container(workspace_dir, config).await?;
                workspace.run_setup_script().await;
            }
            _ => match existing {
                Some(inspect) => {
                    let running = inspect
                        .state
                        .as_ref()
                        .and_then(|s| s.running)
                        .unwrap_or(false);
                    if !running {
                        workspace
                            .docker
                            .start_container(&workspace.container_name, None::<StartContainerOptions>)
                            .await
                            .map_err(|e| sandbox_err("failed to start container", e))?;
                    }
                    workspace.kill_residual_servers().await;
                }
                None => {
                    workspace.create_container(workspace_dir, config).await?;
                    workspace.run_setup_script().await;
                }
            },
        }

        Ok(workspace)
    }

    async fn create_container(&self, workspace_dir: &Path, config: &SandboxConfig) -> YokeResult<()> {
        self.ensure_image(&config.image).await?;

        let mounts = vec![Mount {
            target: Some("/workspace".to_string()),
            source: Some(workspace_dir.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];

        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: Some(parse_memory_limit(&config.memory_limit)?),
            nano_cpus: Some((config.cpu_limit * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert("yokeflow.workspace".to_string(), "true".to_string());
        labels.insert("yokeflow.container".to_string(), self.container_name.clone());

        let container_config = ContainerCreateBody {
            image: Some(config.image.clone()),
            // Keep the container alive between execs.
            cmd: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_opts = CreateContainerOptions {
            name: Some(self.container_name.clone()),
            platform: String::new(),
        };
        self.docker
            .create_container(Some(create_opts), container_config)
            .await
            .map_err(|e| sandbox_err("failed to create container", e))?;
        self.docker
            .start_container(&self.container_name, None::<StartContainerOptions>)
            .await
            .map_err(|e| sandbox_err("failed to start container", e))?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> YokeResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let opts = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| sandbox_err("failed to pull image", e))?;
        }
        Ok(())
    }

    /// Toolchain install hook; projects provide `.yokeflow/setup.sh`.
    async fn run_setup_script(&self) {
        let command = "[ -x /workspace/.yokeflow/setup.sh ] && /workspace/.yokeflow/setup.sh || true";
        match self.execute(command, Duration::from_secs(600)).await {
            Ok(outcome) if outcome.is_error() => {
                warn!(exit_code = outcome.exit_code, "workspace setup script failed");
            }
            Err(e) => warn!(error = %e, "workspace setup script errored"),
            _ => {}
        }
    }

    async fn kill_residual_servers(&self) {
        for name in RESIDUAL_SERVER_NAMES {
            let command = format!("pkill -f {name} || true");
            if let Err(e) = self.execute(&command, Duration::from_secs(10)).await {
                debug!(process = name, error = %e, "residual process cleanup failed");
            }
        }
    }

    async fn remove_container(&self) -> YokeResult<()> {
        let opts = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&self.container_name, Some(opts))
            .await
            .map_err(|e| sandbox_err("failed to remove container", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Workspace for DockerWorkspace {
    async fn execute(&self, command: &str, timeout: Duration) -> YokeResult<ExecOutcome> {
        let start = Instant::now();
        let exec = self
            .docker
            .create_exec(
                &self.container_name,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-lc", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some("/workspace"),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| sandbox_err("failed to create exec", e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let collect = async {
            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| sandbox_err("failed to start exec", e))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        match chunk.map_err(|e| sandbox_err("exec stream failed", e))? {
                            bollard::container::LogOutput::StdOut { message } => {
                                stdout.push_str(&String::from_utf8_lossy(&message));
                            }
                            bollard::container::LogOutput::StdErr { message } => {
                                stderr.push_str(&String::from_utf8_lossy(&message));
                            }
                            _ => {}
                        }
                    }
                    Ok::<(), YokeError>(())
                }
                StartExecResults::Detached => Ok(()),
            }
        };

        if tokio::time::timeout(timeout, collect).await.is_err() {
            return Err(YokeError::Sandbox(format!(
                "command timed out after {}s: {command}",
                timeout.as_secs()
            )));
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| sandbox_err("failed to inspect exec", e))?;

        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stop(&self) -> YokeResult<()> {
        let opts = StopContainerOptions {
            t: Some(10),
            ..Default::default()
        };
        self.docker
            .stop_container(&self.container_name, Some(opts))
            .await
            .map_err(|e| sandbox_err("failed to stop container", e))?;
        Ok(())
    }

    async fn remove(&self) -> YokeResult<()> {
        self.remove_container().await
    }

    async fn status(&self) -> YokeResult<WorkspaceStatus> {
        let inspect = self
            .docker
            .inspect_container(&self.container_name, None)
            .await
            .map_err(|e| sandbox_err("failed to inspect container", e))?;

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let uptime_seconds = inspect
            .state
            .as_ref()
            .and_then(|s| s.started_at.as_deref())
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|started| {
                (chrono::Utc::now() - started.with_timezone(&chrono::Utc)).num_seconds().max(0)
                    as u64
            })
            .unwrap_or(0);

        let ports = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.as_ref())
            .map(|ports| {
                ports
                    .keys()
                    .filter_map(|key| key.split('/').next()?.parse::<u16>().ok())
                    .collect()
            })
            .unwrap_or_default();

        // One stats sample for cpu/memory.
        let mut stats_stream = self.docker.stats(
            &self.container_name,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let (cpu_pct, memory_bytes) = match stats_stream.next().await {
            Some(Ok(stats)) => {
                let memory = stats
                    .memory_stats
                    .as_ref()
                    .and_then(|m| m.usage)
                    .unwrap_or(0);
                let cpu_usage = stats.cpu_stats.as_ref().and_then(|c| c.cpu_usage.as_ref());
                let precpu_usage = stats.precpu_stats.as_ref().and_then(|c| c.cpu_usage.as_ref());
                let cpu_delta = cpu_usage
                    .and_then(|u| u.total_usage)
                    .unwrap_or(0)
                    .saturating_sub(precpu_usage.and_then(|u| u.total_usage).unwrap_or(0));
                let system_delta = stats
                    .cpu_stats
                    .as_ref()
                    .and_then(|c| c.system_cpu_usage)
                    .unwrap_or(0)
                    .saturating_sub(
                        stats
                            .precpu_stats
                            .as_ref()
                            .and_then(|c| c.system_cpu_usage)
                            .unwrap_or(0),
                    );
                let cpus = stats
                    .cpu_stats
                    .as_ref()
                    .and_then(|c| c.online_cpus)
                    .unwrap_or(1) as f64;
                let pct = if system_delta > 0 {
                    (cpu_delta as f64 / system_delta as f64) * cpus * 100.0
                } else {
                    0.0
                };
                (pct, memory)
            }
            _ => (0.0, 0),
        };

        Ok(WorkspaceStatus {
            state,
            ports,
            uptime_seconds,
            cpu_pct,
            memory_bytes,
        })
    }
}
