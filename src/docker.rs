//! Narrow seam to the local container runtime. The production implementation
//! shells out to the docker CLI; tests substitute their own.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    Absent,
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerHealth {
    /// The image defines no healthcheck.
    None,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub health: ContainerHealth,
}

#[async_trait]
pub trait ContainerCtl: Send + Sync {
    /// Ask the runtime to start the container. Success means the start was
    /// accepted, not that the server inside is ready for traffic.
    async fn start(&self, name: &str) -> Result<()>;

    /// Graceful stop, escalating to kill after `grace`.
    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;

    async fn state(&self, name: &str) -> Result<ContainerState>;

    /// Run a command inside the container and return its stdout.
    async fn exec(&self, name: &str, argv: &[String]) -> Result<String>;
}

pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        DockerCli {
            binary: "docker".into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("cannot invoke {}", self.binary))?;
        Ok(output)
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerCtl for DockerCli {
    async fn start(&self, name: &str) -> Result<()> {
        self.run_checked(&["start", name]).await?;
        log::info!("Started container {}", name);
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        self.run_checked(&["stop", "-t", &secs, name]).await?;
        log::info!("Stopped container {}", name);
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        let output = self
            .run(&["inspect", "--format", "{{json .State}}", name])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such object") || stderr.contains("No such container") {
                return Ok(ContainerState {
                    status: ContainerStatus::Absent,
                    health: ContainerHealth::None,
                });
            }
            bail!("docker inspect {} failed: {}", name, stderr.trim());
        }
        parse_inspect_state(String::from_utf8_lossy(&output.stdout).trim())
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<String> {
        let mut args = vec!["exec", name];
        args.extend(argv.iter().map(String::as_str));
        self.run_checked(&args).await
    }
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Health")]
    health: Option<InspectHealth>,
}

#[derive(Deserialize)]
struct InspectHealth {
    #[serde(rename = "Status")]
    status: String,
}

fn parse_inspect_state(json: &str) -> Result<ContainerState> {
    let state: InspectState =
        serde_json::from_str(json).context("cannot parse docker inspect output")?;
    let status = match state.status.as_str() {
        "created" => ContainerStatus::Created,
        "running" => ContainerStatus::Running,
        "restarting" => ContainerStatus::Restarting,
        "paused" => ContainerStatus::Paused,
        "exited" => ContainerStatus::Exited,
        "dead" => ContainerStatus::Dead,
        other => bail!("unknown container status '{}'", other),
    };
    let health = match state.health.as_ref().map(|h| h.status.as_str()) {
        None => ContainerHealth::None,
        Some("starting") => ContainerHealth::Starting,
        Some("healthy") => ContainerHealth::Healthy,
        Some("unhealthy") => ContainerHealth::Unhealthy,
        Some(other) => bail!("unknown container health '{}'", other),
    };
    Ok(ContainerState { status, health })
}
