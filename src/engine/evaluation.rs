//! Evaluation gate: launches a fetched build and waits for its verdict.

use super::EventSink;
use crate::error::{BisectError, BisectResult};
use crate::model::{AppInfo, BisectEvent, BuildDescriptor, Verdict};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Starts fetched builds.
///
/// `start` may run for as long as the build does; dropping its future must abandon the
/// build.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(&self, build: &BuildDescriptor) -> Result<Box<dyn LaunchedBuild>>;
}

/// A build started by a [`Launcher`].
pub trait LaunchedBuild: Send {
    fn app_info(&self) -> AppInfo;
    fn stop(&mut self) -> Result<()>;
}

struct InFlight {
    key: String,
    launched: Box<dyn LaunchedBuild>,
    app_info: AppInfo,
}

/// Single-flight bridge between "evaluate this build" and the verdict that comes back.
pub struct EvaluationGate {
    launcher: Arc<dyn Launcher>,
    events: EventSink,
    in_flight: Option<InFlight>,
    verdict: Option<Verdict>,
}

impl EvaluationGate {
    pub fn new(launcher: Arc<dyn Launcher>, events: EventSink) -> Self {
        Self {
            launcher,
            events,
            in_flight: None,
            verdict: None,
        }
    }

    pub fn is_evaluating(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Verdict of the last finished evaluation.
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub async fn evaluate(&mut self, build: &BuildDescriptor) -> BisectResult<()> {
        if self.in_flight.is_some() {
            return Err(BisectError::Precondition(
                "evaluate called while another evaluation is in flight",
            ));
        }
        let launched = self
            .launcher
            .start(build)
            .await
            .map_err(|e| BisectError::Launch {
                key: build.key.clone(),
                reason: format!("{e:#}"),
            })?;
        let app_info = launched.app_info();
        debug!(build = %build.key, "evaluation started");
        self.in_flight = Some(InFlight {
            key: build.key.clone(),
            launched,
            app_info: app_info.clone(),
        });
        self.events
            .emit(BisectEvent::EvaluationStarted {
                build: build.clone(),
                app_info,
            })
            .await;
        Ok(())
    }

    /// Stop the launched build and record `verdict`. Returns the build's app info.
    pub async fn finish(&mut self, verdict: Verdict) -> BisectResult<AppInfo> {
        let Some(mut flight) = self.in_flight.take() else {
            return Err(BisectError::Precondition(
                "finish called without a matching evaluate",
            ));
        };
        if let Err(e) = flight.launched.stop() {
            warn!(build = %flight.key, "failed to stop build: {e:#}");
        }
        self.verdict = Some(verdict);
        debug!(build = %flight.key, %verdict, "evaluation finished");
        self.events
            .emit(BisectEvent::EvaluationFinished { verdict })
            .await;
        Ok(flight.app_info)
    }
}

impl Drop for EvaluationGate {
    fn drop(&mut self) {
        if let Some(mut flight) = self.in_flight.take() {
            if let Err(e) = flight.launched.stop() {
                warn!(build = %flight.key, "failed to stop build on teardown: {e:#}");
            }
        }
    }
}

/// Runs a shell command against each build.
///
/// The command sees `BISECT_BUILD_PATH` and `BISECT_BUILD_KEY`. With `wait` set it runs
/// to completion and its exit code is reported as `exit_code`; otherwise it keeps running
/// until the evaluation finishes. Either way the process is killed if it is dropped.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: Option<String>,
    wait: bool,
}

impl CommandLauncher {
    pub fn new(command: Option<String>, wait: bool) -> Self {
        Self { command, wait }
    }
}

fn base_info(build: &BuildDescriptor) -> AppInfo {
    let mut info = AppInfo::new();
    info.insert("build_key".to_string(), build.key.clone());
    if let Some(path) = build.path.as_ref() {
        info.insert("build_path".to_string(), path.display().to_string());
    }
    info
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn start(&self, build: &BuildDescriptor) -> Result<Box<dyn LaunchedBuild>> {
        let mut info = base_info(build);
        let Some(command) = self.command.as_deref() else {
            return Ok(Box::new(Exited { info }));
        };
        let path = build
            .path
            .as_ref()
            .with_context(|| format!("build {} has no local path", build.key))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("BISECT_BUILD_PATH", path)
            .env("BISECT_BUILD_KEY", &build.key)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn launch command for {}", build.key))?;
        if let Some(pid) = child.id() {
            info.insert("pid".to_string(), pid.to_string());
        }
        if !self.wait {
            return Ok(Box::new(Running { child, info }));
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("wait for launch command of {}", build.key))?;
        info.remove("pid");
        if let Some(code) = status.code() {
            info.insert("exit_code".to_string(), code.to_string());
        }
        Ok(Box::new(Exited { info }))
    }
}

struct Exited {
    info: AppInfo,
}

impl LaunchedBuild for Exited {
    fn app_info(&self) -> AppInfo {
        self.info.clone()
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Running {
    child: Child,
    info: AppInfo,
}

impl LaunchedBuild for Running {
    fn app_info(&self) -> AppInfo {
        self.info.clone()
    }

    fn stop(&mut self) -> Result<()> {
        // The runtime reaps the killed process in the background.
        if self.child.try_wait()?.is_none() {
            self.child.start_kill().context("kill build process")?;
        }
        Ok(())
    }
}
