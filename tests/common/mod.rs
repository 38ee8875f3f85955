//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use build_bisect::engine::{Downloader, LaunchedBuild, Launcher, ProgressSink};
use build_bisect::handler::{BuildRef, Handler};
use build_bisect::model::{
    AppInfo, BisectEvent, BuildDescriptor, FetchConfig, RangeSummary, ResultCode, Verdict,
};
use build_bisect::orchestrator::{Collaborators, RunController};
use build_bisect::BisectError;
use build_bisect::BisectResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn fetch_config(root: &Path) -> FetchConfig {
    FetchConfig {
        mirror: root.join("mirror"),
        file_name: "app.bin".into(),
        dest_dir: root.join("dl"),
        persist: false,
        launch_command: None,
        revision_catalog: None,
        ready_timeout: Duration::from_secs(30),
    }
}

/// Handler whose codes are scripted per call. Unscripted calls return `Running`.
#[derive(Default)]
pub struct ScriptedHandler {
    pub fail_search: bool,
    pub init_codes: VecDeque<ResultCode>,
    pub verdict_codes: VecDeque<ResultCode>,
    steps: usize,
}

impl ScriptedHandler {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn init(codes: impl IntoIterator<Item = ResultCode>) -> Self {
        Self {
            init_codes: codes.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn verdicts(codes: impl IntoIterator<Item = ResultCode>) -> Self {
        Self {
            verdict_codes: codes.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn failing_search() -> Self {
        Self {
            fail_search: true,
            ..Self::default()
        }
    }
}

impl Handler for ScriptedHandler {
    fn search_midpoint(&mut self) -> BisectResult<BuildRef> {
        if self.fail_search {
            return Err(BisectError::Search("scripted search failure".into()));
        }
        self.steps += 1;
        Ok(self.steps)
    }

    fn init_at(&mut self, _mid: BuildRef) -> ResultCode {
        self.init_codes.pop_front().unwrap_or(ResultCode::Running)
    }

    fn build_info(&self, mid: BuildRef) -> BisectResult<BuildDescriptor> {
        let key = format!("build-{mid}");
        Ok(BuildDescriptor::new(
            key.clone(),
            format!("file:///mirror/{key}/app.bin"),
            "app.bin",
        ))
    }

    fn update_build_info(&mut self, _mid: BuildRef, _app_info: &AppInfo) {}

    fn handle_verdict(&mut self, _mid: BuildRef, verdict: Verdict) -> ResultCode {
        if verdict == Verdict::Abort {
            return ResultCode::UserExit;
        }
        self.verdict_codes.pop_front().unwrap_or(ResultCode::Running)
    }

    fn summary(&self) -> Option<RangeSummary> {
        None
    }
}

/// Writes a small file per build, optionally slowly or failing.
#[derive(Default)]
pub struct FakeDownloader {
    pub fail: bool,
    pub delay: Option<Duration>,
    pub fetched: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(
        &self,
        build: &BuildDescriptor,
        partial: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.fetched.lock().push(build.key.clone());
        if self.fail {
            bail!("mirror unreachable for {}", build.key);
        }
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancelled.lock().push(build.key.clone());
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let body = format!("build {}", build.key);
        tokio::fs::write(partial, body.as_bytes()).await?;
        progress.report(body.len() as u64, body.len() as u64);
        Ok(())
    }
}

/// Launcher that only records which builds were started and stopped.
#[derive(Default)]
pub struct FakeLauncher {
    pub started: Mutex<Vec<String>>,
    pub stopped: Arc<Mutex<Vec<String>>>,
}

struct FakeBuild {
    key: String,
    stopped: Arc<Mutex<Vec<String>>>,
}

impl LaunchedBuild for FakeBuild {
    fn app_info(&self) -> AppInfo {
        let mut info = AppInfo::new();
        info.insert("build_key".into(), self.key.clone());
        info
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped.lock().push(self.key.clone());
        Ok(())
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start(&self, build: &BuildDescriptor) -> Result<Box<dyn LaunchedBuild>> {
        self.started.lock().push(build.key.clone());
        Ok(Box::new(FakeBuild {
            key: build.key.clone(),
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

pub fn collaborators(
    downloader: Arc<FakeDownloader>,
    launcher: Arc<FakeLauncher>,
) -> Collaborators {
    Collaborators {
        downloader,
        launcher,
    }
}

/// Drive the current run to its terminal event, answering each evaluation with `verdict`.
pub async fn drive(
    controller: &mut RunController,
    mut verdict: impl FnMut(&BuildDescriptor) -> Verdict,
) -> Vec<BisectEvent> {
    let mut events = Vec::new();
    loop {
        let ev = tokio::time::timeout(TEST_TIMEOUT, controller.next_event())
            .await
            .expect("run did not finish in time");
        let Some(ev) = ev else { break };
        if let BisectEvent::EvaluationStarted { build, .. } = &ev {
            controller.finish_evaluation(verdict(build)).unwrap();
        }
        let done = matches!(ev, BisectEvent::Finished { .. });
        events.push(ev);
        if done {
            break;
        }
    }
    events
}

/// Read events until one matches `pred`, returning everything seen.
pub async fn wait_for(
    controller: &mut RunController,
    pred: impl Fn(&BisectEvent) -> bool,
) -> Vec<BisectEvent> {
    let mut events = Vec::new();
    loop {
        let ev = tokio::time::timeout(TEST_TIMEOUT, controller.next_event())
            .await
            .expect("event did not arrive in time")
            .expect("run ended before the expected event");
        let hit = pred(&ev);
        events.push(ev);
        if hit {
            return events;
        }
    }
}

pub fn finished_codes(events: &[BisectEvent]) -> Vec<ResultCode> {
    events
        .iter()
        .filter_map(|ev| match ev {
            BisectEvent::Finished { code, .. } => Some(*code),
            _ => None,
        })
        .collect()
}
