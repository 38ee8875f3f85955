//! The step sequencer: one bisection loop, driven entirely by messages on the worker
//! queue.
//!
//! Idle → AwaitingReady → Searching → Downloading → Evaluating → Searching … → Terminated.
//! Every transition happens while handling exactly one message, so a run never has more
//! than one step in flight. Looping goes back through the queue (`Advance`) instead of
//! recursing.

use super::{DownloadCoordinator, EvaluationGate, EventSink, WorkerMsg};
use crate::error::{BisectError, BisectResult};
use crate::handler::{BuildRef, Handler};
use crate::model::{
    BisectEvent, BuildDescriptor, DownloadInfo, FetchConfig, InfoEvent, ResultCode, RunId,
    Verdict,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    /// `Started` was emitted; waiting for the driving side to acknowledge it.
    AwaitingReady,
    Searching,
    Downloading,
    Evaluating,
    Terminated,
}

/// One loop iteration. The verdict is set once and never changes afterwards.
#[derive(Debug, Clone)]
pub struct Step {
    pub index: u32,
    pub mid: BuildRef,
    pub build: BuildDescriptor,
    pub download_id: u64,
    pub verdict: Option<Verdict>,
}

pub struct StepSequencer {
    run: RunId,
    fetch: Arc<FetchConfig>,
    downloads: Arc<DownloadCoordinator>,
    gate: EvaluationGate,
    events: EventSink,
    inbox: mpsc::UnboundedSender<WorkerMsg>,
    state: SequencerState,
    handler: Option<Box<dyn Handler>>,
    step: Option<Step>,
    index: u32,
}

impl StepSequencer {
    pub fn new(
        run: RunId,
        fetch: Arc<FetchConfig>,
        downloads: Arc<DownloadCoordinator>,
        gate: EvaluationGate,
        events: EventSink,
        inbox: mpsc::UnboundedSender<WorkerMsg>,
    ) -> Self {
        Self {
            run,
            fetch,
            downloads,
            gate,
            events,
            inbox,
            state: SequencerState::Idle,
            handler: None,
            step: None,
            index: 0,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn step(&self) -> Option<&Step> {
        self.step.as_ref()
    }

    /// Drain the worker queue until `shutdown` fires.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<WorkerMsg>,
        shutdown: CancellationToken,
    ) {
        let ready_timeout = self.fetch.ready_timeout;
        loop {
            let msg = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(ready_timeout), if self.state == SequencerState::AwaitingReady => {
                    warn!(run = %self.run, "no ready acknowledgement, starting anyway");
                    self.events
                        .emit(BisectEvent::Info { info: InfoEvent::ReadyTimedOut })
                        .await;
                    WorkerMsg::Ready
                }
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }
            // A step may wait on an evaluation for as long as the build runs; shutdown
            // drops it mid-way, which kills the launched build.
            let res = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = self.handle(msg) => res,
            };
            if let Err(e) = res {
                self.finish(ResultCode::Exception, Some(e)).await;
            }
        }
        debug!(run = %self.run, state = ?self.state, "worker loop exited");
    }

    /// Process one message. Errors end the run with `ResultCode::Exception`.
    pub async fn handle(&mut self, msg: WorkerMsg) -> BisectResult<()> {
        match msg {
            WorkerMsg::Start(handler) => self.start(handler).await,
            _ if self.state == SequencerState::Terminated => {
                debug!(run = %self.run, "run already terminated, ignoring message");
                Ok(())
            }
            WorkerMsg::Ready => {
                self.on_ready();
                Ok(())
            }
            WorkerMsg::Advance => self.advance().await,
            WorkerMsg::DownloadFinished(dl) => self.on_download_finished(dl).await,
            WorkerMsg::Verdict(verdict) => self.on_verdict(verdict).await,
        }
    }

    async fn start(&mut self, handler: Box<dyn Handler>) -> BisectResult<()> {
        if self.state != SequencerState::Idle {
            return Err(BisectError::Precondition(
                "start called on a sequencer that already has a run",
            ));
        }
        self.handler = Some(handler);
        self.index = 0;
        self.state = SequencerState::AwaitingReady;
        info!(run = %self.run, "bisection started");
        self.events.emit(BisectEvent::Started { run: self.run }).await;
        Ok(())
    }

    fn on_ready(&mut self) {
        if self.state != SequencerState::AwaitingReady {
            debug!(run = %self.run, "duplicate ready acknowledgement");
            return;
        }
        self.state = SequencerState::Searching;
        self.post(WorkerMsg::Advance);
    }

    async fn advance(&mut self) -> BisectResult<()> {
        if self.state != SequencerState::Searching {
            debug!(run = %self.run, state = ?self.state, "stale advance");
            return Ok(());
        }
        self.index += 1;
        let index = self.index;
        self.events
            .emit(BisectEvent::StepStarted {
                run: self.run,
                index,
            })
            .await;

        let handler = self
            .handler
            .as_mut()
            .ok_or(BisectError::Precondition("advance without a handler"))?;
        let mid = handler.search_midpoint()?;
        let code = handler.init_at(mid);
        if code.is_terminal() {
            self.finish(code, None).await;
            return Ok(());
        }

        let mut build = handler.build_info(mid)?;
        build.path = Some(self.downloads.destination(&build));
        debug!(run = %self.run, step = index, build = %build.key, "build found");
        self.events
            .emit(BisectEvent::StepBuildFound {
                run: self.run,
                index,
                build: build.clone(),
            })
            .await;

        self.state = SequencerState::Downloading;
        let download = self.downloads.focus_download(&build);
        self.step = Some(Step {
            index,
            mid,
            build,
            download_id: download.id(),
            verdict: None,
        });
        Ok(())
    }

    async fn on_download_finished(&mut self, dl: DownloadInfo) -> BisectResult<()> {
        let Some(step) = self.step.as_ref() else {
            return Ok(());
        };
        let focused = self.state == SequencerState::Downloading
            && step.download_id == dl.id
            && step.build.path.as_deref() == Some(dl.dest());
        if !focused {
            debug!(run = %self.run, dest = %dl.dest.display(), "stale download event");
            return Ok(());
        }
        if let Some(reason) = dl.error {
            return Err(BisectError::Download {
                dest: dl.dest,
                reason,
            });
        }
        if dl.cancelled {
            return Err(BisectError::DownloadCancelled { dest: dl.dest });
        }

        self.state = SequencerState::Evaluating;
        let build = step.build.clone();
        self.gate.evaluate(&build).await
    }

    async fn on_verdict(&mut self, verdict: Verdict) -> BisectResult<()> {
        let app_info = self.gate.finish(verdict).await?;
        let step = self
            .step
            .as_mut()
            .ok_or(BisectError::Precondition("verdict without a step"))?;
        step.verdict = Some(verdict);
        let (index, mid) = (step.index, step.mid);

        let handler = self
            .handler
            .as_mut()
            .ok_or(BisectError::Precondition("verdict without a handler"))?;
        handler.update_build_info(mid, &app_info);
        self.events
            .emit(BisectEvent::StepFinished {
                run: self.run,
                index,
                verdict,
            })
            .await;

        let code = handler.handle_verdict(mid, verdict);
        if code.is_terminal() {
            self.finish(code, None).await;
        } else {
            self.state = SequencerState::Searching;
            self.post(WorkerMsg::Advance);
        }
        Ok(())
    }

    /// Emit the terminal event. Only the first call has any effect.
    async fn finish(&mut self, code: ResultCode, err: Option<BisectError>) {
        if self.state == SequencerState::Terminated {
            if let Some(e) = err {
                error!(run = %self.run, "error after termination: {e}");
            }
            return;
        }
        self.state = SequencerState::Terminated;
        let summary = self.handler.as_ref().and_then(|h| h.summary());
        match &err {
            Some(e) => error!(run = %self.run, step = self.index, "bisection failed: {e}"),
            None => info!(run = %self.run, ?code, steps = self.index, "bisection finished"),
        }
        self.events
            .emit(BisectEvent::Finished {
                run: self.run,
                code,
                error: err.map(|e| e.to_string()),
                summary,
            })
            .await;
    }

    /// Report a run that never got a chance to start.
    pub(super) fn abandon(self, err: BisectError) {
        error!(run = %self.run, "bisection abandoned: {err}");
        self.events.try_emit(BisectEvent::Finished {
            run: self.run,
            code: ResultCode::Exception,
            error: Some(err.to_string()),
            summary: None,
        });
    }

    fn post(&self, msg: WorkerMsg) {
        if self.inbox.send(msg).is_err() {
            debug!(run = %self.run, "worker queue closed");
        }
    }
}
