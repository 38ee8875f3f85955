//! Run lifecycle controller.
//!
//! Owns start/stop of the worker context and emits events for presentation layers.

use super::outcome::Outcome;
use crate::engine::{
    self, DownloadCoordinator, Downloader, EvaluationGate, EventSink, Launcher, StepSequencer,
    WorkerMsg, EVENT_QUEUE_DEPTH,
};
use crate::error::{BisectError, BisectResult};
use crate::handler::{handler_for, Handler};
use crate::model::{BisectEvent, BisectOptions, FetchConfig, InfoEvent, RunId, Verdict};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External collaborators shared by every run of a controller.
#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub launcher: Arc<dyn Launcher>,
}

/// Commands emitted by UI layers to control the bisection.
#[derive(Debug, Clone)]
pub enum UiCommand {
    Bisect {
        config: FetchConfig,
        options: BisectOptions,
    },
    Verdict(Verdict),
    Stop,
    Quit,
}

/// Internal handle for a running bisection.
struct RunCtx {
    id: RunId,
    inbox: UnboundedSender<WorkerMsg>,
    events: mpsc::Receiver<BisectEvent>,
    downloads: Arc<DownloadCoordinator>,
    shutdown: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
    persist: bool,
}

/// Driving-context owner of at most one bisection run.
pub struct RunController {
    collaborators: Collaborators,
    run: Option<RunCtx>,
    outcome: Option<Outcome>,
    last_error: Option<String>,
}

impl RunController {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            run: None,
            outcome: None,
            last_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run.as_ref().map(|r| r.id)
    }

    /// Outcome of the last run that reached a terminal code.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Downloads tracked by the current run.
    pub fn downloads(&self) -> Option<Arc<DownloadCoordinator>> {
        self.run.as_ref().map(|r| Arc::clone(&r.downloads))
    }

    /// Tear down any previous run and start a new one for `options`.
    pub async fn bisect(&mut self, config: FetchConfig, options: &BisectOptions) -> BisectResult<RunId> {
        let fetch = Arc::new(config);
        let handler = handler_for(options, Arc::clone(&fetch));
        info!(mode = ?options.mode, start = %options.start, end = %options.end, "starting bisection");
        self.bisect_with(fetch, handler).await
    }

    /// Like [`RunController::bisect`] with an explicit handler.
    pub async fn bisect_with(
        &mut self,
        fetch: Arc<FetchConfig>,
        handler: Box<dyn Handler>,
    ) -> BisectResult<RunId> {
        self.stop().await;
        self.outcome = None;
        self.last_error = None;

        let id = engine::gen_run_id();
        let (event_tx, event_rx) = mpsc::channel::<BisectEvent>(EVENT_QUEUE_DEPTH);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<WorkerMsg>();
        let events = EventSink::new(event_tx);

        let downloads = Arc::new(DownloadCoordinator::new(
            &fetch,
            Arc::clone(&self.collaborators.downloader),
            events.clone(),
            inbox_tx.clone(),
        ));
        let gate = EvaluationGate::new(Arc::clone(&self.collaborators.launcher), events.clone());
        let sequencer = StepSequencer::new(
            id,
            Arc::clone(&fetch),
            Arc::clone(&downloads),
            gate,
            events,
            inbox_tx.clone(),
        );
        let shutdown = CancellationToken::new();
        let thread = engine::spawn_worker(sequencer, inbox_rx, shutdown.clone())?;

        // Posted, not called: whoever reads events after this returns still sees
        // `Started`, and the first step waits for our ready acknowledgement.
        inbox_tx
            .send(WorkerMsg::Start(handler))
            .map_err(|_| BisectError::Worker("worker queue closed before start".into()))?;

        self.run = Some(RunCtx {
            id,
            inbox: inbox_tx,
            events: event_rx,
            downloads,
            shutdown,
            thread: Some(thread),
            persist: fetch.persist,
        });
        Ok(id)
    }

    /// Cancel downloads, stop the worker and wait for its thread to exit.
    ///
    /// No-op without an active run.
    pub async fn stop(&mut self) {
        let Some(ctx) = self.run.take() else {
            return;
        };
        let RunCtx {
            id,
            inbox,
            events,
            downloads,
            shutdown,
            thread,
            persist,
        } = ctx;

        downloads.cancel_all();
        shutdown.cancel();
        // Closing our ends unblocks a worker waiting for room in the event queue.
        drop(events);
        drop(inbox);

        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    error!(run = %id, "worker thread panicked");
                    if self.last_error.is_none() {
                        self.last_error = Some("worker thread panicked".to_string());
                    }
                }
                Err(e) => error!(run = %id, "failed to join worker thread: {e}"),
            }
        }
        if !persist {
            downloads.remove_fetched();
        }
        info!(run = %id, "run stopped");
    }

    /// Forward a verdict for the build under evaluation to the worker.
    pub fn finish_evaluation(&self, verdict: Verdict) -> BisectResult<()> {
        let ctx = self
            .run
            .as_ref()
            .ok_or(BisectError::Precondition("verdict without an active run"))?;
        ctx.inbox
            .send(WorkerMsg::Verdict(verdict))
            .map_err(|_| BisectError::Worker("worker queue closed".into()))
    }

    /// Next event from the worker. Cancel safe; `None` once there is no run to listen to.
    pub async fn recv_event(&mut self) -> Option<BisectEvent> {
        let ctx = self.run.as_mut()?;
        ctx.events.recv().await
    }

    /// Controller-side reaction to an event: acknowledge `Started`, settle `Finished`.
    pub async fn dispatch(&mut self, event: &BisectEvent) {
        match event {
            BisectEvent::Started { run } => {
                if let Some(ctx) = self.run.as_ref().filter(|c| c.id == *run) {
                    debug!(run = %run, "acknowledging start");
                    let _ = ctx.inbox.send(WorkerMsg::Ready);
                }
            }
            BisectEvent::Finished {
                run,
                code,
                error,
                summary,
            } => {
                if self.run_id() != Some(*run) {
                    return;
                }
                let outcome = Outcome::from_finished(*code, error.clone(), summary.clone());
                info!(run = %run, ?code, "{}", outcome.message());
                self.last_error = error.clone();
                self.outcome = Some(outcome);
                self.stop().await;
            }
            _ => {}
        }
    }

    /// [`RunController::recv_event`] followed by [`RunController::dispatch`].
    pub async fn next_event(&mut self) -> Option<BisectEvent> {
        let event = self.recv_event().await?;
        self.dispatch(&event).await;
        Some(event)
    }
}

/// Orchestrate bisection runs based on UI commands and emit events back to presentation layers.
///
/// Returns the outcome of the last run that finished.
pub async fn run_controller(
    collaborators: Collaborators,
    event_tx: UnboundedSender<BisectEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<Option<Outcome>> {
    let mut controller = RunController::new(collaborators);
    let mut last = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Bisect { config, options }) => {
                        if let Err(e) = controller.bisect(config, &options).await {
                            let _ = event_tx.send(BisectEvent::Info {
                                info: InfoEvent::Message(format!("Failed to start bisection: {e}")),
                            });
                        }
                    }
                    Some(UiCommand::Verdict(verdict)) => {
                        if let Err(e) = controller.finish_evaluation(verdict) {
                            warn!("verdict {verdict} dropped: {e}");
                        }
                    }
                    Some(UiCommand::Stop) => controller.stop().await,
                    Some(UiCommand::Quit) | None => {
                        controller.stop().await;
                        break;
                    }
                }
            }
            // Only listen while a run exists; `recv_event` resolves to `None` otherwise.
            ev = controller.recv_event(), if controller.is_active() => {
                match ev {
                    Some(ev) => {
                        controller.dispatch(&ev).await;
                        if let Some(outcome) = controller.take_outcome() {
                            last = Some(outcome);
                        }
                        let _ = event_tx.send(ev);
                    }
                    None => controller.stop().await,
                }
            }
        }
    }

    Ok(last)
}
