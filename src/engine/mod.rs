//! Worker context: the bisection loop and the collaborators it drives.
//!
//! Everything here runs on the dedicated worker thread of a run, except the download
//! coordinator's cancellation entry points which the driving context also calls.

mod download;
mod evaluation;
mod sequencer;
mod transport;

pub use download::{DownloadCoordinator, DownloadHandle, Downloader, ProgressSink};
pub use evaluation::{CommandLauncher, EvaluationGate, LaunchedBuild, Launcher};
pub use sequencer::{SequencerState, Step, StepSequencer};
pub use transport::LocalDownloader;

use crate::error::{BisectError, BisectResult};
use crate::handler::Handler;
use crate::model::{BisectEvent, DownloadInfo, RunId, Verdict};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Depth of the worker → driving event queue.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Messages posted onto the worker context's queue.
pub enum WorkerMsg {
    Start(Box<dyn Handler>),
    /// The driving side has seen `Started` and is consuming events.
    Ready,
    Advance,
    DownloadFinished(DownloadInfo),
    Verdict(Verdict),
}

impl std::fmt::Debug for WorkerMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerMsg::Start(_) => f.write_str("Start"),
            WorkerMsg::Ready => f.write_str("Ready"),
            WorkerMsg::Advance => f.write_str("Advance"),
            WorkerMsg::DownloadFinished(dl) => f.debug_tuple("DownloadFinished").field(dl).finish(),
            WorkerMsg::Verdict(v) => f.debug_tuple("Verdict").field(v).finish(),
        }
    }
}

/// Sending half of the event queue towards the driving context.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<BisectEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<BisectEvent>) -> Self {
        Self { tx }
    }

    /// Post an event; a closed queue means the run is being torn down.
    pub async fn emit(&self, event: BisectEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("event queue closed, dropping event");
        }
    }

    /// Post without waiting for room. Used for progress, which may be dropped.
    pub fn try_emit(&self, event: BisectEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Start the worker thread for `sequencer` and drain `inbox` on it until `shutdown`.
pub fn spawn_worker(
    sequencer: StepSequencer,
    inbox: mpsc::UnboundedReceiver<WorkerMsg>,
    shutdown: CancellationToken,
) -> BisectResult<std::thread::JoinHandle<()>> {
    let run = sequencer.run_id();
    std::thread::Builder::new()
        .name(format!("bisect-worker-{run}"))
        .spawn(move || {
            // One current-thread runtime per run: the loop and its downloads share this
            // thread, and dropping the runtime drops any download still in flight.
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    sequencer.abandon(BisectError::Worker(format!(
                        "cannot build worker runtime: {e}"
                    )));
                    return;
                }
            };
            let span = tracing::info_span!("bisect.run", run = %run);
            rt.block_on(sequencer.run(inbox, shutdown).instrument(span));
        })
        .map_err(|e| BisectError::Worker(format!("cannot spawn worker thread for run {run}: {e}")))
}

/// Generate a random run identifier.
pub fn gen_run_id() -> RunId {
    use rand::RngCore;
    RunId(rand::thread_rng().next_u64())
}
