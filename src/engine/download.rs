//! Focused download coordination.
//!
//! A run only ever cares about one build at a time. Focusing a new build cancels every
//! other tracked download; cancellation is cooperative, the transfer notices the token
//! between chunks.

use super::{EventSink, WorkerMsg};
use crate::model::{BisectEvent, BuildDescriptor, DownloadInfo, FetchConfig, InfoEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport that copies a build to a local path.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `build` into `partial`. Must return promptly once `cancel` fires.
    async fn fetch(
        &self,
        build: &BuildDescriptor,
        partial: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Active,
    Done,
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct DownloadEntry {
    id: u64,
    dest: PathBuf,
    token: CancellationToken,
    current: AtomicU64,
    total: AtomicU64,
    state: Mutex<EntryState>,
}

/// Shared view of one tracked download.
#[derive(Debug, Clone)]
pub struct DownloadHandle(Arc<DownloadEntry>);

impl DownloadHandle {
    fn new(id: u64, dest: PathBuf) -> Self {
        Self(Arc::new(DownloadEntry {
            id,
            dest,
            token: CancellationToken::new(),
            current: AtomicU64::new(0),
            total: AtomicU64::new(0),
            state: Mutex::new(EntryState::Active),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn dest(&self) -> &Path {
        &self.0.dest
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.state.lock() == EntryState::Cancelled || self.0.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        *self.0.state.lock() != EntryState::Active
    }

    pub fn error(&self) -> Option<String> {
        match &*self.0.state.lock() {
            EntryState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// `(current, total)` bytes.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.0.current.load(Ordering::Relaxed),
            self.0.total.load(Ordering::Relaxed),
        )
    }

    /// Request cancellation. No-op once the download has finished either way.
    pub fn cancel(&self) {
        if *self.0.state.lock() == EntryState::Active {
            self.0.token.cancel();
        }
    }

    pub fn info(&self) -> DownloadInfo {
        DownloadInfo {
            id: self.0.id,
            dest: self.0.dest.clone(),
            cancelled: self.is_cancelled(),
            error: self.error(),
        }
    }

    fn settle(&self, state: EntryState) {
        let mut current = self.0.state.lock();
        if *current == EntryState::Active {
            *current = state;
        }
    }
}

/// Progress reporter handed to the transport.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    handle: DownloadHandle,
    events: EventSink,
}

impl ProgressSink {
    pub fn report(&self, current: u64, total: u64) {
        self.handle.0.current.store(current, Ordering::Relaxed);
        self.handle.0.total.store(total, Ordering::Relaxed);
        // Progress is best effort; a slow observer must not stall the transfer.
        self.events.try_emit(BisectEvent::DownloadProgress {
            download: self.handle.info(),
            current,
            total,
        });
    }
}

/// Removes a partial file unless it was renamed into place.
struct PartialFile(PathBuf);

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.0.exists() {
            let _ = std::fs::remove_file(&self.0);
        }
    }
}

/// Tracks the downloads of a single run and keeps at most one of them focused.
pub struct DownloadCoordinator {
    dest_dir: PathBuf,
    file_name: String,
    downloader: Arc<dyn Downloader>,
    tracked: Mutex<Vec<DownloadHandle>>,
    fetched: Arc<Mutex<Vec<PathBuf>>>,
    next_id: AtomicU64,
    events: EventSink,
    completions: mpsc::UnboundedSender<WorkerMsg>,
}

impl DownloadCoordinator {
    pub fn new(
        fetch: &FetchConfig,
        downloader: Arc<dyn Downloader>,
        events: EventSink,
        completions: mpsc::UnboundedSender<WorkerMsg>,
    ) -> Self {
        Self {
            dest_dir: fetch.dest_dir.clone(),
            file_name: fetch.file_name.clone(),
            downloader,
            tracked: Mutex::new(Vec::new()),
            fetched: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            events,
            completions,
        }
    }

    /// Where `build` lands on disk.
    pub fn destination(&self, build: &BuildDescriptor) -> PathBuf {
        let key: String = build
            .key
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        let file_name = if build.file_name.is_empty() {
            &self.file_name
        } else {
            &build.file_name
        };
        self.dest_dir.join(format!("{key}--{file_name}"))
    }

    /// Make `build` the only download this run cares about.
    ///
    /// Every tracked download for another destination is cancelled and dropped from
    /// tracking. An active download for the same destination is kept as is. Must be
    /// called from within a Tokio runtime.
    pub fn focus_download(&self, build: &BuildDescriptor) -> DownloadHandle {
        let dest = self.destination(build);
        let mut tracked = self.tracked.lock();
        tracked.retain(|dl| {
            let keep = dl.dest() == dest && !dl.is_finished();
            if !keep && !dl.is_finished() {
                debug!(dest = %dl.dest().display(), "cancelling unfocused download");
                dl.cancel();
            }
            keep
        });
        if let Some(existing) = tracked.first() {
            debug!(dest = %dest.display(), "download already in progress");
            return existing.clone();
        }

        let handle = DownloadHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), dest);
        tracked.push(handle.clone());
        drop(tracked);

        self.spawn_fetch(build.clone(), handle.clone());
        handle
    }

    /// Cancel every tracked download matching `predicate`.
    pub fn cancel_if(&self, predicate: impl Fn(&DownloadHandle) -> bool) {
        for dl in self.tracked.lock().iter().filter(|dl| predicate(dl)) {
            dl.cancel();
        }
    }

    pub fn cancel_all(&self) {
        self.cancel_if(|_| true);
    }

    pub fn tracked(&self) -> Vec<DownloadHandle> {
        self.tracked.lock().clone()
    }

    /// Tracked downloads that have not been cancelled.
    pub fn active(&self) -> Vec<DownloadHandle> {
        self.tracked
            .lock()
            .iter()
            .filter(|dl| !dl.is_cancelled())
            .cloned()
            .collect()
    }

    /// Delete every build this run downloaded.
    pub fn remove_fetched(&self) {
        for path in self.fetched.lock().drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed downloaded build"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "cannot remove downloaded build: {e}"),
            }
        }
    }

    fn spawn_fetch(&self, build: BuildDescriptor, handle: DownloadHandle) {
        let downloader = Arc::clone(&self.downloader);
        let events = self.events.clone();
        let completions = self.completions.clone();
        let fetched = Arc::clone(&self.fetched);

        tokio::spawn(async move {
            let dest = handle.dest().to_path_buf();
            if dest.is_file() {
                handle.settle(EntryState::Done);
                events
                    .emit(BisectEvent::Info {
                        info: InfoEvent::PersistedBuild { dest: dest.clone() },
                    })
                    .await;
            } else {
                events
                    .emit(BisectEvent::DownloadStarted {
                        download: handle.info(),
                    })
                    .await;
                let partial = PartialFile(dest.with_file_name(format!(
                    "{}.{}.part",
                    dest.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    handle.id()
                )));
                let sink = ProgressSink {
                    handle: handle.clone(),
                    events: events.clone(),
                };
                let res = fetch_into(&*downloader, &build, &partial.0, &dest, &sink, &handle).await;
                settle_fetch(&handle, res, &fetched);
            }

            let download = handle.info();
            events
                .emit(BisectEvent::DownloadFinished {
                    download: download.clone(),
                })
                .await;
            // The worker may already be gone if the run was stopped.
            let _ = completions.send(WorkerMsg::DownloadFinished(download));
        });
    }
}

/// Settle `handle` from the transfer result. A file that made it to its destination is
/// tracked for removal even if the download was cancelled after the move.
fn settle_fetch(handle: &DownloadHandle, res: Result<()>, fetched: &Mutex<Vec<PathBuf>>) {
    let dest = handle.dest();
    if res.is_ok() && dest.is_file() {
        fetched.lock().push(dest.to_path_buf());
    }
    match res {
        _ if handle.0.token.is_cancelled() => handle.settle(EntryState::Cancelled),
        Ok(()) => {
            info!(dest = %dest.display(), "download finished");
            handle.settle(EntryState::Done);
        }
        Err(e) => {
            warn!(dest = %dest.display(), "download failed: {e:#}");
            handle.settle(EntryState::Failed(format!("{e:#}")));
        }
    }
}

async fn fetch_into(
    downloader: &dyn Downloader,
    build: &BuildDescriptor,
    partial: &Path,
    dest: &Path,
    sink: &ProgressSink,
    handle: &DownloadHandle,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create download dir {}", parent.display()))?;
    }
    downloader
        .fetch(build, partial, sink, &handle.0.token)
        .await?;
    if handle.0.token.is_cancelled() {
        return Ok(());
    }
    tokio::fs::rename(partial, dest)
        .await
        .with_context(|| format!("move {} into place", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Writes a few chunks, waiting between them so tests can interleave cancellation.
    struct SlowDownloader {
        chunks: u64,
        delay: Duration,
    }

    #[async_trait]
    impl Downloader for SlowDownloader {
        async fn fetch(
            &self,
            _build: &BuildDescriptor,
            partial: &Path,
            progress: &ProgressSink,
            cancel: &CancellationToken,
        ) -> Result<()> {
            let mut data = Vec::new();
            for i in 0..self.chunks {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                tokio::time::sleep(self.delay).await;
                data.push(b'x');
                progress.report(i + 1, self.chunks);
            }
            tokio::fs::write(partial, data).await?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        coordinator: DownloadCoordinator,
        events: mpsc::Receiver<BisectEvent>,
        completions: mpsc::UnboundedReceiver<WorkerMsg>,
    }

    fn fixture(chunks: u64, delay: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fetch = FetchConfig {
            mirror: dir.path().join("mirror"),
            file_name: "app.bin".into(),
            dest_dir: dir.path().join("dl"),
            persist: false,
            launch_command: None,
            revision_catalog: None,
            ready_timeout: Duration::from_secs(1),
        };
        let (ev_tx, ev_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let coordinator = DownloadCoordinator::new(
            &fetch,
            Arc::new(SlowDownloader { chunks, delay }),
            EventSink::new(ev_tx),
            done_tx,
        );
        Fixture {
            _dir: dir,
            coordinator,
            events: ev_rx,
            completions: done_rx,
        }
    }

    fn build(key: &str) -> BuildDescriptor {
        BuildDescriptor::new(key, format!("file:///mirror/{key}/app.bin"), "app.bin")
    }

    async fn next_completion(rx: &mut mpsc::UnboundedReceiver<WorkerMsg>) -> DownloadInfo {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("completion timed out")
            .expect("completion channel closed");
        match msg {
            WorkerMsg::DownloadFinished(dl) => dl,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn destination_flattens_key() {
        let fx = fixture(1, Duration::ZERO);
        let dest = fx.coordinator.destination(&build("release/1.0"));
        assert!(dest.ends_with("release_1.0--app.bin"));
    }

    #[tokio::test]
    async fn focus_cancels_other_downloads() {
        let mut fx = fixture(50, Duration::from_millis(20));
        let first = fx.coordinator.focus_download(&build("a"));
        let second = fx.coordinator.focus_download(&build("b"));

        assert!(first.is_cancelled());
        let active = fx.coordinator.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].dest(), second.dest());

        let done = next_completion(&mut fx.completions).await;
        assert_eq!(done.dest, first.dest());
        assert!(done.cancelled);
        assert!(!first.dest().exists());
    }

    #[tokio::test]
    async fn refocusing_same_build_keeps_download() {
        let fx = fixture(50, Duration::from_millis(20));
        let first = fx.coordinator.focus_download(&build("a"));
        let again = fx.coordinator.focus_download(&build("a"));
        assert_eq!(first.id(), again.id());
        assert!(!first.is_cancelled());
        fx.coordinator.cancel_all();
    }

    #[tokio::test]
    async fn completed_download_lands_at_destination() {
        let mut fx = fixture(3, Duration::from_millis(1));
        let handle = fx.coordinator.focus_download(&build("a"));
        let done = next_completion(&mut fx.completions).await;
        assert_eq!(done.id, handle.id());
        assert!(!done.cancelled);
        assert_eq!(done.error, None);
        assert!(handle.dest().is_file());
        assert_eq!(handle.progress(), (3, 3));

        // Cancelling after completion changes nothing.
        handle.cancel();
        assert!(!handle.is_cancelled());

        fx.coordinator.remove_fetched();
        assert!(!handle.dest().exists());

        let mut saw_started = false;
        while let Ok(ev) = fx.events.try_recv() {
            saw_started |= matches!(ev, BisectEvent::DownloadStarted { .. });
        }
        assert!(saw_started);
    }

    #[tokio::test]
    async fn existing_destination_completes_without_download() {
        let mut fx = fixture(3, Duration::from_millis(1));
        let b = build("a");
        let dest = fx.coordinator.destination(&b);
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"cached").unwrap();

        fx.coordinator.focus_download(&b);
        let done = next_completion(&mut fx.completions).await;
        assert!(!done.cancelled);

        while let Ok(ev) = fx.events.try_recv() {
            assert!(!matches!(ev, BisectEvent::DownloadStarted { .. }));
        }
        // Not ours to delete.
        fx.coordinator.remove_fetched();
        assert!(dest.is_file());
    }

    #[test]
    fn cancel_after_move_still_tracks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a--app.bin");
        std::fs::write(&dest, b"x").unwrap();
        let handle = DownloadHandle::new(1, dest.clone());
        let fetched = Mutex::new(Vec::new());

        handle.cancel();
        settle_fetch(&handle, Ok(()), &fetched);

        assert!(handle.is_cancelled());
        assert!(handle.is_finished());
        assert_eq!(*fetched.lock(), vec![dest]);
    }

    #[test]
    fn cancel_before_move_tracks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DownloadHandle::new(1, dir.path().join("a--app.bin"));
        let fetched = Mutex::new(Vec::new());

        handle.cancel();
        settle_fetch(&handle, Ok(()), &fetched);

        assert!(handle.is_cancelled());
        assert!(fetched.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let fx = fixture(50, Duration::from_millis(20));
        let handle = fx.coordinator.focus_download(&build("a"));
        fx.coordinator.cancel_all();
        fx.coordinator.cancel_all();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(fx.coordinator.active().is_empty());
    }

    #[tokio::test]
    async fn cancel_if_only_touches_matching_downloads() {
        let fx = fixture(50, Duration::from_millis(20));
        let handle = fx.coordinator.focus_download(&build("a"));
        fx.coordinator.cancel_if(|dl| dl.dest().ends_with("zzz--app.bin"));
        assert!(!handle.is_cancelled());
        fx.coordinator.cancel_if(|dl| dl.id() == handle.id());
        assert!(handle.is_cancelled());
    }
}
