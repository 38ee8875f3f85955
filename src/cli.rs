use crate::engine::{CommandLauncher, LocalDownloader};
use crate::model::{AppInfo, BisectEvent, BisectMode, BisectOptions, FetchConfig, Verdict};
use crate::orchestrator::{run_controller, Collaborators, UiCommand};
use crate::text_summary::{build_text_summary, StepRecord};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Builds are keyed by day (YYYY-MM-DD)
    Date,
    /// Builds are keyed by revisions listed in the revision catalog
    Revision,
}

impl From<ModeArg> for BisectMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Date => BisectMode::Date,
            ModeArg::Revision => BisectMode::Revision,
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "build-bisect",
    version,
    about = "Find the build that introduced (or fixed) a problem by bisecting a range of builds"
)]
pub struct Cli {
    /// How builds in the range are keyed
    #[arg(long, value_enum, default_value = "date")]
    pub mode: ModeArg,

    /// Older bound of the range (known good, or known bad with --find-fix)
    #[arg(long)]
    pub good: String,

    /// Newer bound of the range (known bad, or known good with --find-fix)
    #[arg(long)]
    pub bad: String,

    /// Build mirror; builds live at <mirror>/<key>/<file-name>
    #[arg(long, env = "BISECT_MIRROR")]
    pub mirror: PathBuf,

    /// File name of a build inside its mirror directory
    #[arg(long)]
    pub file_name: String,

    /// Where fetched builds are stored (default: user cache dir)
    #[arg(long)]
    pub dest_dir: Option<PathBuf>,

    /// Keep fetched builds after the bisection ends
    #[arg(long)]
    pub persist: bool,

    /// Revision catalog for --mode revision (default: <mirror>/revisions.txt)
    #[arg(long)]
    pub revision_catalog: Option<PathBuf>,

    /// Shell command run for each build (sees BISECT_BUILD_PATH and BISECT_BUILD_KEY)
    #[arg(long)]
    pub launch_cmd: Option<String>,

    /// Derive verdicts from the launch command's exit code instead of prompting
    #[arg(long)]
    pub auto: bool,

    /// Look for the build that fixed the problem
    #[arg(long)]
    pub find_fix: bool,

    /// Print every event as a JSON line on stdout
    #[arg(long)]
    pub json: bool,

    /// How long the worker waits for the ready acknowledgement before proceeding
    #[arg(long, default_value = "5s")]
    pub ready_timeout: humantime::Duration,

    /// Increase log verbosity (-v info, -vv debug); BISECT_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Build a `FetchConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<FetchConfig> {
    let dest_dir = match args.dest_dir.clone() {
        Some(dir) => dir,
        None => dirs::cache_dir()
            .context("no user cache directory; pass --dest-dir")?
            .join("build-bisect")
            .join("downloads"),
    };
    Ok(FetchConfig {
        mirror: args.mirror.clone(),
        file_name: args.file_name.clone(),
        dest_dir,
        persist: args.persist,
        launch_command: args.launch_cmd.clone(),
        revision_catalog: args.revision_catalog.clone(),
        ready_timeout: Duration::from(args.ready_timeout),
    })
}

pub fn build_options(args: &Cli) -> BisectOptions {
    BisectOptions {
        mode: args.mode.into(),
        start: args.good.clone(),
        end: args.bad.clone(),
        find_fix: args.find_fix,
    }
}

/// Run a bisection to completion. Returns whether it completed.
pub async fn run(args: Cli) -> Result<bool> {
    if args.auto && args.launch_cmd.is_none() {
        return Err(anyhow!(
            "--auto needs --launch-cmd: verdicts come from the command's exit code"
        ));
    }

    let config = build_config(&args)?;
    let options = build_options(&args);
    let collaborators = Collaborators {
        downloader: Arc::new(LocalDownloader),
        launcher: Arc::new(CommandLauncher::new(config.launch_command.clone(), args.auto)),
    };

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<BisectEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = tokio::spawn(run_controller(collaborators, evt_tx, cmd_rx));
    cmd_tx
        .send(UiCommand::Bisect { config, options })
        .map_err(|_| anyhow!("controller exited before the bisection started"))?;

    let mut steps: Vec<StepRecord> = Vec::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                if args.json {
                    let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(&ev)?));
                } else if let Some(line) = render_event(&ev) {
                    let _ = out_tx.send(OutputLine::Stderr(line));
                }

                match &ev {
                    BisectEvent::StepBuildFound { index, build, .. } => steps.push(StepRecord {
                        index: *index,
                        key: build.key.clone(),
                        verdict: None,
                    }),
                    BisectEvent::StepFinished { index, verdict, .. } => {
                        if let Some(step) = steps.iter_mut().rev().find(|s| s.index == *index) {
                            step.verdict = Some(*verdict);
                        }
                    }
                    BisectEvent::EvaluationStarted { build, app_info } => {
                        if args.auto {
                            let _ = cmd_tx.send(UiCommand::Verdict(auto_verdict(app_info)));
                        } else {
                            spawn_verdict_prompt(
                                build.key.clone(),
                                cmd_tx.clone(),
                                out_tx.clone(),
                                !args.json,
                            );
                        }
                    }
                    BisectEvent::Finished { .. } => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                    }
                    _ => {}
                }
            }
            res = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if let Err(e) = res {
                    warn!("failed to listen for ctrl-c: {e}");
                }
                let _ = out_tx.send(OutputLine::Stderr("Interrupted, stopping bisection".into()));
                let _ = cmd_tx.send(UiCommand::Quit);
            }
        }
    }

    let outcome = controller.await.context("controller task failed")??;

    if args.json {
        if let Some(outcome) = outcome.as_ref() {
            let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(outcome)?));
        }
    } else {
        let summary = build_text_summary(outcome.as_ref(), &steps);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(outcome.is_some_and(|o| o.is_success()))
}

/// Verdict from the `exit_code` a waiting launcher recorded.
fn auto_verdict(app_info: &AppInfo) -> Verdict {
    Verdict::from_exit_code(app_info.get("exit_code").and_then(|c| c.parse().ok()))
}

/// Read a verdict from stdin on a blocking thread; EOF aborts the bisection.
fn spawn_verdict_prompt(
    key: String,
    cmd_tx: mpsc::UnboundedSender<UiCommand>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    prompt: bool,
) {
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        loop {
            if prompt {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "Is build {key} good? [g]ood / [b]ad / [s]kip / [e]xit"
                )));
            }
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => {
                    let _ = cmd_tx.send(UiCommand::Verdict(Verdict::Abort));
                    return;
                }
                Ok(_) => match line.parse::<Verdict>() {
                    Ok(verdict) => {
                        let _ = cmd_tx.send(UiCommand::Verdict(verdict));
                        return;
                    }
                    Err(e) => {
                        let _ = out_tx.send(OutputLine::Stderr(e));
                    }
                },
            }
        }
    });
}

/// Progress line for text mode, if the event deserves one.
fn render_event(ev: &BisectEvent) -> Option<String> {
    match ev {
        BisectEvent::Started { run } => Some(format!("Bisection {run} started")),
        BisectEvent::StepStarted { index, .. } => Some(format!("== Step {index} ==")),
        BisectEvent::StepBuildFound { build, .. } => Some(format!("Build: {}", build.key)),
        BisectEvent::DownloadStarted { download } => {
            Some(format!("Downloading {}", download.dest().display()))
        }
        BisectEvent::DownloadFinished { download } => Some(match download.error.as_deref() {
            Some(e) => format!("Download of {} failed: {e}", download.dest().display()),
            None if download.cancelled => {
                format!("Download of {} cancelled", download.dest().display())
            }
            None => format!("Downloaded {}", download.dest().display()),
        }),
        BisectEvent::EvaluationStarted { build, app_info } => Some(match app_info.get("pid") {
            Some(pid) => format!("Evaluating {} (pid {pid})", build.key),
            None => format!("Evaluating {}", build.key),
        }),
        BisectEvent::EvaluationFinished { verdict } => Some(format!("Verdict: {verdict}")),
        BisectEvent::Info { info } => Some(info.to_message()),
        BisectEvent::DownloadProgress { .. }
        | BisectEvent::StepFinished { .. }
        | BisectEvent::Finished { .. } => None,
    }
}
