use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How builds are located and where they land once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Root of the build mirror; builds live at `<mirror>/<key>/<file_name>`.
    pub mirror: PathBuf,
    pub file_name: String,
    pub dest_dir: PathBuf,
    /// Keep downloaded builds after the run is stopped.
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub launch_command: Option<String>,
    /// Revision list, one per line, oldest first. Defaults to `<mirror>/revisions.txt`.
    #[serde(default)]
    pub revision_catalog: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
}

impl FetchConfig {
    pub fn build_url(&self, key: &str) -> String {
        format!(
            "file://{}",
            self.mirror.join(key).join(&self.file_name).display()
        )
    }

    /// Whether the mirror carries a build for `key`.
    pub fn has_build(&self, key: &str) -> bool {
        self.mirror.join(key).join(&self.file_name).is_file()
    }

    pub fn revision_catalog(&self) -> PathBuf {
        self.revision_catalog
            .clone()
            .unwrap_or_else(|| self.mirror.join("revisions.txt"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BisectMode {
    #[serde(rename = "range-by-date")]
    Date,
    #[serde(rename = "range-by-revision")]
    Revision,
}

/// Selects the handler variant and its two range bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BisectOptions {
    pub mode: BisectMode,
    pub start: String,
    pub end: String,
    /// Search for the build that fixed something rather than the one that broke it.
    #[serde(default)]
    pub find_fix: bool,
}

/// Runtime information reported by a launched build.
pub type AppInfo = BTreeMap<String, String>;

/// Everything needed to fetch and launch a single build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    pub key: String,
    pub url: String,
    pub file_name: String,
    /// Set once the download coordinator has assigned a destination.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BuildDescriptor {
    pub fn new(key: impl Into<String>, url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            file_name: file_name.into(),
            path: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Good,
    Bad,
    Skip,
    /// The user gave up on the bisection.
    Abort,
}

impl Verdict {
    /// Map a test command's exit status onto a verdict, the way `git bisect run` does.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Verdict::Good,
            Some(125) | None => Verdict::Skip,
            Some(_) => Verdict::Bad,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Good => "good",
            Verdict::Bad => "bad",
            Verdict::Skip => "skip",
            Verdict::Abort => "abort",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g" | "good" => Ok(Verdict::Good),
            "b" | "bad" => Ok(Verdict::Bad),
            "s" | "skip" => Ok(Verdict::Skip),
            "e" | "exit" | "abort" => Ok(Verdict::Abort),
            other => Err(format!("unknown verdict '{other}' (expected g, b, s or e)")),
        }
    }
}

/// Classification of a run after each search step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Running,
    NoData,
    Finished,
    /// The user aborted with an exit verdict.
    UserExit,
    /// Uncaught failure during a search step.
    Exception,
}

impl ResultCode {
    pub fn is_terminal(self) -> bool {
        self != ResultCode::Running
    }
}

/// Identifier of a single bisection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Final narrowed range once the search has converged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSummary {
    /// Last build known to be good (first build of the final range).
    pub first: String,
    /// First build known to be bad (last build of the final range).
    pub last: String,
    pub find_fix: bool,
    #[serde(default)]
    pub first_app_info: Option<AppInfo>,
    #[serde(default)]
    pub last_app_info: Option<AppInfo>,
}

/// Snapshot of a download as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub id: u64,
    pub dest: PathBuf,
    pub cancelled: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl DownloadInfo {
    pub fn dest(&self) -> &Path {
        &self.dest
    }
}

/// Events emitted by a run and delivered on the driving context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BisectEvent {
    Started {
        run: RunId,
    },
    StepStarted {
        run: RunId,
        index: u32,
    },
    StepBuildFound {
        run: RunId,
        index: u32,
        build: BuildDescriptor,
    },
    StepFinished {
        run: RunId,
        index: u32,
        verdict: Verdict,
    },
    Finished {
        run: RunId,
        code: ResultCode,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        summary: Option<RangeSummary>,
    },
    DownloadStarted {
        download: DownloadInfo,
    },
    DownloadProgress {
        download: DownloadInfo,
        current: u64,
        total: u64,
    },
    DownloadFinished {
        download: DownloadInfo,
    },
    EvaluationStarted {
        build: BuildDescriptor,
        app_info: AppInfo,
    },
    EvaluationFinished {
        verdict: Verdict,
    },
    Info {
        info: InfoEvent,
    },
}

/// Structured info events emitted by the run and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    ReadyTimedOut,
    PersistedBuild { dest: PathBuf },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::ReadyTimedOut => {
                "No ready acknowledgement from the driving side, continuing".to_string()
            }
            InfoEvent::PersistedBuild { dest } => {
                format!("Reusing already downloaded build {}", dest.display())
            }
        }
    }
}
