//! Search handlers: the build-range bookkeeping the step sequencer drives.
//!
//! The sequencer only sees the [`Handler`] capability. Both concrete variants share
//! [`RangeHandler`] and differ in how their [`RangeSource`] resolves the initial list of
//! build keys.

mod date;
mod revision;

pub use date::{DateRange, DateRangeHandler};
pub use revision::{RevisionRange, RevisionRangeHandler};

use crate::error::{BisectError, BisectResult};
use crate::model::{
    AppInfo, BisectMode, BisectOptions, BuildDescriptor, FetchConfig, RangeSummary, ResultCode,
    Verdict,
};
use std::sync::Arc;

/// Index of a candidate build inside the current range.
pub type BuildRef = usize;

/// Capability interface the step sequencer uses to drive a search.
pub trait Handler: Send {
    /// Pick the next candidate. Resolves the range on first use.
    fn search_midpoint(&mut self) -> BisectResult<BuildRef>;

    /// Prepare for evaluating `mid`; anything but `Running` ends the run.
    fn init_at(&mut self, mid: BuildRef) -> ResultCode;

    fn build_info(&self, mid: BuildRef) -> BisectResult<BuildDescriptor>;

    /// Record what the launched build reported about itself.
    fn update_build_info(&mut self, mid: BuildRef, app_info: &AppInfo);

    /// Fold a verdict into the range.
    fn handle_verdict(&mut self, mid: BuildRef, verdict: Verdict) -> ResultCode;

    /// Narrowed range, once there is one.
    fn summary(&self) -> Option<RangeSummary>;
}

/// Produces the initial list of build keys for a handler, oldest first.
pub trait RangeSource: Send {
    /// Short name used in build metadata and logs.
    fn kind(&self) -> &'static str;

    fn resolve(&self, fetch: &FetchConfig) -> BisectResult<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEntry {
    pub key: String,
    pub app_info: Option<AppInfo>,
}

/// Ordered candidate builds, first known good (or bad, when looking for a fix) and last
/// known bad.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRange {
    entries: Vec<BuildEntry>,
}

impl BuildRange {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: keys
                .into_iter()
                .map(|k| BuildEntry {
                    key: k.into(),
                    app_info: None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BuildEntry> {
        self.entries.get(index)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Central candidate, or 0 once the bounds are adjacent and nothing is left to test.
    pub fn mid_point(&self) -> BuildRef {
        if self.entries.len() < 3 {
            0
        } else {
            self.entries.len() / 2
        }
    }

    /// Narrow the range around `mid` according to `verdict`.
    pub fn fold(&mut self, mid: BuildRef, verdict: Verdict, find_fix: bool) {
        if mid >= self.entries.len() {
            return;
        }
        // A good build before the regression moves the lower bound up; when hunting a
        // fix the roles flip.
        let keep_upper = match verdict {
            Verdict::Good => !find_fix,
            Verdict::Bad => find_fix,
            Verdict::Skip => {
                self.entries.remove(mid);
                return;
            }
            Verdict::Abort => return,
        };
        if keep_upper {
            self.entries.drain(..mid);
        } else {
            self.entries.truncate(mid + 1);
        }
    }

    fn set_app_info(&mut self, index: usize, app_info: &AppInfo) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.app_info = Some(app_info.clone());
        }
    }

    fn summary(&self, find_fix: bool) -> Option<RangeSummary> {
        let first = self.entries.first()?;
        let last = self.entries.last()?;
        Some(RangeSummary {
            first: first.key.clone(),
            last: last.key.clone(),
            find_fix,
            first_app_info: first.app_info.clone(),
            last_app_info: last.app_info.clone(),
        })
    }
}

/// Midpoint handler over a range resolved by `S`.
pub struct RangeHandler<S> {
    source: S,
    fetch: Arc<FetchConfig>,
    find_fix: bool,
    range: Option<BuildRange>,
}

impl<S: RangeSource> RangeHandler<S> {
    pub fn new(source: S, fetch: Arc<FetchConfig>, find_fix: bool) -> Self {
        Self {
            source,
            fetch,
            find_fix,
            range: None,
        }
    }

    pub fn range(&self) -> Option<&BuildRange> {
        self.range.as_ref()
    }

    fn ensure_range(&mut self) -> BisectResult<&BuildRange> {
        if self.range.is_none() {
            let keys = self.source.resolve(&self.fetch)?;
            tracing::debug!(kind = self.source.kind(), builds = keys.len(), "resolved build range");
            self.range = Some(BuildRange::new(keys));
        }
        self.range
            .as_ref()
            .ok_or(BisectError::Precondition("build range missing after resolve"))
    }
}

impl<S: RangeSource> Handler for RangeHandler<S> {
    fn search_midpoint(&mut self) -> BisectResult<BuildRef> {
        Ok(self.ensure_range()?.mid_point())
    }

    fn init_at(&mut self, mid: BuildRef) -> ResultCode {
        match &self.range {
            None => ResultCode::NoData,
            Some(r) if r.is_empty() => ResultCode::NoData,
            Some(_) if mid == 0 => ResultCode::Finished,
            Some(_) => ResultCode::Running,
        }
    }

    fn build_info(&self, mid: BuildRef) -> BisectResult<BuildDescriptor> {
        let entry = self
            .range
            .as_ref()
            .and_then(|r| r.get(mid))
            .ok_or_else(|| BisectError::Search(format!("midpoint {mid} is outside the range")))?;
        let mut build = BuildDescriptor::new(
            entry.key.clone(),
            self.fetch.build_url(&entry.key),
            self.fetch.file_name.clone(),
        );
        build
            .metadata
            .insert("range".to_string(), self.source.kind().to_string());
        Ok(build)
    }

    fn update_build_info(&mut self, mid: BuildRef, app_info: &AppInfo) {
        if let Some(range) = self.range.as_mut() {
            range.set_app_info(mid, app_info);
        }
    }

    fn handle_verdict(&mut self, mid: BuildRef, verdict: Verdict) -> ResultCode {
        if verdict == Verdict::Abort {
            return ResultCode::UserExit;
        }
        let Some(range) = self.range.as_mut() else {
            return ResultCode::NoData;
        };
        range.fold(mid, verdict, self.find_fix);
        match range.len() {
            0 => ResultCode::NoData,
            1 | 2 => ResultCode::Finished,
            _ => ResultCode::Running,
        }
    }

    fn summary(&self) -> Option<RangeSummary> {
        self.range.as_ref()?.summary(self.find_fix)
    }
}

/// Select the handler variant for `options`.
pub fn handler_for(options: &BisectOptions, fetch: Arc<FetchConfig>) -> Box<dyn Handler> {
    match options.mode {
        BisectMode::Date => Box::new(DateRangeHandler::new(
            DateRange::new(&options.start, &options.end),
            fetch,
            options.find_fix,
        )),
        BisectMode::Revision => Box::new(RevisionRangeHandler::new(
            RevisionRange::new(&options.start, &options.end),
            fetch,
            options.find_fix,
        )),
    }
}
