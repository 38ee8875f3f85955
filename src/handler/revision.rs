use super::{RangeHandler, RangeSource};
use crate::error::{BisectError, BisectResult};
use crate::model::FetchConfig;

/// Handler bisecting over a linear list of revisions.
pub type RevisionRangeHandler = RangeHandler<RevisionRange>;

/// Revisions between two changesets of the catalog, inclusive.
#[derive(Debug, Clone)]
pub struct RevisionRange {
    start: String,
    end: String,
}

impl RevisionRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Exact match first, then a unique prefix (short changeset ids).
fn position(catalog: &[String], rev: &str) -> BisectResult<usize> {
    let rev = rev.trim();
    if let Some(i) = catalog.iter().position(|r| r == rev) {
        return Ok(i);
    }
    let mut matches = catalog
        .iter()
        .enumerate()
        .filter(|(_, r)| !rev.is_empty() && r.starts_with(rev));
    match (matches.next(), matches.next()) {
        (Some((i, _)), None) => Ok(i),
        (Some(_), Some(_)) => Err(BisectError::InvalidRange(format!(
            "revision '{rev}' is ambiguous"
        ))),
        _ => Err(BisectError::InvalidRange(format!(
            "revision '{rev}' is not in the catalog"
        ))),
    }
}

impl RangeSource for RevisionRange {
    fn kind(&self) -> &'static str {
        "revision"
    }

    fn resolve(&self, fetch: &FetchConfig) -> BisectResult<Vec<String>> {
        let path = fetch.revision_catalog();
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            BisectError::Search(format!(
                "cannot read revision catalog {}: {e}",
                path.display()
            ))
        })?;
        let catalog: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();

        let start = position(&catalog, &self.start)?;
        let end = position(&catalog, &self.end)?;
        if start >= end {
            return Err(BisectError::InvalidRange(format!(
                "revision {} must come before {}",
                self.start, self.end
            )));
        }
        Ok(catalog[start..=end]
            .iter()
            .filter(|rev| fetch.has_build(rev))
            .cloned()
            .collect())
    }
}
