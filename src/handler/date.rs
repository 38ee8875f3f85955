use super::{RangeHandler, RangeSource};
use crate::error::{BisectError, BisectResult};
use crate::model::FetchConfig;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::Date;

const DAY_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Handler bisecting over daily builds.
pub type DateRangeHandler = RangeHandler<DateRange>;

/// Inclusive range of days, keyed `YYYY-MM-DD`.
#[derive(Debug, Clone)]
pub struct DateRange {
    start: String,
    end: String,
}

impl DateRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

fn parse_date(raw: &str) -> BisectResult<Date> {
    Date::parse(raw.trim(), DAY_FORMAT)
        .map_err(|e| BisectError::InvalidRange(format!("'{raw}' is not a YYYY-MM-DD date: {e}")))
}

fn format_date(date: Date) -> BisectResult<String> {
    date.format(DAY_FORMAT)
        .map_err(|e| BisectError::InvalidRange(format!("cannot format {date}: {e}")))
}

impl RangeSource for DateRange {
    fn kind(&self) -> &'static str {
        "date"
    }

    fn resolve(&self, fetch: &FetchConfig) -> BisectResult<Vec<String>> {
        let start = parse_date(&self.start)?;
        let end = parse_date(&self.end)?;
        if start >= end {
            return Err(BisectError::InvalidRange(format!(
                "start date {} must be before end date {}",
                self.start, self.end
            )));
        }

        let mut keys = Vec::new();
        let mut day = Some(start);
        while let Some(d) = day.filter(|d| *d <= end) {
            let key = format_date(d)?;
            // Days without a build on the mirror are never candidates.
            if fetch.has_build(&key) {
                keys.push(key);
            }
            day = d.next_day();
        }
        Ok(keys)
    }
}
