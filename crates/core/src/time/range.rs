use crate::domain::pipeline::Opportunity;
use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Inclusive calendar-day range, interpreted in UTC. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateFilter {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl DateFilter {
    pub fn new(date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> Self {
        Self { date_from, date_to }
    }

    pub fn parse(date_from: Option<&str>, date_to: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            date_from: parse_day(date_from).context("invalid dateFrom")?,
            date_to: parse_day(date_to).context("invalid dateTo")?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.date_from.is_some() || self.date_to.is_some()
    }

    /// `dateFrom` at 00:00:00.000 UTC and `dateTo` at 23:59:59.999 UTC.
    pub fn bounds(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let start = self
            .date_from
            .map(|d| d.and_time(NaiveTime::MIN).and_utc());
        let end = self.date_to.and_then(|d| {
            NaiveTime::from_hms_milli_opt(23, 59, 59, 999).map(|t| d.and_time(t).and_utc())
        });
        (start, end)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let (start, end) = self.bounds();
        start.map_or(true, |s| at >= s) && end.map_or(true, |e| at <= e)
    }

    /// A range of `n` days maps to the `n` days before `dateFrom`. With only one bound the
    /// comparison is the single day before that bound. An inverted range has no comparison.
    pub fn previous_period(&self) -> Option<DateFilter> {
        match (self.date_from, self.date_to) {
            (Some(from), Some(to)) => {
                if to < from {
                    return None;
                }
                let span = (to - from).num_days() as u64;
                let prev_to = from.pred_opt()?;
                let prev_from = prev_to.checked_sub_days(Days::new(span))?;
                Some(DateFilter::new(Some(prev_from), Some(prev_to)))
            }
            (Some(bound), None) | (None, Some(bound)) => {
                let day = bound.pred_opt()?;
                Some(DateFilter::new(Some(day), Some(day)))
            }
            (None, None) => None,
        }
    }
}

fn parse_day(s: Option<&str>) -> anyhow::Result<Option<NaiveDate>> {
    match s.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .with_context(|| format!("expected YYYY-MM-DD, got {s:?}")),
        None => Ok(None),
    }
}

/// Reads an upstream `created_at` as UTC.
///
/// The API sends naive `YYYY-MM-DD HH:mm:ss`; longer strings with fractional seconds are cut
/// to the first 19 characters, and explicit RFC 3339 timestamps are honored as given.
pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, CREATED_AT_FORMAT) {
        return Some(naive.and_utc());
    }
    if let Some(head) = raw.get(..19) {
        let head = head.replacen('T', " ", 1);
        if let Ok(naive) = NaiveDateTime::parse_from_str(&head, CREATED_AT_FORMAT) {
            if !has_offset(&raw[19..]) {
                return Some(naive.and_utc());
            }
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn has_offset(tail: &str) -> bool {
    let tail = tail.trim_start_matches(|c: char| c == '.' || c.is_ascii_digit());
    !(tail.is_empty() || tail == "Z")
}

#[derive(Debug)]
pub struct Filtered<'a> {
    pub kept: Vec<&'a Opportunity>,
    pub invalid: u64,
}

pub fn filter_opportunities<'a>(opportunities: &'a [Opportunity], filter: &DateFilter) -> Filtered<'a> {
    if !filter.is_active() {
        return Filtered {
            kept: opportunities.iter().collect(),
            invalid: 0,
        };
    }

    let mut kept = Vec::new();
    let mut invalid = 0u64;
    for opp in opportunities {
        match opp.created_at.as_deref().and_then(parse_created_at) {
            Some(at) if filter.contains(at) => kept.push(opp),
            Some(_) => {}
            None => invalid += 1,
        }
    }
    if invalid > 0 {
        tracing::debug!(invalid, ?filter, "opportunities excluded for unparsable created_at");
    }
    Filtered { kept, invalid }
}
