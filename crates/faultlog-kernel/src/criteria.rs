//! Query criteria: the immutable filter a run is started with.
//!
//! A [QueryCriteria] is built and validated before a run starts and is then
//! shared read-only between the controller and the producer thread.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CriteriaError;

/// Longest time window a single query may cover.
pub const MAX_WINDOW_MONTHS: u32 = 2;

/// Closed time window `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CriteriaError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Expands calendar dates to `start 00:00:00` through `end 23:59:59`.
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Result<Self, CriteriaError> {
        // Span is checked on the dates themselves so a full two-month window
        // is accepted even though the end is pushed to the last second.
        if start > end {
            return Err(CriteriaError::InvertedWindow {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        check_span(start, end)?;
        let day_end = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
        Ok(Self {
            start: Utc.from_utc_datetime(&start.and_time(NaiveTime::default())),
            end: Utc.from_utc_datetime(&end.and_time(day_end)),
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    pub fn validate(&self) -> Result<(), CriteriaError> {
        if self.start > self.end {
            return Err(CriteriaError::InvertedWindow {
                start: self.start.to_rfc3339(),
                end: self.end.to_rfc3339(),
            });
        }
        check_span(self.start.date_naive(), self.end.date_naive())
    }
}

fn check_span(start: NaiveDate, end: NaiveDate) -> Result<(), CriteriaError> {
    let limit = start.checked_add_months(Months::new(MAX_WINDOW_MONTHS));
    match limit {
        Some(limit) if end <= limit => Ok(()),
        _ => Err(CriteriaError::SpanTooLong {
            max_months: MAX_WINDOW_MONTHS,
        }),
    }
}

/// Three-part alarm code, written `main-middle-sub`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmCode {
    pub main: i32,
    pub middle: i32,
    pub sub: i32,
}

impl AlarmCode {
    pub fn new(main: i32, middle: i32, sub: i32) -> Self {
        Self { main, middle, sub }
    }
}

impl fmt::Display for AlarmCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.main, self.middle, self.sub)
    }
}

impl FromStr for AlarmCode {
    type Err = CriteriaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CriteriaError::MalformedCode(s.to_string());
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3 {
            return Err(malformed());
        }
        let parse = |p: &str| p.trim().parse::<i32>().map_err(|_| malformed());
        Ok(Self {
            main: parse(parts[0])?,
            middle: parse(parts[1])?,
            sub: parse(parts[2])?,
        })
    }
}

/// Alarm severity as stored by the query service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    Caution,
    StopSampling,
    Stop,
}

impl AlarmLevel {
    pub fn as_i32(self) -> i32 {
        match self {
            AlarmLevel::Caution => 1,
            AlarmLevel::StopSampling => 2,
            AlarmLevel::Stop => 3,
        }
    }
}

impl TryFrom<i32> for AlarmLevel {
    type Error = CriteriaError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AlarmLevel::Caution),
            2 => Ok(AlarmLevel::StopSampling),
            3 => Ok(AlarmLevel::Stop),
            other => Err(CriteriaError::UnknownLevel(other)),
        }
    }
}

/// Filter for one run. Optional fields left `None` match everything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCriteria {
    pub time_range: TimeRange,
    pub code: Option<AlarmCode>,
    pub level: Option<AlarmLevel>,
    pub device_sn: Option<String>,
}

impl QueryCriteria {
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            time_range,
            code: None,
            level: None,
            device_sn: None,
        }
    }

    pub fn with_code(mut self, code: AlarmCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Parses and sets the code filter; empty text clears it.
    pub fn with_code_text(mut self, text: &str) -> Result<Self, CriteriaError> {
        let text = text.trim();
        self.code = if text.is_empty() {
            None
        } else {
            Some(text.parse()?)
        };
        Ok(self)
    }

    pub fn with_level(mut self, level: AlarmLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_device_sn(mut self, device_sn: impl Into<String>) -> Self {
        self.device_sn = Some(device_sn.into());
        self
    }

    pub fn validate(&self) -> Result<(), CriteriaError> {
        self.time_range.validate()
    }
}
