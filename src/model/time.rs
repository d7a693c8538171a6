use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How precisely an event time is known. Variants are ordered coarse to fine,
/// so `a > b` means `a` is more precise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Year,
    Quarter,
    Month,
    Week,
    Day,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Year => write!(f, "year"),
            Precision::Quarter => write!(f, "quarter"),
            Precision::Month => write!(f, "month"),
            Precision::Week => write!(f, "week"),
            Precision::Day => write!(f, "day"),
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "year" => Ok(Precision::Year),
            "quarter" => Ok(Precision::Quarter),
            "month" => Ok(Precision::Month),
            "week" => Ok(Precision::Week),
            "day" => Ok(Precision::Day),
            other => Err(format!("unknown precision '{}'", other)),
        }
    }
}

/// When an event happened: an inclusive date interval plus the precision the
/// source actually gave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTime {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub precision: Precision,
}

impl EventTime {
    pub fn day(date: NaiveDate) -> Self {
        EventTime {
            start: date,
            end: date,
            precision: Precision::Day,
        }
    }

    /// The Monday-to-Sunday week containing `date`.
    pub fn week_of(date: NaiveDate) -> Self {
        let offset = date.weekday().num_days_from_monday() as u64;
        let start = date - Days::new(offset);
        EventTime {
            start,
            end: start + Days::new(6),
            precision: Precision::Week,
        }
    }

    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        Some(EventTime {
            start,
            end: last_day_of_month(year, month)?,
            precision: Precision::Month,
        })
    }

    pub fn quarter(year: i32, quarter: u32) -> Option<Self> {
        if !(1..=4).contains(&quarter) {
            return None;
        }
        let first_month = (quarter - 1) * 3 + 1;
        Some(EventTime {
            start: NaiveDate::from_ymd_opt(year, first_month, 1)?,
            end: last_day_of_month(year, first_month + 2)?,
            precision: Precision::Quarter,
        })
    }

    pub fn year(year: i32) -> Option<Self> {
        Some(EventTime {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
            precision: Precision::Year,
        })
    }

    pub fn overlaps(&self, other: &EventTime) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Days between the two intervals; zero when they overlap.
    pub fn gap_days(&self, other: &EventTime) -> i64 {
        if self.overlaps(other) {
            0
        } else if self.end < other.start {
            (other.start - self.end).num_days()
        } else {
            (self.start - other.end).num_days()
        }
    }

    pub fn is_more_precise_than(&self, other: &EventTime) -> bool {
        self.precision > other.precision
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.precision {
            Precision::Year => write!(f, "{}", self.start.year()),
            Precision::Quarter => write!(
                f,
                "{}-Q{}",
                self.start.year(),
                (self.start.month() - 1) / 3 + 1
            ),
            Precision::Month => write!(f, "{}", self.start.format("%Y-%m")),
            Precision::Week => write!(f, "week of {}", self.start.format("%Y-%m-%d")),
            Precision::Day => write!(f, "{}", self.start.format("%Y-%m-%d")),
        }
    }
}

pub(crate) fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}
