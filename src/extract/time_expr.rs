//! Resolves the free-text event time reported by the extraction capability
//! into an [`EventTime`], anchoring relative expressions at the article's
//! publication date.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::model::EventTime;

lazy_static! {
    static ref ISO_DAY: Option<Regex> = Regex::new(r"^(\d{4})-(\d{2})-(\d{2})(?:[t ].*)?$").ok();
    static ref ISO_MONTH: Option<Regex> = Regex::new(r"^(\d{4})-(\d{2})$").ok();
    static ref YEAR_QUARTER: Option<Regex> = Regex::new(r"^(\d{4})[- ]?q([1-4])$").ok();
    static ref QUARTER_YEAR: Option<Regex> = Regex::new(r"^q([1-4]),? (\d{4})$").ok();
    static ref ORDINAL_QUARTER: Option<Regex> =
        Regex::new(r"^(first|second|third|fourth) quarter(?: of)?,? (\d{4})$").ok();
    static ref YEAR: Option<Regex> = Regex::new(r"^(\d{4})$").ok();
    static ref MONTH_DAY_YEAR: Option<Regex> =
        Regex::new(r"^([a-z]+)\.? (\d{1,2})(?:st|nd|rd|th)?,? (\d{4})$").ok();
    static ref DAY_MONTH_YEAR: Option<Regex> =
        Regex::new(r"^(\d{1,2})(?:st|nd|rd|th)? (?:of )?([a-z]+)\.?,? (\d{4})$").ok();
    static ref MONTH_YEAR: Option<Regex> = Regex::new(r"^([a-z]+)\.?,? (?:of )?(\d{4})$").ok();
    static ref NUMERIC_DATE: Option<Regex> = Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})$").ok();
    static ref MONTH_DAY: Option<Regex> =
        Regex::new(r"^([a-z]+)\.? (\d{1,2})(?:st|nd|rd|th)?$").ok();
    static ref LAST_MONTH_NAME: Option<Regex> = Regex::new(r"^last ([a-z]+)$").ok();
    static ref AGO: Option<Regex> = Regex::new(
        r"^(\d+|a|an|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve) (day|week|month|year)s? ago$"
    )
    .ok();
    static ref WEEKDAY: Option<Regex> = Regex::new(
        r"^(?:last |this past |on )?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)$"
    )
    .ok();
    static ref EMBEDDED_MONTH_YEAR: Option<Regex> = Regex::new(
        r"\b(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec)\.?,? (\d{4})\b"
    )
    .ok();
    static ref EMBEDDED_YEAR: Option<Regex> = Regex::new(r"\b(1[5-9]\d{2}|20\d{2})\b").ok();
}

const PREFIXES: [&str; 11] = [
    "on ", "in ", "at ", "around ", "about ", "circa ", "by ", "during ", "early ", "late ", "mid-",
];

const UNKNOWN: [&str; 7] = ["unknown", "null", "none", "n/a", "na", "unclear", "not specified"];

fn captures<'t>(re: &Option<Regex>, text: &'t str) -> Option<Captures<'t>> {
    re.as_ref()?.captures(text)
}

fn group<T: std::str::FromStr>(caps: &Captures<'_>, index: usize) -> Option<T> {
    caps.get(index)?.as_str().parse().ok()
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.trim_end_matches('.') {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sept" | "sep" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn count_word(word: &str) -> Option<u64> {
    let n = match word {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        digits => return digits.parse().ok(),
    };
    Some(n)
}

fn weekday(name: &str) -> Option<Weekday> {
    name.parse().ok()
}

/// `(year, month)` shifted back by `n` months.
fn months_back(year: i32, month: u32, n: i64) -> Option<(i32, u32)> {
    let total = i64::from(year) * 12 + i64::from(month) - 1 - n;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    Some((year, month))
}

/// Most recent occurrence of `month` not after the reference month.
fn recent_month(reference: NaiveDate, month: u32) -> Option<EventTime> {
    let year = if month <= reference.month() {
        reference.year()
    } else {
        reference.year() - 1
    };
    EventTime::month(year, month)
}

fn normalize(text: &str) -> String {
    let mut s = text
        .trim()
        .trim_end_matches('.')
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    // prefixes can stack: "in early march"
    loop {
        let stripped = PREFIXES
            .iter()
            .find_map(|prefix| s.strip_prefix(prefix).map(str::to_string));
        match stripped {
            Some(rest) if !rest.is_empty() => s = rest,
            _ => break,
        }
    }
    if let Some(rest) = s.strip_prefix("the ") {
        return rest.to_string();
    }
    s
}

/// Parses `text` relative to `published`. Returns `None` when the text carries
/// no usable time.
pub fn parse_event_time(text: &str, published: DateTime<Utc>) -> Option<EventTime> {
    let s = normalize(text);
    if s.is_empty() || UNKNOWN.contains(&s.as_str()) {
        return None;
    }
    let reference = published.date_naive();

    parse_absolute(&s, reference)
        .or_else(|| parse_relative(&s, reference))
        .or_else(|| parse_embedded(&s))
}

fn parse_absolute(s: &str, reference: NaiveDate) -> Option<EventTime> {
    if let Some(caps) = captures(&ISO_DAY, s) {
        let date = NaiveDate::from_ymd_opt(group(&caps, 1)?, group(&caps, 2)?, group(&caps, 3)?)?;
        return Some(EventTime::day(date));
    }
    if let Some(caps) = captures(&ISO_MONTH, s) {
        return EventTime::month(group(&caps, 1)?, group(&caps, 2)?);
    }
    if let Some(caps) = captures(&YEAR_QUARTER, s) {
        return EventTime::quarter(group(&caps, 1)?, group(&caps, 2)?);
    }
    if let Some(caps) = captures(&QUARTER_YEAR, s) {
        return EventTime::quarter(group(&caps, 2)?, group(&caps, 1)?);
    }
    if let Some(caps) = captures(&ORDINAL_QUARTER, s) {
        let quarter = match caps.get(1)?.as_str() {
            "first" => 1,
            "second" => 2,
            "third" => 3,
            _ => 4,
        };
        return EventTime::quarter(group(&caps, 2)?, quarter);
    }
    if let Some(caps) = captures(&YEAR, s) {
        return EventTime::year(group(&caps, 1)?);
    }
    if let Some(caps) = captures(&MONTH_DAY_YEAR, s) {
        if let Some(month) = month_number(caps.get(1)?.as_str()) {
            let date = NaiveDate::from_ymd_opt(group(&caps, 3)?, month, group(&caps, 2)?)?;
            return Some(EventTime::day(date));
        }
    }
    if let Some(caps) = captures(&DAY_MONTH_YEAR, s) {
        if let Some(month) = month_number(caps.get(2)?.as_str()) {
            let date = NaiveDate::from_ymd_opt(group(&caps, 3)?, month, group(&caps, 1)?)?;
            return Some(EventTime::day(date));
        }
    }
    if let Some(caps) = captures(&MONTH_YEAR, s) {
        if let Some(month) = month_number(caps.get(1)?.as_str()) {
            return EventTime::month(group(&caps, 2)?, month);
        }
    }
    if let Some(caps) = captures(&NUMERIC_DATE, s) {
        let (first, second, year): (u32, u32, i32) =
            (group(&caps, 1)?, group(&caps, 2)?, group(&caps, 3)?);
        // month-first unless that is impossible
        let date = NaiveDate::from_ymd_opt(year, first, second)
            .or_else(|| NaiveDate::from_ymd_opt(year, second, first))?;
        return Some(EventTime::day(date));
    }
    if let Some(caps) = captures(&MONTH_DAY, s) {
        if let Some(month) = month_number(caps.get(1)?.as_str()) {
            let day: u32 = group(&caps, 2)?;
            let this_year = NaiveDate::from_ymd_opt(reference.year(), month, day);
            let date = match this_year {
                Some(date) if date <= reference => date,
                _ => NaiveDate::from_ymd_opt(reference.year() - 1, month, day)?,
            };
            return Some(EventTime::day(date));
        }
    }
    if let Some(month) = month_number(s) {
        return recent_month(reference, month);
    }
    None
}

fn parse_relative(s: &str, reference: NaiveDate) -> Option<EventTime> {
    match s {
        "today" | "this morning" | "this afternoon" | "this evening" | "tonight" => {
            return Some(EventTime::day(reference))
        }
        "yesterday" | "last night" => {
            return Some(EventTime::day(reference.checked_sub_days(Days::new(1))?))
        }
        "this week" | "earlier this week" => return Some(EventTime::week_of(reference)),
        "last week" => {
            return Some(EventTime::week_of(reference.checked_sub_days(Days::new(7))?))
        }
        "this month" | "earlier this month" => {
            return EventTime::month(reference.year(), reference.month())
        }
        "last month" => {
            let (year, month) = months_back(reference.year(), reference.month(), 1)?;
            return EventTime::month(year, month);
        }
        "this year" | "earlier this year" => return EventTime::year(reference.year()),
        "last year" => return EventTime::year(reference.year() - 1),
        _ => {}
    }

    if let Some(caps) = captures(&AGO, s) {
        let n = count_word(caps.get(1)?.as_str())?;
        return match caps.get(2)?.as_str() {
            "day" => Some(EventTime::day(reference.checked_sub_days(Days::new(n))?)),
            "week" => Some(EventTime::week_of(
                reference.checked_sub_days(Days::new(n.checked_mul(7)?))?,
            )),
            "month" => {
                let (year, month) =
                    months_back(reference.year(), reference.month(), i64::try_from(n).ok()?)?;
                EventTime::month(year, month)
            }
            _ => EventTime::year(reference.year() - i32::try_from(n).ok()?),
        };
    }

    if let Some(caps) = captures(&WEEKDAY, s) {
        let target = weekday(caps.get(1)?.as_str())?;
        let current = reference.weekday().num_days_from_monday();
        let wanted = target.num_days_from_monday();
        // strictly before publication: a same-named day means a week earlier
        let back = match (current + 7 - wanted) % 7 {
            0 => 7,
            n => n,
        };
        return Some(EventTime::day(
            reference.checked_sub_days(Days::new(u64::from(back)))?,
        ));
    }

    if let Some(caps) = captures(&LAST_MONTH_NAME, s) {
        let month = month_number(caps.get(1)?.as_str())?;
        let year = if month < reference.month() {
            reference.year()
        } else {
            reference.year() - 1
        };
        return EventTime::month(year, month);
    }

    None
}

/// Last resort: a month-and-year or a bare year anywhere in the text.
fn parse_embedded(s: &str) -> Option<EventTime> {
    if let Some(caps) = captures(&EMBEDDED_MONTH_YEAR, s) {
        let month = month_number(caps.get(1)?.as_str())?;
        return EventTime::month(group(&caps, 2)?, month);
    }
    let caps = captures(&EMBEDDED_YEAR, s)?;
    EventTime::year(group(&caps, 1)?)
}
