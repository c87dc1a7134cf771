// src/heuristics/mod.rs

mod draft;
mod instruction;

pub use draft::{
    DEFAULT_ITEM_NAME, DraftRequest, generate_invoice_draft, generate_invoice_draft_at,
    generate_invoice_number,
};
pub use instruction::fallback_structured_update;

use regex::{Captures, Regex};
use std::sync::OnceLock;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

/// A label-anchored rule: the first label that appears as
/// `<label> : value` or `<label> - value` yields the rest of that line.
/// One regex per label, compiled on first use.
#[derive(Debug)]
pub struct LabelRule {
    pub field: &'static str,
    pub labels: &'static [&'static str],
    compiled: OnceLock<Vec<Option<Regex>>>,
}

impl LabelRule {
    pub const fn new(field: &'static str, labels: &'static [&'static str]) -> Self {
        Self {
            field,
            labels,
            compiled: OnceLock::new(),
        }
    }

    fn regexes(&self) -> &[Option<Regex>] {
        self.compiled.get_or_init(|| {
            self.labels
                .iter()
                .map(|label| {
                    let pattern = format!(r"(?i){}\s*[:\-]\s*(.+)", regex::escape(label));
                    Regex::new(&pattern)
                        .map_err(|e| warn!(rule = self.field, label = *label, error = %e, "Label pattern failed to compile"))
                        .ok()
                })
                .collect()
        })
    }

    pub fn find(&self, content: &str) -> Option<String> {
        self.regexes().iter().flatten().find_map(|re| {
            re.captures(content)
                .map(|c| c[1].trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }
}

/// A named regex, compiled on first use.
#[derive(Debug)]
pub struct PatternRule {
    pub name: &'static str,
    pattern: &'static str,
    compiled: OnceLock<Option<Regex>>,
}

impl PatternRule {
    pub const fn new(name: &'static str, pattern: &'static str) -> Self {
        Self {
            name,
            pattern,
            compiled: OnceLock::new(),
        }
    }

    pub fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| match Regex::new(self.pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(rule = self.name, error = %e, "Heuristic pattern failed to compile");
                    None
                }
            })
            .as_ref()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex().is_some_and(|re| re.is_match(text))
    }

    pub fn captures<'t>(&self, text: &'t str) -> Option<Captures<'t>> {
        self.regex()?.captures(text)
    }

    /// First capture group of the first match, parsed as a number.
    pub fn number(&self, text: &str) -> Option<f64> {
        parse_number(self.captures(text)?.get(1)?.as_str())
    }

    /// Like [`PatternRule::number`], but skips matches whose number is
    /// directly followed by a `%` sign (optionally after whitespace).
    pub fn number_without_percent(&self, text: &str) -> Option<f64> {
        let re = self.regex()?;
        re.captures_iter(text).find_map(|caps| {
            let number = caps.get(1)?;
            if text[number.end()..].trim_start().starts_with('%') {
                return None;
            }
            parse_number(number.as_str())
        })
    }
}

/// First rule in the list that produces a number wins.
pub fn first_number(rules: &[PatternRule], text: &str) -> Option<f64> {
    rules.iter().find_map(|rule| rule.number(text))
}

pub fn first_number_without_percent(rules: &[PatternRule], text: &str) -> Option<f64> {
    rules.iter().find_map(|rule| rule.number_without_percent(text))
}

pub fn any_match(rules: &[PatternRule], text: &str) -> bool {
    rules.iter().any(|rule| rule.is_match(text))
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

const DATE_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]"),
    format_description!("[year]/[month]/[day]"),
    format_description!("[month padding:none]/[day padding:none]/[year]"),
    format_description!("[month repr:long case_sensitive:false] [day padding:none], [year]"),
    format_description!("[month repr:short case_sensitive:false] [day padding:none], [year]"),
    format_description!("[month repr:long case_sensitive:false] [day padding:none] [year]"),
    format_description!("[month repr:short case_sensitive:false] [day padding:none] [year]"),
    format_description!("[day padding:none] [month repr:long case_sensitive:false] [year]"),
    format_description!("[day padding:none] [month repr:short case_sensitive:false] [year]"),
];

const LOCAL_DATETIME_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]"),
];

/// Parse free-form calendar text into a UTC timestamp.
///
/// Accepts RFC 3339, ISO dates and datetimes without offset, US-style
/// `MM/DD/YYYY` and English month names. Date-only input lands on
/// midnight UTC.
pub fn parse_calendar_date(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed.to_offset(UtcOffset::UTC));
    }

    for format in LOCAL_DATETIME_FORMATS {
        if let Ok(parsed) = PrimitiveDateTime::parse(raw, format) {
            return Some(parsed.assume_utc());
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = Date::parse(raw, format) {
            return Some(date.midnight().assume_utc());
        }
    }

    None
}

/// Normalise a date string to RFC 3339, or `None` when it doesn't parse.
pub fn normalize_date(raw: &str) -> Option<String> {
    parse_calendar_date(raw).and_then(|date| date.format(&Rfc3339).ok())
}
