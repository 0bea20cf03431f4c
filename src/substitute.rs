//! # Substitution
//!
//! Expands `${path.to.value}` tokens in text against the tournament and
//! player records of one recipient.
//!
//! ```
//! use diploma::substitute::{SubstitutionContext, resolve};
//! use serde_json::json;
//!
//! let ctx = SubstitutionContext::new(
//!     json!({"fullName": "Spring Open", "startsAt": "2024-03-15T10:00:00Z"}),
//!     json!({"rank": 1, "profile": {"name": "Ada"}}),
//! );
//! assert_eq!(
//!     resolve("${player.profile.name} won ${tournament.fullName} on ${tournament.date}", Some(&ctx)),
//!     "Ada won Spring Open on 3/15/2024",
//! );
//! ```
//!
//! Resolution never fails: anything that does not resolve to a scalar
//! becomes the empty string.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::{Captures, Regex};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt::Write;
use std::sync::OnceLock;

use crate::config::DateStyle;

/// Per-recipient data bound during thumbnail and export renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutionContext {
    pub tournament: Value,
    pub player: Value,
    pub dates: DateStyle,
}

impl SubstitutionContext {
    pub fn new(tournament: Value, player: Value) -> Self {
        Self {
            tournament,
            player,
            dates: DateStyle::default(),
        }
    }

    pub fn with_dates(mut self, dates: DateStyle) -> Self {
        self.dates = dates;
        self
    }

    fn root(&self, segment: &str) -> Option<&Value> {
        if segment.eq_ignore_ascii_case("tournament") {
            Some(&self.tournament)
        } else if segment.eq_ignore_ascii_case("player") {
            Some(&self.player)
        } else {
            None
        }
    }

    /// Scalar text for a dotted path, or `None` when it does not resolve.
    fn lookup(&self, path: &str) -> Option<String> {
        let mut segments = path.split('.');
        let root_name = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        if root_name.eq_ignore_ascii_case("tournament")
            && rest.len() == 1
            && rest[0].eq_ignore_ascii_case("date")
        {
            let starts_at = get_ignore_case(&self.tournament, "startsAt")?;
            return calendar_date(starts_at, &self.dates).map(|d| format_date(d, &self.dates));
        }

        let mut node = self.root(root_name)?;
        for segment in rest {
            node = get_ignore_case(node, segment)?;
        }
        scalar_text(node)
    }
}

fn token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\}")
            .expect("token pattern is a valid regex")
    })
}

/// Expand every `${...}` token in `text`.
///
/// Without a context the text comes back untouched, so the editor shows
/// raw tokens. Substituted values are not re-scanned.
pub fn resolve<'a>(text: &'a str, context: Option<&SubstitutionContext>) -> Cow<'a, str> {
    let Some(ctx) = context else {
        return Cow::Borrowed(text);
    };
    token_pattern().replace_all(text, |caps: &Captures<'_>| {
        ctx.lookup(&caps[1]).unwrap_or_default()
    })
}

/// Whether `text` contains at least one substitution token.
pub fn has_tokens(text: &str) -> bool {
    token_pattern().is_match(text)
}

/// Object member lookup, exact key first, then ASCII case-insensitive.
fn get_ignore_case<'v>(node: &'v Value, key: &str) -> Option<&'v Value> {
    let obj = node.as_object()?;
    let found = obj.get(key).or_else(|| {
        obj.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })?;
    (!found.is_null()).then_some(found)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Calendar date of a timestamp given as RFC 3339 text or epoch milliseconds.
pub fn calendar_date(starts_at: &Value, dates: &DateStyle) -> Option<NaiveDate> {
    let instant: DateTime<Utc> = match starts_at {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()?
            .with_timezone(&Utc),
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()?
        }
        _ => return None,
    };
    let offset = FixedOffset::east_opt(dates.utc_offset_minutes.saturating_mul(60))
        .or_else(|| FixedOffset::east_opt(0))?;
    Some(instant.with_timezone(&offset).date_naive())
}

/// Render a date with the configured pattern, falling back to the default
/// pattern when the configured one is invalid.
pub fn format_date(date: NaiveDate, dates: &DateStyle) -> String {
    let mut out = String::new();
    if write!(out, "{}", date.format(&dates.format)).is_ok() {
        return out;
    }
    tracing::warn!(format = %dates.format, "Invalid date format, using default");
    out.clear();
    let fallback = DateStyle::default();
    let _ = write!(out, "{}", date.format(&fallback.format));
    out
}
