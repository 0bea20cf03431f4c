//! Tournaments and the recipients a diploma is rendered for.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::DateStyle;
use crate::substitute::{SubstitutionContext, calendar_date};

/// The event a batch of diplomas is issued for.
///
/// Only the attributes the engine reads are typed; the rest is kept so
/// templates can reference it through `${tournament.*}` tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    /// RFC 3339 string or epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// One player who gets a diploma.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub profile: Value,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Tournament {
    /// Players of a lichess-style record, from `standing.players`.
    ///
    /// Players without an `id` are identified by their `name`. Entries that
    /// are not objects are skipped.
    pub fn recipients(&self) -> Vec<Recipient> {
        let Some(players) = self
            .rest
            .get("standing")
            .and_then(|s| s.get("players"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        players
            .iter()
            .filter_map(|player| match Recipient::deserialize(player) {
                Ok(mut recipient) => {
                    if recipient.id.is_empty()
                        && let Some(name) = recipient.rest.get("name").and_then(Value::as_str)
                    {
                        recipient.id = name.to_string();
                    }
                    Some(recipient)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed player");
                    None
                }
            })
            .collect()
    }

    /// Display name used in filenames: `fullName`, else the id.
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.id)
    }

    /// Calendar date the tournament starts on, if `startsAt` is usable.
    pub fn start_date(&self, dates: &DateStyle) -> Option<NaiveDate> {
        calendar_date(self.starts_at.as_ref()?, dates)
    }
}

impl SubstitutionContext {
    /// Context for rendering `recipient`'s diploma of `tournament`.
    pub fn for_recipient(tournament: &Tournament, recipient: &Recipient, dates: &DateStyle) -> Self {
        let tournament = serde_json::to_value(tournament).unwrap_or_default();
        let player = serde_json::to_value(recipient).unwrap_or_default();
        SubstitutionContext::new(tournament, player).with_dates(dates.clone())
    }
}

/// `YYYY-MM-DD-<fullName>-<rank>.png`
///
/// Path separators in the name become `-`. Without a usable start date
/// today's UTC date is used.
pub fn export_filename(tournament: &Tournament, recipient: &Recipient, dates: &DateStyle) -> String {
    let date = tournament
        .start_date(dates)
        .unwrap_or_else(|| Utc::now().date_naive());
    let name: String = tournament
        .display_name()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '-' } else { c })
        .collect();
    format!("{}-{}-{}.png", date.format("%Y-%m-%d"), name, recipient.rank)
}
