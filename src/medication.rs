//! Daily medication adherence, derived from the turn log
//!
//! Nothing is stored: "confirmed today" is recomputed from the local day's
//! ai turns on every check, so it resets by itself at local midnight.

use crate::db::{DbError, Sender, Turn};
use crate::runtime::ConversationStore;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

/// Phrases that show the user talking about their medicine
const MEDICATION_KEYWORDS: [&str; 4] = ["약 먹었니", "혈압약", "깜빡", "먹었다"];

/// UTC bounds of one local calendar day, `start <= t < end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBounds {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The local calendar day containing `as_of`
pub fn local_day_bounds(as_of: DateTime<Utc>, offset: FixedOffset) -> DayBounds {
    let date = as_of.with_timezone(&offset).date_naive();
    let local_midnight = date.and_time(NaiveTime::MIN);
    let start = (local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc();
    DayBounds {
        date,
        start,
        end: start + Duration::days(1),
    }
}

/// True iff some ai turn carries `medicationChecked` and `medicationTaken == true`
pub fn confirmed_in(turns: &[Turn]) -> bool {
    turns
        .iter()
        .filter(|t| t.sender == Sender::Ai)
        .filter_map(|t| t.signals.as_ref())
        .any(crate::db::TurnSignals::confirms_medication)
}

/// Whether the user brought up their medicine in their own words
pub fn mentions_medication(text: &str) -> bool {
    MEDICATION_KEYWORDS.iter().any(|k| text.contains(k))
}

/// Answers "has medication been confirmed today" for a user
#[derive(Clone)]
pub struct MedicationTracker<S> {
    store: S,
}

impl<S: ConversationStore> MedicationTracker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn is_confirmed_today(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<bool, DbError> {
        let day = local_day_bounds(as_of, offset);
        let turns = self.store.turns_between(user_id, day.start, day.end).await?;
        Ok(confirmed_in(&turns))
    }
}
