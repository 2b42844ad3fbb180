//! Caregiver-facing daily report ("오늘의 곁 리포트")
//!
//! Built on demand from the local day's turns and the user's alert ledger.

use crate::db::{AlertFilter, DbError, Sender, Turn};
use crate::medication::{confirmed_in, local_day_bounds, mentions_medication};
use crate::runtime::Storage;
use crate::state_machine::{project_care_state, CareState, RiskLevel};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const EMPTY_DAY_SUMMARY: &str =
    "오늘 대화 기록이 아직 없어요. 할머니께 먼저 말을 건네보라고 반디에게 시켜볼까요?";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub user_id: String,
    /// Local calendar date the report covers
    pub date: NaiveDate,
    /// Messages the user sent that day
    pub conversation_count: usize,
    pub medication_confirmed: bool,
    /// The user brought up their medicine themselves
    pub medication_mentioned: bool,
    pub highest_risk: Option<RiskLevel>,
    pub open_alerts: usize,
    /// `safe`, `watch` or `emergency`
    pub status: String,
    pub care_state: CareState,
    pub mood: String,
    pub summary: String,
}

/// Build the report for the local day containing `as_of`
pub async fn daily_report<S: Storage>(
    store: &S,
    user_id: &str,
    as_of: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<DailyReport, DbError> {
    let day = local_day_bounds(as_of, offset);
    let turns = store.turns_between(user_id, day.start, day.end).await?;
    let alerts = store
        .list_alerts(&AlertFilter {
            user_id: Some(user_id.to_string()),
            unresolved_only: true,
            limit: None,
        })
        .await?;

    let care_state = project_care_state(&alerts);
    Ok(summarize(user_id, day.date, &turns, alerts.len(), care_state))
}

/// Pure part of the report, over one day's turns
pub fn summarize(
    user_id: &str,
    date: NaiveDate,
    turns: &[Turn],
    open_alerts: usize,
    care_state: CareState,
) -> DailyReport {
    let user_turns: Vec<&Turn> = turns.iter().filter(|t| t.sender == Sender::User).collect();
    let conversation_count = user_turns.len();
    let medication_confirmed = confirmed_in(turns);
    let medication_mentioned = user_turns.iter().any(|t| mentions_medication(&t.text));
    let highest_risk = turns
        .iter()
        .filter_map(|t| t.signals.as_ref())
        .map(|s| s.risk_level)
        .max();

    let (mood, summary) = if conversation_count == 0 {
        ("조용함".to_string(), EMPTY_DAY_SUMMARY.to_string())
    } else {
        let mut summary = format!("오늘 할머니는 총 {conversation_count}번 반디와 대화하셨어요.");
        summary.push_str(match (medication_confirmed, medication_mentioned) {
            (true, _) => " 약도 잘 챙겨 드셨답니다!",
            (false, true) => " 약 이야기를 하셨지만 복용은 아직 확인되지 않았어요.",
            (false, false) => " 오늘 약 복용은 아직 확인되지 않았어요.",
        });
        let (mood, tail) = match highest_risk {
            Some(RiskLevel::Emergency) => ("위험", " 응급 신호가 있었어요. 알림을 꼭 확인해 주세요."),
            Some(RiskLevel::Concern) => (
                "처짐",
                " 기운이 없어 보이는 순간이 있었어요. 안부 전화 한 통 어떠세요?",
            ),
            _ => ("평온", " 기분은 전반적으로 밝으셨습니다."),
        };
        summary.push_str(tail);
        (mood.to_string(), summary)
    };

    DailyReport {
        user_id: user_id.to_string(),
        date,
        conversation_count,
        medication_confirmed,
        medication_mentioned,
        highest_risk,
        open_alerts,
        status: care_state.label().to_string(),
        care_state,
        mood,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewAlert, NewTurn, TurnSignals};
    use crate::runtime::DatabaseStorage;
    use chrono::{Duration, TimeZone};

    const USER: &str = "kim-grandma-01";

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        // 10:00 KST
        Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap()
    }

    fn signals(level: RiskLevel, medication: bool) -> TurnSignals {
        TurnSignals {
            risk_level: level,
            reason: "r".to_string(),
            medication_checked: medication,
            medication_taken: medication.then_some(true),
        }
    }

    fn exchange(db: &Database, text: &str, sig: TurnSignals, at: DateTime<Utc>) -> Turn {
        let user = db.append_turn(&NewTurn::user(USER, text), at).unwrap();
        db.append_turn(
            &NewTurn::ai(USER, "네 할머니")
                .replying_to(user.turn_id)
                .with_signals(sig),
            at,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_day() {
        let store = DatabaseStorage::new(Database::open_in_memory().unwrap());
        let report = daily_report(&store, USER, t0(), kst()).await.unwrap();
        assert_eq!(report.conversation_count, 0);
        assert_eq!(report.summary, EMPTY_DAY_SUMMARY);
        assert_eq!(report.status, "safe");
        assert_eq!(report.highest_risk, None);
    }

    #[tokio::test]
    async fn test_counts_only_local_day_user_turns() {
        let db = Database::open_in_memory().unwrap();
        // 23:00 KST the day before
        exchange(&db, "잘 자", signals(RiskLevel::Normal, false), t0() - Duration::hours(11));
        exchange(&db, "혈압약 먹었다", signals(RiskLevel::Normal, true), t0());
        exchange(&db, "산책 갈까", signals(RiskLevel::Normal, false), t0() + Duration::hours(2));

        let store = DatabaseStorage::new(db);
        let report = daily_report(&store, USER, t0() + Duration::hours(3), kst())
            .await
            .unwrap();
        assert_eq!(report.date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(report.conversation_count, 2);
        assert!(report.medication_confirmed);
        assert!(report.medication_mentioned);
        assert_eq!(report.highest_risk, Some(RiskLevel::Normal));
        assert!(report.summary.contains("총 2번"));
        assert!(report.summary.contains("약도 잘 챙겨 드셨답니다"));
    }

    #[tokio::test]
    async fn test_open_alert_sets_status() {
        let db = Database::open_in_memory().unwrap();
        let ai = exchange(&db, "기운이 없어", signals(RiskLevel::Concern, false), t0());
        db.create_alert(&NewAlert {
            user_id: USER.to_string(),
            turn_id: ai.turn_id,
            level: RiskLevel::Concern,
            reason: "r".to_string(),
            created_at: t0(),
            follow_up_due: Some(t0() + Duration::minutes(20)),
        })
        .unwrap();

        let store = DatabaseStorage::new(db);
        let report = daily_report(&store, USER, t0(), kst()).await.unwrap();
        assert_eq!(report.open_alerts, 1);
        assert_eq!(report.status, "watch");
        assert_eq!(report.mood, "처짐");
        assert!(report.summary.contains("안부 전화"));
        assert!(report.summary.contains("아직 확인되지 않았어요"));
    }
}
