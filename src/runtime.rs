//! Chat pipeline runtime
//!
//! One inbound message runs interpret, store, escalate before the reply
//! returns. Every failure along the way degrades to the fallback reply or a
//! skipped escalation; the user always gets an answer.

mod executor;
mod follow_up;
mod recovery;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{EscalationEngine, EscalationError};
pub use follow_up::{FollowUpSweeper, SweepReport};
pub use recovery::{recover_follow_ups, RecoveryDecision};
pub use traits::*;

use crate::config::CareConfig;
use crate::db::{DbError, NewTurn, Turn, TurnId};
use crate::interpreter::{
    HistoryEntry, InterpretError, InterpretRequest, TurnInterpreter, TurnResult, FALLBACK_REPLY,
};
use crate::medication::MedicationTracker;
use crate::notify::Outbox;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// Inbound chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInput {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub guardian_contact: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Client idempotency key; a retry with the same key replays the reply
    #[serde(default)]
    pub message_id: Option<String>,
}

/// What the user sees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub reply: String,
    pub play_media_keyword: Option<String>,
    pub show_media_keyword: Option<String>,
    /// The stored ai turn, when it could be written
    pub turn_id: Option<TurnId>,
    pub replayed: bool,
}

impl ChatReply {
    fn fresh(reply: String, result: Option<&TurnResult>, turn_id: Option<TurnId>) -> Self {
        Self {
            reply,
            play_media_keyword: result.and_then(|r| r.play_media_keyword.clone()),
            show_media_keyword: result.and_then(|r| r.show_media_keyword.clone()),
            turn_id,
            replayed: false,
        }
    }
}

/// Interpret, store and escalate user messages
pub struct CareRuntime<S, I> {
    store: S,
    interpreter: I,
    engine: EscalationEngine<S>,
    medication: MedicationTracker<S>,
    history_limit: usize,
    utc_offset: FixedOffset,
    default_guardian: Option<String>,
}

impl<S: Storage + Clone, I: TurnInterpreter> CareRuntime<S, I> {
    pub fn new(store: S, interpreter: I, outbox: Outbox, config: &CareConfig) -> Self {
        Self {
            engine: EscalationEngine::new(store.clone(), outbox, config.escalation.clone()),
            medication: MedicationTracker::new(store.clone()),
            store,
            interpreter,
            history_limit: config.history_limit,
            utc_offset: config.utc_offset,
            default_guardian: config.default_guardian.clone(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &EscalationEngine<S> {
        &self.engine
    }

    pub fn medication(&self) -> &MedicationTracker<S> {
        &self.medication
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    pub async fn handle_message(&self, input: ChatInput) -> ChatReply {
        self.handle_message_at(input, Utc::now()).await
    }

    pub async fn handle_message_at(&self, input: ChatInput, now: DateTime<Utc>) -> ChatReply {
        let guardian = input
            .guardian_contact
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .or(self.default_guardian.as_deref())
            .map(String::from);

        // A retried request either replays its stored reply or resumes
        // after a user turn whose answer was never written
        let mut message_id = input.message_id.clone();
        let mut resumed = None;
        if let Some(id) = &input.message_id {
            match self.check_retry(&input.user_id, id, guardian.as_deref(), now).await {
                Retry::Replay(reply) => return reply,
                Retry::Resume(turn) => resumed = Some(turn),
                Retry::Fresh => {}
                Retry::Foreign => message_id = None,
            }
        }

        let history = self.history(&input.user_id, resumed.as_ref()).await;
        let medication_confirmed_today = self
            .medication
            .is_confirmed_today(&input.user_id, now, self.utc_offset)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(user_id = %input.user_id, error = %e, "Medication lookup failed");
                false
            });

        let user_turn = match resumed {
            Some(turn) => Some(turn),
            None => match self.append_user_turn(&input, message_id, now).await {
                Ok(turn) => Some(turn),
                // A concurrent attempt of the same message stored it first
                Err(DbError::DuplicateMessage(id)) => {
                    match self.check_retry(&input.user_id, &id, guardian.as_deref(), now).await {
                        Retry::Replay(reply) => return reply,
                        Retry::Resume(turn) => Some(turn),
                        Retry::Fresh | Retry::Foreign => None,
                    }
                }
                Err(e) => {
                    tracing::error!(user_id = %input.user_id, error = %e, "Failed to store user turn");
                    None
                }
            },
        };

        let request = InterpretRequest {
            user_id: input.user_id.clone(),
            display_name: input.display_name.clone(),
            message: input.message.clone(),
            recent_history: history,
            medication_confirmed_today,
        };
        let result = match self.interpreter.interpret(&request).await {
            Ok(result) => Some(result),
            Err(e) => {
                log_interpret_error(&input.user_id, &e);
                None
            }
        };

        let reply = result
            .as_ref()
            .map_or_else(|| FALLBACK_REPLY.to_string(), |r| r.reply.clone());

        // Signals only ever describe a stored user turn
        let mut ai_turn = NewTurn::ai(&input.user_id, &reply);
        if let Some(user_turn) = &user_turn {
            ai_turn = ai_turn.replying_to(user_turn.turn_id);
            if let Some(result) = &result {
                ai_turn = ai_turn.with_signals(result.signals());
            }
        }
        let ai_turn = match self.store.append_turn(&ai_turn, now).await {
            Ok(turn) => Some(turn),
            Err(DbError::DuplicateReply(answered)) => {
                tracing::info!(
                    user_id = %input.user_id,
                    turn_id = %answered,
                    "Another attempt answered this message first"
                );
                if let Some(user_turn) = &user_turn {
                    if let Some(reply) = self.replay(user_turn, guardian.as_deref(), now).await {
                        return reply;
                    }
                }
                None
            }
            Err(e) => {
                tracing::error!(user_id = %input.user_id, error = %e, "Failed to store ai turn");
                None
            }
        };

        match (&user_turn, &ai_turn, &result) {
            (Some(_), Some(ai_turn), Some(result)) => {
                self.escalate(ai_turn.turn_id, &input.user_id, result, guardian.as_deref(), now)
                    .await;
            }
            (_, _, Some(result)) if result.level.is_alerting() => {
                tracing::error!(
                    user_id = %input.user_id,
                    level = %result.level,
                    "Turn not stored, escalation skipped"
                );
            }
            _ => {}
        }

        ChatReply::fresh(reply, result.as_ref(), ai_turn.map(|t| t.turn_id))
    }

    /// Stored reply for an already-answered user turn, re-running the
    /// idempotent escalation in case the first attempt died midway
    async fn replay(
        &self,
        user_turn: &Turn,
        guardian: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ChatReply> {
        let ai_turn = match self.store.reply_for(user_turn.turn_id).await {
            Ok(turn) => turn?,
            Err(e) => {
                tracing::error!(turn_id = %user_turn.turn_id, error = %e, "Replay lookup failed");
                return None;
            }
        };

        if let Some(signals) = &ai_turn.signals {
            if let Err(e) = self
                .engine
                .evaluate(ai_turn.turn_id, &ai_turn.user_id, signals, guardian, now)
                .await
            {
                tracing::error!(turn_id = %ai_turn.turn_id, error = %e, "Replay escalation failed");
            }
        }

        tracing::info!(
            user_id = %user_turn.user_id,
            turn_id = %ai_turn.turn_id,
            "Replayed stored reply"
        );
        Some(ChatReply {
            reply: ai_turn.text,
            play_media_keyword: None,
            show_media_keyword: None,
            turn_id: Some(ai_turn.turn_id),
            replayed: true,
        })
    }

    async fn history(&self, user_id: &str, before: Option<&Turn>) -> Vec<HistoryEntry> {
        match self.store.recent_turns(user_id, self.history_limit).await {
            Ok(turns) => turns
                .into_iter()
                .filter(|t| !before.is_some_and(|b| t.turn_id >= b.turn_id))
                .map(|t| HistoryEntry {
                    time: t.timestamp,
                    speaker: t.sender,
                    text: t.text,
                })
                .collect(),
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to load history");
                Vec::new()
            }
        }
    }

    async fn append_user_turn(
        &self,
        input: &ChatInput,
        message_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Turn, DbError> {
        let turn = NewTurn::user(&input.user_id, &input.message).with_message_id(message_id);
        self.store.append_turn(&turn, now).await
    }

    /// Classify a request whose message id may already be stored
    async fn check_retry(
        &self,
        user_id: &str,
        message_id: &str,
        guardian: Option<&str>,
        now: DateTime<Utc>,
    ) -> Retry {
        match self.store.find_turn_by_message_id(message_id).await {
            Ok(Some(turn)) if turn.user_id == user_id => {
                match self.replay(&turn, guardian, now).await {
                    Some(reply) => Retry::Replay(reply),
                    None => Retry::Resume(turn),
                }
            }
            Ok(Some(_)) => {
                tracing::warn!(
                    user_id = %user_id,
                    message_id = %message_id,
                    "Message id belongs to another user, ignoring it"
                );
                Retry::Foreign
            }
            Ok(None) => Retry::Fresh,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Replay lookup failed");
                Retry::Fresh
            }
        }
    }

    async fn escalate(
        &self,
        turn_id: TurnId,
        user_id: &str,
        result: &TurnResult,
        guardian: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let signals = result.signals();
        match self
            .engine
            .evaluate(turn_id, user_id, &signals, guardian, now)
            .await
        {
            Ok(effects) if !effects.is_empty() => {
                tracing::info!(
                    user_id = %user_id,
                    turn_id = %turn_id,
                    level = %result.level,
                    effects = effects.len(),
                    "Escalation evaluated"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(user_id = %user_id, turn_id = %turn_id, error = %e, "Escalation failed");
            }
        }
    }
}

/// How a request relates to an earlier attempt with the same message id
enum Retry {
    /// Already answered
    Replay(ChatReply),
    /// User turn stored, no answer yet
    Resume(Turn),
    /// Never seen
    Fresh,
    /// The id was used by someone else
    Foreign,
}

fn log_interpret_error(user_id: &str, error: &InterpretError) {
    match error {
        InterpretError::InvalidRiskLevel(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Model returned invalid risk level");
        }
        InterpretError::Unavailable => {
            tracing::warn!(user_id = %user_id, "No model configured, using fallback reply");
        }
        e => tracing::error!(user_id = %user_id, error = %e, "Interpretation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FaultyStorage, ScriptedInterpreter};
    use super::*;
    use crate::db::{AlertFilter, Database, Sender};
    use crate::notify::{outbox, Notification};
    use crate::state_machine::{NotifyTarget, RiskLevel};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    const USER: &str = "kim-grandma-01";

    fn t0() -> DateTime<Utc> {
        // 09:00 KST
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn input(message: &str) -> ChatInput {
        ChatInput {
            user_id: USER.to_string(),
            message: message.to_string(),
            guardian_contact: Some("010-1234-5678".to_string()),
            display_name: None,
            message_id: None,
        }
    }

    struct Harness<S> {
        db: Database,
        interpreter: Arc<ScriptedInterpreter>,
        runtime: CareRuntime<S, Arc<ScriptedInterpreter>>,
        rx: UnboundedReceiver<Notification>,
    }

    impl<S: Storage + Clone> Harness<S> {
        fn with_store(db: Database, store: S) -> Self {
            let interpreter = Arc::new(ScriptedInterpreter::new());
            let (tx, rx) = outbox();
            let runtime = CareRuntime::new(store, interpreter.clone(), tx, &CareConfig::default());
            Self {
                db,
                interpreter,
                runtime,
                rx,
            }
        }

        fn drain(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(n) = self.rx.try_recv() {
                out.push(n);
            }
            out
        }
    }

    fn harness() -> Harness<DatabaseStorage> {
        let db = Database::open_in_memory().unwrap();
        Harness::with_store(db.clone(), DatabaseStorage::new(db))
    }

    #[tokio::test]
    async fn test_fallback_reply_on_interpreter_failure() {
        let mut h = harness();
        h.interpreter
            .queue_error(InterpretError::Malformed("not json".to_string()));

        let reply = h.runtime.handle_message_at(input("반디야"), t0()).await;
        assert_eq!(reply.reply, FALLBACK_REPLY);
        assert!(!reply.replayed);

        let turns = h.db.recent_turns(USER, 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].sender, Sender::Ai);
        assert!(turns[1].signals.is_none());
        assert_eq!(turns[1].reply_to, Some(turns[0].turn_id));
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_level_never_escalates() {
        let mut h = harness();
        h.interpreter
            .queue_error(InterpretError::InvalidRiskLevel(crate::state_machine::InvalidRiskLevel(7)));

        let reply = h.runtime.handle_message_at(input("살려줘"), t0()).await;
        assert_eq!(reply.reply, FALLBACK_REPLY);
        assert!(h.drain().is_empty());
        assert!(h.db.list_alerts(&AlertFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concern_notifies_guardian_once() {
        let mut h = harness();
        h.interpreter.queue(ScriptedInterpreter::result(
            RiskLevel::Concern,
            "할머니 오늘 많이 힘드셨어요?",
            "possible low mood",
        ));

        let reply = h
            .runtime
            .handle_message_at(input("아무것도 하기 싫어"), t0())
            .await;
        assert_eq!(reply.reply, "할머니 오늘 많이 힘드셨어요?");

        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, NotifyTarget::Guardian("010-1234-5678".to_string()));
        assert_eq!(sent[0].body, "사유: possible low mood");

        let alerts = h.db.list_alerts(&AlertFilter::default()).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(Some(alerts[0].turn_id), reply.turn_id);
    }

    #[tokio::test]
    async fn test_default_guardian_used_when_request_has_none() {
        let db = Database::open_in_memory().unwrap();
        let interpreter = Arc::new(ScriptedInterpreter::new());
        let (tx, mut rx) = outbox();
        let config = CareConfig {
            default_guardian: Some("010-9999-0000".to_string()),
            ..CareConfig::default()
        };
        let runtime = CareRuntime::new(DatabaseStorage::new(db), interpreter.clone(), tx, &config);
        interpreter.queue(ScriptedInterpreter::result(RiskLevel::Concern, "네", "r"));

        let mut msg = input("힘들어");
        msg.guardian_contact = Some("   ".to_string());
        runtime.handle_message_at(msg, t0()).await;

        let sent = rx.try_recv().unwrap();
        assert_eq!(sent.target, NotifyTarget::Guardian("010-9999-0000".to_string()));
    }

    #[tokio::test]
    async fn test_medication_confirmation_reaches_prompt_same_day_only() {
        let h = harness();
        let mut confirmed = ScriptedInterpreter::result(RiskLevel::Normal, "잘하셨어요!", "");
        confirmed.medication_checked = true;
        confirmed.medication_taken = Some(true);
        h.interpreter.queue(confirmed);
        h.interpreter
            .queue(ScriptedInterpreter::result(RiskLevel::Normal, "네", ""));
        h.interpreter
            .queue(ScriptedInterpreter::result(RiskLevel::Normal, "네", ""));

        h.runtime
            .handle_message_at(input("혈압약 먹었다"), t0())
            .await;
        h.runtime
            .handle_message_at(input("점심 먹었어"), t0() + Duration::hours(3))
            .await;
        // 00:30 KST the next day
        h.runtime
            .handle_message_at(input("잘 잤어"), t0() + Duration::hours(15) + Duration::minutes(30))
            .await;

        let requests = h.interpreter.recorded_requests();
        assert!(!requests[0].medication_confirmed_today);
        assert!(requests[1].medication_confirmed_today);
        assert!(!requests[2].medication_confirmed_today);
        assert_eq!(requests[1].recent_history.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_with_message_id_replays() {
        let mut h = harness();
        h.interpreter.queue(ScriptedInterpreter::result(
            RiskLevel::Emergency,
            "바로 도움을 요청할게요",
            "넘어지셨어요",
        ));
        let mut msg = input("넘어졌어 일어날 수가 없어");
        msg.message_id = Some("m-1".to_string());

        let first = h.runtime.handle_message_at(msg.clone(), t0()).await;
        let second = h
            .runtime
            .handle_message_at(msg, t0() + Duration::seconds(5))
            .await;

        assert!(second.replayed);
        assert_eq!(second.reply, first.reply);
        assert_eq!(second.turn_id, first.turn_id);
        assert_eq!(h.db.recent_turns(USER, 10).unwrap().len(), 2);
        assert_eq!(h.interpreter.recorded_requests().len(), 1);

        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].target.is_agency());
    }

    #[tokio::test]
    async fn test_retry_while_first_attempt_in_flight() {
        let mut h = harness();
        h.interpreter.queue_delayed(
            ScriptedInterpreter::result(RiskLevel::Concern, "할머니 괜찮으세요?", "low mood"),
            std::time::Duration::from_millis(200),
        );
        h.interpreter.queue(ScriptedInterpreter::result(
            RiskLevel::Concern,
            "할머니 괜찮으세요?",
            "low mood",
        ));
        let mut msg = input("다 귀찮아");
        msg.message_id = Some("m-1".to_string());

        let (first, second) = tokio::join!(
            h.runtime.handle_message_at(msg.clone(), t0()),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                h.runtime.handle_message_at(msg.clone(), t0()).await
            }
        );

        assert!(first.turn_id.is_some());
        assert_eq!(first.turn_id, second.turn_id);
        assert!(first.replayed != second.replayed);

        let turns = h.db.recent_turns(USER, 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].reply_to, Some(turns[0].turn_id));
        assert_eq!(h.db.list_alerts(&AlertFilter::default()).unwrap().len(), 1);
        assert_eq!(h.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_losing_the_user_turn_race_replays_winner() {
        let db = Database::open_in_memory().unwrap();
        // Both attempts miss each other on the first lookup
        let store = FaultyStorage::new(DatabaseStorage::new(db.clone())).blind_lookups(2);
        let mut h = Harness::with_store(db, store);
        h.interpreter.queue(ScriptedInterpreter::result(
            RiskLevel::Emergency,
            "바로 도움을 요청할게요",
            "넘어지셨어요",
        ));
        let mut msg = input("넘어졌어");
        msg.message_id = Some("m-1".to_string());

        let first = h.runtime.handle_message_at(msg.clone(), t0()).await;
        let second = h.runtime.handle_message_at(msg, t0()).await;

        assert!(second.replayed);
        assert_eq!(second.turn_id, first.turn_id);
        assert_eq!(h.interpreter.recorded_requests().len(), 1);

        let turns = h.db.recent_turns(USER, 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.sender == Sender::User || t.reply_to.is_some()));
        assert_eq!(h.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_message_id_is_not_reused() {
        let h = harness();
        h.interpreter
            .queue(ScriptedInterpreter::result(RiskLevel::Normal, "네", ""))
            .queue(ScriptedInterpreter::result(RiskLevel::Normal, "반가워요", ""));
        let mut theirs = input("안녕");
        theirs.user_id = "park-grandpa-02".to_string();
        theirs.message_id = Some("m-1".to_string());
        h.runtime.handle_message_at(theirs, t0()).await;

        let mut mine = input("안녕");
        mine.message_id = Some("m-1".to_string());
        let reply = h.runtime.handle_message_at(mine, t0()).await;

        assert!(!reply.replayed);
        assert_eq!(reply.reply, "반가워요");
        let turns = h.db.recent_turns(USER, 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].message_id, None);
        assert_eq!(turns[1].reply_to, Some(turns[0].turn_id));
    }

    #[tokio::test]
    async fn test_unwritten_ai_turn_skips_escalation() {
        let db = Database::open_in_memory().unwrap();
        let store = FaultyStorage::new(DatabaseStorage::new(db.clone())).failing_appends(Sender::Ai);
        let mut h = Harness::with_store(db, store);
        h.interpreter.queue(ScriptedInterpreter::result(
            RiskLevel::Emergency,
            "괜찮으세요?",
            "쓰러짐",
        ));

        let reply = h.runtime.handle_message_at(input("어지러워"), t0()).await;
        assert_eq!(reply.reply, "괜찮으세요?");
        assert_eq!(reply.turn_id, None);
        assert!(h.drain().is_empty());
        assert!(h.db.list_alerts(&AlertFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unwritten_user_turn_skips_escalation() {
        let db = Database::open_in_memory().unwrap();
        let store = FaultyStorage::new(DatabaseStorage::new(db.clone())).failing_appends(Sender::User);
        let mut h = Harness::with_store(db, store);
        h.interpreter
            .queue(ScriptedInterpreter::result(RiskLevel::Concern, "네", "r"));

        let reply = h.runtime.handle_message_at(input("힘들어"), t0()).await;
        assert!(reply.turn_id.is_some());
        assert!(h.drain().is_empty());
    }
}
