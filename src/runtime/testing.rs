//! Mock implementations for testing
//!
//! These mocks enable pipeline and dispatcher tests without real I/O.

use super::traits::{AlertStore, ConversationStore, DatabaseStorage};
use crate::db::{
    Alert, AlertCreation, AlertFilter, AlertId, DbError, DbResult, FollowUp, FollowUpStatus,
    NewAlert, NewTurn, Sender, Turn, TurnId,
};
use crate::interpreter::{InterpretError, InterpretRequest, TurnInterpreter, TurnResult};
use crate::llm::{LlmError, LlmRequest, LlmResponse, LlmService};
use crate::notify::{Delivery, NotificationGateway, NotifyError};
use crate::state_machine::RiskLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock LLM Service
// ============================================================================

/// Mock LLM service that returns queued responses
pub struct MockLlmService {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    delay: Option<Duration>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmService {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering (for timeout tests)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::unknown("No more mock responses")))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Scripted Interpreter
// ============================================================================

/// Interpreter that plays back queued results, standing in for the model
#[derive(Default)]
pub struct ScriptedInterpreter {
    results: Mutex<VecDeque<(Option<Duration>, Result<TurnResult, InterpretError>)>>,
    requests: Mutex<Vec<InterpretRequest>>,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain result with no medication or media signals
    pub fn result(level: RiskLevel, reply: &str, reason: &str) -> TurnResult {
        TurnResult {
            reply: reply.to_string(),
            level,
            reason: reason.to_string(),
            medication_checked: false,
            medication_taken: None,
            play_media_keyword: None,
            show_media_keyword: None,
        }
    }

    pub fn queue(&self, result: TurnResult) -> &Self {
        self.results.lock().unwrap().push_back((None, Ok(result)));
        self
    }

    /// Queue a result the model takes `delay` to produce
    pub fn queue_delayed(&self, result: TurnResult, delay: Duration) -> &Self {
        self.results.lock().unwrap().push_back((Some(delay), Ok(result)));
        self
    }

    pub fn queue_error(&self, error: InterpretError) -> &Self {
        self.results.lock().unwrap().push_back((None, Err(error)));
        self
    }

    pub fn recorded_requests(&self) -> Vec<InterpretRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TurnInterpreter for ScriptedInterpreter {
    async fn interpret(&self, request: &InterpretRequest) -> Result<TurnResult, InterpretError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.results.lock().unwrap().pop_front();
        let Some((delay, result)) = next else {
            return Err(InterpretError::Unavailable);
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

// ============================================================================
// Recording Gateway
// ============================================================================

/// A notification as the gateway saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub target: String,
    pub title: String,
    pub body: String,
}

/// Gateway that records every send, optionally failing all of them
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<SentNotification>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn send(&self, target: &str, title: &str, body: &str) -> Result<Delivery, NotifyError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NotifyError::Transport("connection refused".to_string()));
        }
        self.sent.lock().unwrap().push(SentNotification {
            target: target.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(Delivery {
            success: true,
            message_id: format!("msg-{attempt}"),
        })
    }
}

// ============================================================================
// Faulty Storage
// ============================================================================

/// Database storage with injected faults: appends from one sender fail,
/// and the first few message-id lookups miss
#[derive(Clone)]
pub struct FaultyStorage {
    inner: DatabaseStorage,
    fail_sender: Option<Sender>,
    blind_lookups: Arc<AtomicUsize>,
}

impl FaultyStorage {
    pub fn new(inner: DatabaseStorage) -> Self {
        Self {
            inner,
            fail_sender: None,
            blind_lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_appends(mut self, sender: Sender) -> Self {
        self.fail_sender = Some(sender);
        self
    }

    /// The next `count` message-id lookups report nothing stored
    pub fn blind_lookups(self, count: usize) -> Self {
        self.blind_lookups.store(count, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl ConversationStore for FaultyStorage {
    async fn append_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> DbResult<Turn> {
        if self.fail_sender == Some(turn.sender) {
            return Err(DbError::InvalidTurn("disk full".to_string()));
        }
        self.inner.append_turn(turn, now).await
    }

    async fn recent_turns(&self, user_id: &str, limit: usize) -> DbResult<Vec<Turn>> {
        self.inner.recent_turns(user_id, limit).await
    }

    async fn turns_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Turn>> {
        self.inner.turns_between(user_id, start, end).await
    }

    async fn find_turn_by_message_id(&self, message_id: &str) -> DbResult<Option<Turn>> {
        let blinded = self
            .blind_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blinded {
            return Ok(None);
        }
        self.inner.find_turn_by_message_id(message_id).await
    }

    async fn reply_for(&self, turn_id: TurnId) -> DbResult<Option<Turn>> {
        self.inner.reply_for(turn_id).await
    }
}

#[async_trait]
impl AlertStore for FaultyStorage {
    async fn create_alert(&self, alert: &NewAlert) -> DbResult<AlertCreation> {
        self.inner.create_alert(alert).await
    }

    async fn resolve_alert(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        self.inner.resolve_alert(alert_id, now).await
    }

    async fn is_alert_resolved(&self, alert_id: AlertId) -> DbResult<bool> {
        self.inner.is_alert_resolved(alert_id).await
    }

    async fn get_alert(&self, alert_id: AlertId) -> DbResult<Alert> {
        self.inner.get_alert(alert_id).await
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> DbResult<Vec<Alert>> {
        self.inner.list_alerts(filter).await
    }

    async fn mark_alert_escalated(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        self.inner.mark_alert_escalated(alert_id, now).await
    }

    async fn claim_due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> DbResult<Vec<FollowUp>> {
        self.inner.claim_due_follow_ups(now, limit).await
    }

    async fn complete_follow_up(
        &self,
        alert_id: AlertId,
        outcome: FollowUpStatus,
    ) -> DbResult<bool> {
        self.inner.complete_follow_up(alert_id, outcome).await
    }

    async fn interrupted_follow_ups(&self) -> DbResult<Vec<FollowUp>> {
        self.inner.interrupted_follow_ups().await
    }

    async fn requeue_follow_up(&self, alert_id: AlertId) -> DbResult<bool> {
        self.inner.requeue_follow_up(alert_id).await
    }
}
