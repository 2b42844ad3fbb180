//! Property-based tests for the escalation state machine
//!
//! A tiny in-memory ledger stands in for the alert store so whole
//! evaluate loops can be driven without I/O.

use super::transition::*;
use super::*;
use crate::db::{AlertId, FollowUpStatus, TurnId};
use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> EscalationContext {
    EscalationContext::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        Duration::minutes(20),
        "agency_admin",
    )
}

#[derive(Default)]
struct Ledger {
    by_turn: HashMap<TurnId, AlertId>,
    follow_ups: HashSet<AlertId>,
    notifications: Vec<NotifyTarget>,
}

impl Ledger {
    /// Run an event and every event its effects produce
    fn evaluate(&mut self, context: &EscalationContext, event: Event) {
        let mut queue = vec![event];
        while let Some(event) = queue.pop() {
            let result = transition(context, event).expect("transition failed");
            for effect in result.effects {
                match effect {
                    Effect::CreateAlert {
                        user_id,
                        turn_id,
                        level,
                        reason,
                        guardian_contact,
                        follow_up_due,
                    } => {
                        let next_id = AlertId(i64::try_from(self.by_turn.len()).unwrap() + 1);
                        let fresh = !self.by_turn.contains_key(&turn_id);
                        let alert_id = *self.by_turn.entry(turn_id).or_insert(next_id);
                        if fresh && follow_up_due.is_some() {
                            self.follow_ups.insert(alert_id);
                        }
                        queue.push(Event::AlertRecorded {
                            alert_id,
                            turn_id,
                            user_id,
                            level,
                            reason,
                            guardian_contact,
                            fresh,
                        });
                    }
                    Effect::Notify { target, .. } => self.notifications.push(target),
                    Effect::GuardianUnreachable { .. }
                    | Effect::MarkEscalated { .. }
                    | Effect::CloseFollowUp { .. } => {}
                }
            }
        }
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_level() -> impl Strategy<Value = RiskLevel> {
    prop_oneof![
        Just(RiskLevel::Normal),
        Just(RiskLevel::Concern),
        Just(RiskLevel::Emergency),
    ]
}

fn arb_turn_event() -> impl Strategy<Value = Event> {
    (1i64..20, arb_level(), "[a-z ]{1,20}", proptest::option::of("010-[0-9]{4}-[0-9]{4}"))
        .prop_map(|(turn, level, reason, guardian)| Event::TurnInterpreted {
            turn_id: TurnId(turn),
            user_id: "kim-grandma-01".to_string(),
            level,
            reason,
            guardian_contact: guardian,
        })
}

fn level_of(event: &Event) -> Option<(TurnId, RiskLevel)> {
    match event {
        Event::TurnInterpreted { turn_id, level, .. } => Some((*turn_id, *level)),
        _ => None,
    }
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Level 1 never produces an alert or a notification
    #[test]
    fn prop_normal_turns_are_silent(event in arb_turn_event()) {
        let mut event = event;
        if let Event::TurnInterpreted { level, .. } = &mut event {
            *level = RiskLevel::Normal;
        }
        let mut ledger = Ledger::default();
        ledger.evaluate(&test_context(), event);
        prop_assert!(ledger.by_turn.is_empty());
        prop_assert!(ledger.notifications.is_empty());
    }

    /// Re-evaluating the same turn never adds alerts or notifications
    #[test]
    fn prop_evaluate_is_idempotent(event in arb_turn_event(), repeats in 2usize..5) {
        let context = test_context();
        let mut once = Ledger::default();
        once.evaluate(&context, event.clone());

        let mut many = Ledger::default();
        for _ in 0..repeats {
            many.evaluate(&context, event.clone());
        }

        prop_assert_eq!(once.by_turn.len(), many.by_turn.len());
        prop_assert_eq!(once.notifications, many.notifications);
        prop_assert!(many.by_turn.len() <= 1);
    }

    /// One alert per distinct alerting turn; emergencies reach only the agency
    #[test]
    fn prop_one_alert_per_turn(events in proptest::collection::vec(arb_turn_event(), 0..30)) {
        let context = test_context();
        let mut ledger = Ledger::default();

        // The first evaluation of a turn is the one that counts
        let mut first_level: HashMap<TurnId, RiskLevel> = HashMap::new();
        for event in &events {
            if let Some((turn, level)) = level_of(event) {
                if level.is_alerting() {
                    first_level.entry(turn).or_insert(level);
                }
            }
        }

        for event in events {
            ledger.evaluate(&context, event);
        }

        prop_assert_eq!(ledger.by_turn.len(), first_level.len());

        let agency = ledger.notifications.iter().filter(|t| t.is_agency()).count();
        let emergencies = first_level.values().filter(|l| **l == RiskLevel::Emergency).count();
        prop_assert_eq!(agency, emergencies);

        let concerns = first_level.values().filter(|l| **l == RiskLevel::Concern).count();
        prop_assert!(ledger.notifications.len() - agency <= concerns);
        prop_assert_eq!(ledger.follow_ups.len(), concerns);
    }

    /// A fired follow-up notifies the agency exactly when unresolved
    #[test]
    fn prop_follow_up_respects_resolution(resolved in any::<bool>(), reason in "[a-z ]{1,20}") {
        let result = transition(&test_context(), Event::FollowUpDue {
            alert_id: AlertId(1),
            user_id: "kim-grandma-01".to_string(),
            reason,
            resolved,
        }).unwrap();

        let notifies = result.effects.iter().filter(|e| e.is_notify()).count();
        prop_assert_eq!(notifies, usize::from(!resolved));

        let expected = if resolved { FollowUpStatus::Aborted } else { FollowUpStatus::Escalated };
        let closes_with_expected = matches!(
            result.effects.last(),
            Some(Effect::CloseFollowUp { outcome, .. }) if *outcome == expected
        );
        prop_assert!(closes_with_expected);
    }

    /// Transition is deterministic
    #[test]
    fn prop_transition_is_pure(event in arb_turn_event()) {
        let context = test_context();
        let a = transition(&context, event.clone()).unwrap();
        let b = transition(&context, event).unwrap();
        prop_assert_eq!(a.effects, b.effects);
    }
}
