//! System prompt construction for the companion persona
//!
//! The prompt fixes the persona, tells the model whether medication was
//! already confirmed today, and pins the JSON shape the interpreter parses.

use std::fmt::Write;

/// Base persona
const BASE_PROMPT: &str = "너는 다정한 손주 '반디'야. 어르신의 말을 잘 듣고 짧고 따뜻하게, \
존댓말로 대답해. 어르신의 기분과 몸 상태를 자연스럽게 살피고, 위험해 보이는 신호를 놓치지 마.";

/// Output contract; keys must match `TurnResult`
const JSON_CONTRACT: &str = r#"반드시 아래 형식의 JSON 객체 하나로만 답해. 다른 글은 쓰지 마.
{
  "reply": "어르신께 드릴 답변",
  "level": 1 | 2 | 3,
  "reason": "위험도를 판단한 짧은 이유",
  "medicationChecked": true | false,
  "medicationTaken": true | false | null,
  "playMediaKeyword": "틀어드릴 노래나 영상 검색어" | null,
  "showMediaKeyword": "보여드릴 사진 검색어" | null
}
level: 1=정상, 2=우울/무기력, 3=사고/응급.
medicationChecked: 이번 대화에서 약 복용 여부를 확인했으면 true.
medicationTaken: 약을 드셨다고 하면 true, 안 드셨다고 하면 false, 모르면 null."#;

const MEDICATION_CONFIRMED: &str =
    "오늘 약은 이미 드신 걸로 확인됐어. 약 드셨는지 다시 묻지 마.";

const MEDICATION_UNCONFIRMED: &str =
    "오늘 약 복용이 아직 확인되지 않았어. 대화 흐름이 자연스러울 때 한 번 여쭤봐.";

/// Build the system prompt for one turn
pub fn build_system_prompt(display_name: Option<&str>, medication_confirmed_today: bool) -> String {
    let mut prompt = String::from(BASE_PROMPT);

    if let Some(name) = display_name.map(str::trim).filter(|n| !n.is_empty()) {
        let _ = write!(prompt, "\n\n대화 상대는 '{name}' 님이야. 다정하게 불러드려.");
    }

    prompt.push_str("\n\n");
    prompt.push_str(if medication_confirmed_today {
        MEDICATION_CONFIRMED
    } else {
        MEDICATION_UNCONFIRMED
    });

    prompt.push_str("\n\n");
    prompt.push_str(JSON_CONTRACT);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_contract() {
        let prompt = build_system_prompt(None, false);
        assert!(prompt.starts_with(BASE_PROMPT));
        assert!(prompt.contains("\"medicationTaken\""));
        assert!(prompt.contains("1=정상, 2=우울/무기력, 3=사고/응급"));
        assert!(prompt.contains(MEDICATION_UNCONFIRMED));
    }

    #[test]
    fn test_confirmed_medication_not_reasked() {
        let prompt = build_system_prompt(None, true);
        assert!(prompt.contains(MEDICATION_CONFIRMED));
        assert!(!prompt.contains(MEDICATION_UNCONFIRMED));
    }

    #[test]
    fn test_display_name() {
        let prompt = build_system_prompt(Some("김순자"), false);
        assert!(prompt.contains("'김순자' 님"));

        let blank = build_system_prompt(Some("  "), false);
        assert!(!blank.contains("대화 상대는"));
    }
}
