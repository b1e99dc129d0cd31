//! Per-PRP, per-role conversation history.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use super::keys;
use crate::llm::Message;

/// One prompt/response exchange, stored as a JSON entry of
/// `prp:<id>:history:<role>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub prompt: String,
    pub response: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    /// Retry count of the PRP when the turn was recorded.
    #[serde(default)]
    pub attempt: u32,
    /// Unix seconds.
    pub timestamp: i64,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            prompt: prompt.into(),
            response: response.into(),
            model: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            attempt: 0,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// The turn as a user/assistant message pair.
    pub fn to_messages(&self) -> [Message; 2] {
        [
            Message::user(self.prompt.clone()),
            Message::assistant(self.response.clone()),
        ]
    }
}

/// Replay turns as an alternating message list, oldest first.
pub fn replay(turns: &[ConversationTurn]) -> Vec<Message> {
    turns.iter().flat_map(|turn| turn.to_messages()).collect()
}

/// Append a turn. History is append-only.
pub async fn append(
    conn: &mut ConnectionManager,
    prp_id: &str,
    turn: &ConversationTurn,
) -> redis::RedisResult<()> {
    let entry = serde_json::to_string(turn).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "failed to serialize history entry",
            e.to_string(),
        ))
    })?;
    conn.rpush::<_, _, ()>(keys::history_key(prp_id, &turn.role), entry)
        .await
}

/// Last `window` turns of a role's history, oldest first.
///
/// Entries that are not valid JSON are skipped with a warning.
pub async fn recent(
    conn: &mut ConnectionManager,
    prp_id: &str,
    role: &str,
    window: usize,
) -> redis::RedisResult<Vec<ConversationTurn>> {
    if window == 0 {
        return Ok(Vec::new());
    }
    let start = -(window as isize);
    let raw: Vec<String> = conn
        .lrange(keys::history_key(prp_id, role), start, -1)
        .await?;
    Ok(parse_entries(prp_id, &raw))
}

/// Number of turns recorded for a role.
pub async fn len(conn: &mut ConnectionManager, prp_id: &str, role: &str) -> redis::RedisResult<usize> {
    conn.llen(keys::history_key(prp_id, role)).await
}

fn parse_entries(prp_id: &str, raw: &[String]) -> Vec<ConversationTurn> {
    raw.iter()
        .filter_map(|entry| match serde_json::from_str(entry) {
            Ok(turn) => Some(turn),
            Err(e) => {
                tracing::warn!(prp_id = %prp_id, error = %e, "Skipping malformed history entry");
                None
            }
        })
        .collect()
}

/// Timestamp of the newest parseable entry, if any.
pub fn newest_timestamp(raw_entry: &str) -> Option<i64> {
    serde_json::from_str::<ConversationTurn>(raw_entry)
        .ok()
        .map(|turn| turn.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageRole;

    #[test]
    fn test_replay_alternates_roles() {
        let turns = vec![
            ConversationTurn::new("pm", "first prompt", "first answer"),
            ConversationTurn::new("pm", "second prompt", "second answer"),
        ];
        let messages = replay(&turns);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "first prompt");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[3].content, "second answer");
    }

    #[test]
    fn test_turn_json_defaults() {
        let turn: ConversationTurn = serde_json::from_str(
            r#"{"role":"pm","prompt":"p","response":"r","timestamp":1700000000}"#,
        )
        .expect("parse");
        assert_eq!(turn.attempt, 0);
        assert!(turn.model.is_empty());
        assert_eq!(newest_timestamp(r#"{"role":"pm","prompt":"p","response":"r","timestamp":5}"#), Some(5));
        assert_eq!(newest_timestamp("not json"), None);
    }

    #[test]
    fn test_parse_entries_skips_malformed() {
        let good = serde_json::to_string(&ConversationTurn::new("qa", "q", "a")).expect("json");
        let turns = parse_entries("1", &[good, "{broken".to_string()]);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, "qa");
    }
}
