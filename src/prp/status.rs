//! Agent status hashes read by the supervisor's health monitor.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::keys;

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Idle,
    Processing,
    WaitingForAnswer,
    Error,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Starting => "starting",
            AgentState::Idle => "idle",
            AgentState::Processing => "processing",
            AgentState::WaitingForAnswer => "waiting_for_answer",
            AgentState::Error => "error",
            AgentState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(AgentState::Starting),
            "idle" => Ok(AgentState::Idle),
            "processing" => Ok(AgentState::Processing),
            "waiting_for_answer" => Ok(AgentState::WaitingForAnswer),
            "error" => Ok(AgentState::Error),
            "stopped" => Ok(AgentState::Stopped),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

/// Contents of `agent:<id>`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub agent_id: String,
    pub role: String,
    pub state: AgentState,
    pub current_prp: Option<String>,
    /// Unix seconds.
    pub last_activity: i64,
    pub processed: u64,
    pub failed: u64,
}

impl AgentStatus {
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            state: AgentState::Starting,
            current_prp: None,
            last_activity: chrono::Utc::now().timestamp(),
            processed: 0,
            failed: 0,
        }
    }

    /// Seconds since the last recorded activity.
    pub fn idle_for(&self, now: i64) -> i64 {
        (now - self.last_activity).max(0)
    }

    /// Whether the agent has been silent for longer than `stale_after_secs`.
    /// A stopped agent is never stale.
    pub fn is_stale(&self, now: i64, stale_after_secs: u64) -> bool {
        self.state != AgentState::Stopped && self.idle_for(now) as u64 > stale_after_secs
    }

    /// Whether the entry is old enough to drop from the registry, whatever
    /// its state. Covers agents of processes that died without stopping.
    pub fn is_abandoned(&self, now: i64, abandon_after_secs: u64) -> bool {
        self.idle_for(now) as u64 > abandon_after_secs
    }

    fn to_hash_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", self.state.to_string()),
            ("role", self.role.clone()),
            ("current_prp", self.current_prp.clone().unwrap_or_default()),
            ("last_activity", self.last_activity.to_string()),
            ("processed", self.processed.to_string()),
            ("failed", self.failed.to_string()),
        ]
    }

    /// Parse a status hash. Returns `None` for an empty or unreadable hash.
    pub fn from_hash(agent_id: &str, hash: &HashMap<String, String>) -> Option<Self> {
        let state = hash.get("status")?.parse().ok()?;
        let number = |name: &str| -> Option<u64> { hash.get(name).and_then(|v| v.parse().ok()) };
        Some(Self {
            agent_id: agent_id.to_string(),
            role: hash.get("role").cloned().unwrap_or_default(),
            state,
            current_prp: hash.get("current_prp").filter(|v| !v.is_empty()).cloned(),
            last_activity: hash
                .get("last_activity")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            processed: number("processed").unwrap_or(0),
            failed: number("failed").unwrap_or(0),
        })
    }
}

/// Overwrite the status hash and register the agent id.
pub async fn write(conn: &mut ConnectionManager, status: &AgentStatus) -> redis::RedisResult<()> {
    let key = keys::agent_key(&status.agent_id);
    let fields = status.to_hash_fields();
    redis::pipe()
        .hset_multiple(&key, fields.as_slice())
        .ignore()
        .sadd(keys::AGENTS_SET, &status.agent_id)
        .ignore()
        .query_async(conn)
        .await
}

/// Unregister an agent and delete its status hash.
pub async fn remove(conn: &mut ConnectionManager, agent_id: &str) -> redis::RedisResult<()> {
    redis::pipe()
        .atomic()
        .srem(keys::AGENTS_SET, agent_id)
        .ignore()
        .del(keys::agent_key(agent_id))
        .ignore()
        .query_async(conn)
        .await
}

/// Remove registered agents whose hash is missing or unreadable, or whose
/// last activity is older than `abandon_after`. Returns the removed ids.
pub async fn prune(
    conn: &mut ConnectionManager,
    now: i64,
    abandon_after: Duration,
) -> redis::RedisResult<Vec<String>> {
    let ids: Vec<String> = conn.smembers(keys::AGENTS_SET).await?;

    let mut removed = Vec::new();
    for id in ids {
        let hash: HashMap<String, String> = conn.hgetall(keys::agent_key(&id)).await?;
        let keep = AgentStatus::from_hash(&id, &hash)
            .is_some_and(|status| !status.is_abandoned(now, abandon_after.as_secs()));
        if !keep {
            remove(conn, &id).await?;
            removed.push(id);
        }
    }
    removed.sort();
    Ok(removed)
}

/// Read every registered agent's status, sorted by id.
pub async fn read_all(conn: &mut ConnectionManager) -> redis::RedisResult<Vec<AgentStatus>> {
    let mut ids: Vec<String> = conn.smembers(keys::AGENTS_SET).await?;
    ids.sort();

    let mut statuses = Vec::with_capacity(ids.len());
    for id in ids {
        let hash: HashMap<String, String> = conn.hgetall(keys::agent_key(&id)).await?;
        if let Some(status) = AgentStatus::from_hash(&id, &hash) {
            statuses.push(status);
        }
    }
    Ok(statuses)
}
