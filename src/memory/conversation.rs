//! Short-term conversation memory
//!
//! Per-session, append-only turn logs. This is the only place prompt history is
//! read from; nothing else holds turns.

use crate::core::SessionId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Default number of turns handed to the prompt
pub const DEFAULT_RECENT_TURNS: usize = 5;

/// One recorded question/answer exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Monotonic within the session, audit only
    pub turn_id: u64,
    /// Owning session
    pub session_id: SessionId,
    /// The question as asked
    pub input_text: String,
    /// Schema context that went into the prompt (empty for cached answers)
    pub assembled_context: String,
    /// Answer shown to the user
    pub answer_text: String,
    /// The active structured output (SQL)
    pub structured_output: String,
    /// When the turn was recorded
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when recording a turn
#[derive(Debug, Clone, Default)]
pub struct NewTurn {
    /// The question as asked
    pub input_text: String,
    /// Schema context that went into the prompt
    pub assembled_context: String,
    /// Answer shown to the user
    pub answer_text: String,
    /// The active structured output
    pub structured_output: String,
}

/// A conversation session
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,
    /// Turns, oldest first
    turns: Vec<Turn>,
    /// Next turn ID to hand out
    next_turn_id: u64,
    /// When the session started
    pub created_at: DateTime<Utc>,
    /// Last append or resume
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Session {
            id,
            turns: Vec::new(),
            next_turn_id: 1,
            created_at: now,
            last_active_at: now,
        }
    }

    fn append(&mut self, turn: NewTurn) -> u64 {
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        let now = Utc::now();
        self.turns.push(Turn {
            turn_id,
            session_id: self.id.clone(),
            input_text: turn.input_text,
            assembled_context: turn.assembled_context,
            answer_text: turn.answer_text,
            structured_output: turn.structured_output,
            created_at: now,
        });
        self.last_active_at = now;
        turn_id
    }

    /// Get the last N turns, oldest first
    fn recent(&self, n: usize) -> Vec<Turn> {
        let start = self.turns.len().saturating_sub(n);
        self.turns[start..].to_vec()
    }
}

/// Manages the turn logs of all live sessions
///
/// Locks are held only for in-memory bookkeeping, never across an await on an
/// external service.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl ConversationMemory {
    /// Create an empty memory
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the given session, creating it if needed, or allocate a new one
    pub async fn begin_or_resume(&self, session_id: Option<&str>) -> SessionId {
        let id = match session_id {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.clone())
            .and_modify(|s| s.last_active_at = Utc::now())
            .or_insert_with(|| {
                debug!(session_id = %id, "Created session");
                Session::new(id.clone())
            });
        id
    }

    /// Append a turn, returning its ID
    pub async fn append_turn(&self, session_id: &str, turn: NewTurn) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let turn_id = session.append(turn);
        debug!(session_id, turn_id, "Recorded turn");
        Ok(turn_id)
    }

    /// Up to `max_turns` most recent turns, oldest first
    ///
    /// Unknown sessions yield an empty list.
    pub async fn recent_turns(&self, session_id: &str, max_turns: usize) -> Vec<Turn> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.recent(max_turns))
            .unwrap_or_default()
    }

    /// Drop a session and all of its turns (idempotent)
    pub async fn clear(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            debug!(session_id, "Cleared session");
        }
    }

    /// Whether the session exists
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Number of turns recorded for a session
    pub async fn turn_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.turns.len())
            .unwrap_or(0)
    }

    /// Count live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle for longer than `max_idle`, returning how many went
    pub async fn expire_idle(&self, max_idle: Duration) -> usize {
        let Ok(max_idle) = chrono::Duration::from_std(max_idle) else {
            return 0;
        };
        let cutoff = Utc::now() - max_idle;

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.last_active_at >= cutoff);
        let expired = before - sessions.len();
        if expired > 0 {
            debug!(expired, "Expired idle sessions");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(question: &str, sql: &str) -> NewTurn {
        NewTurn {
            input_text: question.to_string(),
            assembled_context: String::new(),
            answer_text: sql.to_string(),
            structured_output: sql.to_string(),
        }
    }

    #[tokio::test]
    async fn test_begin_allocates_and_resumes() {
        let memory = ConversationMemory::new();

        let fresh = memory.begin_or_resume(None).await;
        assert!(!fresh.is_empty());
        assert!(memory.contains(&fresh).await);

        let resumed = memory.begin_or_resume(Some(&fresh)).await;
        assert_eq!(resumed, fresh);
        assert_eq!(memory.session_count().await, 1);

        let named = memory.begin_or_resume(Some("analyst-1")).await;
        assert_eq!(named, "analyst-1");
        assert_eq!(memory.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_append_requires_session() {
        let memory = ConversationMemory::new();
        let err = memory.append_turn("ghost", turn("q", "SELECT 1")).await;
        assert!(matches!(err, Err(Error::SessionNotFound(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_turn_ids_are_monotonic() {
        let memory = ConversationMemory::new();
        let id = memory.begin_or_resume(Some("s")).await;

        let first = memory.append_turn(&id, turn("a", "SELECT 1")).await.unwrap();
        let second = memory.append_turn(&id, turn("b", "SELECT 2")).await.unwrap();
        let third = memory.append_turn(&id, turn("c", "SELECT 3")).await.unwrap();

        assert_eq!((first, second, third), (1, 2, 3));
    }

    #[tokio::test]
    async fn test_recent_turns_bounded_and_ordered() {
        let memory = ConversationMemory::new();
        let id = memory.begin_or_resume(Some("s")).await;
        assert!(memory.recent_turns(&id, DEFAULT_RECENT_TURNS).await.is_empty());

        for i in 0..8 {
            memory
                .append_turn(&id, turn(&format!("q{}", i), &format!("SELECT {}", i)))
                .await
                .unwrap();
        }

        let recent = memory.recent_turns(&id, 5).await;
        let questions: Vec<&str> = recent.iter().map(|t| t.input_text.as_str()).collect();
        assert_eq!(questions, vec!["q3", "q4", "q5", "q6", "q7"]);

        // Reading is side-effect free
        assert_eq!(memory.recent_turns(&id, 5).await, recent);
        assert_eq!(memory.turn_count(&id).await, 8);
        assert_eq!(memory.recent_turns(&id, 0).await.len(), 0);
        assert_eq!(memory.recent_turns(&id, 100).await.len(), 8);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let memory = ConversationMemory::new();
        let id = memory.begin_or_resume(Some("s")).await;
        memory.append_turn(&id, turn("a", "SELECT 1")).await.unwrap();

        memory.clear(&id).await;
        assert!(memory.recent_turns(&id, 5).await.is_empty());
        memory.clear(&id).await;
        memory.clear("never-existed").await;
        assert_eq!(memory.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let memory = ConversationMemory::new();
        let a = memory.begin_or_resume(Some("a")).await;
        let b = memory.begin_or_resume(Some("b")).await;
        memory.append_turn(&a, turn("only in a", "SELECT 1")).await.unwrap();

        assert_eq!(memory.turn_count(&a).await, 1);
        assert!(memory.recent_turns(&b, 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_expire_idle() {
        let memory = ConversationMemory::new();
        memory.begin_or_resume(Some("s")).await;

        assert_eq!(memory.expire_idle(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(memory.expire_idle(Duration::from_millis(1)).await, 1);
        assert_eq!(memory.session_count().await, 0);
    }
}
