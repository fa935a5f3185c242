//! Generation orchestrator
//!
//! Per-request state machine tying the memory components together:
//!
//! ```text
//! CacheCheck ──hit──▶ AwaitingSelection ──(returned to caller)
//!     │
//!     └──miss──▶ Generating ──▶ Answered | Failed
//!
//! resolve_selection:
//!     cache entries ──▶ Reusing ──▶ Answered | Failed
//!     generate new  ──▶ Generating ──▶ Answered | Failed
//! ```
//!
//! Cached candidates are never reused without the caller's selection. A
//! failed generation leaves conversation memory and the cache untouched.

use crate::agent::cleaning::clean_sql;
use crate::agent::prompts::{text_to_sql_template, PromptTemplate, SqlPromptContext};
use crate::config::OrchestratorConfig;
use crate::core::{GenerationEngine, SessionId};
use crate::error::{Error, GenerationFailure, Result};
use crate::memory::{
    context_fingerprint, format_snippets, ContextRetriever, ConversationMemory, NewTurn,
    SemanticCache, SimilarityMatch,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Caller's answer to a candidate list
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Reuse these cache entries; the first one becomes the active answer
    CacheEntries(Vec<Uuid>),
    /// Ignore the candidates and generate a fresh answer
    GenerateNew,
}

/// Where an answer came from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerSource {
    /// Freshly generated from retrieved context
    Generated,
    /// Reused cache entries, in selection order
    Cached {
        /// Selected entry IDs
        entry_ids: Vec<Uuid>,
    },
}

/// A completed request
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// Session the answer was recorded in
    pub session_id: SessionId,
    /// Recorded turn
    pub turn_id: u64,
    /// Text shown to the user (several labelled answers on multi-select)
    pub answer_text: String,
    /// The active SQL
    pub structured_output: String,
    /// Opaque fingerprint of the schema fields used, for the executor's audit log
    pub context_fingerprint: String,
    /// Generated or reused
    pub source: AnswerSource,
}

/// Result of `ask`
#[derive(Debug, Clone)]
pub enum AskOutcome {
    /// Similar past questions exist; the caller must choose
    Candidates {
        /// Session the candidates are pending in
        session_id: SessionId,
        /// Best first, all at or above the cache threshold
        candidates: Vec<SimilarityMatch>,
    },
    /// No usable candidate; a new answer was generated
    Answered(Answer),
}

/// Request states
#[derive(Debug)]
enum RequestState {
    /// Looking for similar past questions
    CacheCheck,
    /// Candidates found, waiting on the caller
    AwaitingSelection { candidates: Vec<SimilarityMatch> },
    /// Answering from selected cache entries
    Reusing { entry_ids: Vec<Uuid> },
    /// Building a prompt and calling the engine
    Generating,
    /// Terminal: success
    Answered(Answer),
    /// Terminal: failure
    Failed(Error),
}

/// Candidates offered for a question, kept until the caller resolves them
#[derive(Debug, Clone)]
struct PendingSelection {
    question: String,
    candidates: Vec<SimilarityMatch>,
}

/// Drives one question at a time per session through cache, retrieval and generation
pub struct Orchestrator {
    memory: Arc<ConversationMemory>,
    cache: SemanticCache,
    retriever: ContextRetriever,
    engine: Arc<dyn GenerationEngine>,
    template: PromptTemplate,
    config: OrchestratorConfig,
    pending: RwLock<HashMap<SessionId, PendingSelection>>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        memory: Arc<ConversationMemory>,
        cache: SemanticCache,
        retriever: ContextRetriever,
        engine: Arc<dyn GenerationEngine>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        Ok(Orchestrator {
            memory,
            cache,
            retriever,
            engine,
            template: text_to_sql_template()?,
            config,
            pending: RwLock::new(HashMap::new()),
        })
    }

    /// Conversation memory
    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Semantic cache
    pub fn cache(&self) -> &SemanticCache {
        &self.cache
    }

    /// Context retriever
    pub fn retriever(&self) -> &ContextRetriever {
        &self.retriever
    }

    /// Submit a question
    ///
    /// Starts a session when `session_id` is `None`. Returns cache candidates
    /// for confirmation, or a freshly generated answer on a cache miss.
    pub async fn ask(&self, session_id: Option<&str>, question: &str) -> Result<AskOutcome> {
        let question = validate_question(question)?;
        let session_id = self.memory.begin_or_resume(session_id).await;
        self.run(&session_id, question, RequestState::CacheCheck).await
    }

    /// Resolve a candidate list, or force generation for a question
    pub async fn resolve_selection(
        &self,
        session_id: &str,
        question: &str,
        selection: Selection,
    ) -> Result<Answer> {
        let question = validate_question(question)?;
        let session_id = self.memory.begin_or_resume(Some(session_id)).await;

        let initial = match selection {
            Selection::GenerateNew => {
                self.pending.write().await.remove(&session_id);
                RequestState::Generating
            }
            Selection::CacheEntries(ids) if ids.is_empty() => {
                return Err(Error::InvalidInput(
                    "select at least one cached answer, or ask for a new one".to_string(),
                ));
            }
            Selection::CacheEntries(ids) => RequestState::Reusing { entry_ids: ids },
        };

        match self.run(&session_id, question, initial).await? {
            AskOutcome::Answered(answer) => Ok(answer),
            AskOutcome::Candidates { .. } => Err(Error::Internal(
                "selection produced a new candidate list".to_string(),
            )),
        }
    }

    /// Forget a session's turns and pending candidates (idempotent)
    pub async fn clear_session(&self, session_id: &str) {
        self.pending.write().await.remove(session_id);
        self.memory.clear(session_id).await;
        info!(session_id, "Session cleared");
    }

    /// Drop sessions idle past the configured timeout
    pub async fn expire_idle_sessions(&self) -> usize {
        let expired = self.memory.expire_idle(self.config.session_idle_timeout).await;
        if expired > 0 {
            let waiting: Vec<SessionId> = self.pending.read().await.keys().cloned().collect();
            for id in waiting {
                if !self.memory.contains(&id).await {
                    self.pending.write().await.remove(&id);
                }
            }
        }
        expired
    }

    /// Drive the state machine to a terminal or caller-facing state
    async fn run(&self, session_id: &str, question: &str, mut state: RequestState) -> Result<AskOutcome> {
        let started = Instant::now();

        loop {
            debug!(session_id, ?state, "Request state");
            state = match state {
                RequestState::CacheCheck => self.handle_cache_check(question).await,
                RequestState::AwaitingSelection { candidates } => {
                    self.pending.write().await.insert(
                        session_id.to_string(),
                        PendingSelection {
                            question: question.to_string(),
                            candidates: candidates.clone(),
                        },
                    );
                    info!(session_id, candidates = candidates.len(), "Awaiting selection");
                    return Ok(AskOutcome::Candidates {
                        session_id: session_id.to_string(),
                        candidates,
                    });
                }
                RequestState::Reusing { entry_ids } => {
                    self.handle_reusing(session_id, question, entry_ids).await
                }
                RequestState::Generating => self.handle_generating(session_id, question).await,
                RequestState::Answered(answer) => {
                    info!(
                        session_id,
                        turn_id = answer.turn_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Answered"
                    );
                    return Ok(AskOutcome::Answered(answer));
                }
                RequestState::Failed(error) => {
                    warn!(session_id, error = %error, "Request failed");
                    return Err(error);
                }
            };
        }
    }

    /// Handle the cache check state
    async fn handle_cache_check(&self, question: &str) -> RequestState {
        let candidates = match timeout(self.config.lookup_timeout, self.cache.search(question)).await {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                warn!(error = %e, "Cache search failed, treating as miss");
                Vec::new()
            }
            Err(_) => {
                warn!("Cache search timed out, treating as miss");
                Vec::new()
            }
        };

        if candidates.is_empty() {
            debug!("Cache miss");
            RequestState::Generating
        } else {
            RequestState::AwaitingSelection { candidates }
        }
    }

    /// Handle the reusing state
    async fn handle_reusing(&self, session_id: &str, question: &str, entry_ids: Vec<Uuid>) -> RequestState {
        let pending = self
            .pending
            .read()
            .await
            .get(session_id)
            .filter(|p| p.question == question)
            .cloned();

        let mut ordered: Vec<Uuid> = Vec::with_capacity(entry_ids.len());
        for id in entry_ids {
            if !ordered.contains(&id) {
                ordered.push(id);
            }
        }

        let mut selected: Vec<SimilarityMatch> = Vec::with_capacity(ordered.len());
        for id in &ordered {
            let offered = pending
                .as_ref()
                .and_then(|p| p.candidates.iter().find(|c| c.entry_id == *id).cloned());
            let found = match offered {
                Some(candidate) => candidate,
                None => match self.cache.lookup(*id, question).await {
                    Ok(Some(candidate)) => candidate,
                    Ok(None) => return RequestState::Failed(Error::NotFound(format!("cache entry {}", id))),
                    Err(e) => return RequestState::Failed(e),
                },
            };
            selected.push(found);
        }
        // Every id resolved, so the offer is settled
        self.pending.write().await.remove(session_id);

        // First selection wins; the rest are shown for comparison only
        let Some(active) = selected.first().cloned() else {
            return RequestState::Failed(Error::InvalidInput("no cache entry selected".to_string()));
        };
        let answer_text = if selected.len() == 1 {
            active.answer_text.clone()
        } else {
            with_provenance(&selected)
        };

        let turn = NewTurn {
            input_text: question.to_string(),
            assembled_context: String::new(),
            answer_text: active.answer_text.clone(),
            structured_output: active.answer_text.clone(),
        };
        let turn_id = match self.record_turn(session_id, turn).await {
            Ok(id) => id,
            Err(e) => return RequestState::Failed(e),
        };

        info!(session_id, selected = selected.len(), "Reused cached answer");
        RequestState::Answered(Answer {
            session_id: session_id.to_string(),
            turn_id,
            answer_text,
            structured_output: active.answer_text,
            context_fingerprint: active.context_fingerprint,
            source: AnswerSource::Cached { entry_ids: ordered },
        })
    }

    /// Handle the generating state
    async fn handle_generating(&self, session_id: &str, question: &str) -> RequestState {
        let turns = self
            .memory
            .recent_turns(session_id, self.config.history_turns)
            .await;
        let snippets = self
            .retriever
            .retrieve(question, self.retriever.config().top_n)
            .await;

        let prompt = match self
            .template
            .render(&SqlPromptContext::new(&turns, &snippets, question))
        {
            Ok(prompt) => prompt,
            Err(e) => return RequestState::Failed(e),
        };
        debug!(
            session_id,
            history = turns.len(),
            snippets = snippets.len(),
            prompt_chars = prompt.len(),
            "Prompt assembled"
        );

        let raw = match timeout(self.config.generation_timeout, self.engine.complete(&prompt)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(failure)) => return RequestState::Failed(failure.into()),
            Err(_) => return RequestState::Failed(GenerationFailure::Timeout.into()),
        };

        let sql = match clean_sql(&raw) {
            Ok(sql) => sql,
            Err(failure) => return RequestState::Failed(failure.into()),
        };

        let fingerprint = context_fingerprint(&snippets);
        let turn = NewTurn {
            input_text: question.to_string(),
            assembled_context: format_snippets(&snippets),
            answer_text: sql.clone(),
            structured_output: sql.clone(),
        };
        let turn_id = match self.record_turn(session_id, turn).await {
            Ok(id) => id,
            Err(e) => return RequestState::Failed(e),
        };

        // The answer stands even if it cannot be cached
        if let Err(e) = self.cache.store(question, &sql, &fingerprint).await {
            warn!(session_id, error = %e, "Cache write failed");
        }

        RequestState::Answered(Answer {
            session_id: session_id.to_string(),
            turn_id,
            answer_text: sql.clone(),
            structured_output: sql,
            context_fingerprint: fingerprint,
            source: AnswerSource::Generated,
        })
    }

    /// Append a turn, recreating the session once if it vanished mid-request
    async fn record_turn(&self, session_id: &str, turn: NewTurn) -> Result<u64> {
        match self.memory.append_turn(session_id, turn.clone()).await {
            Err(Error::SessionNotFound(_)) => {
                debug!(session_id, "Session vanished, recreating");
                self.memory.begin_or_resume(Some(session_id)).await;
                self.memory.append_turn(session_id, turn).await
            }
            other => other,
        }
    }
}

fn validate_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(Error::InvalidInput("question must not be empty".to_string()));
    }
    Ok(question)
}

/// Concatenate selected answers, each under a header naming its source question
fn with_provenance(selected: &[SimilarityMatch]) -> String {
    selected
        .iter()
        .enumerate()
        .map(|(i, m)| {
            format!(
                "-- [{}] cached answer for \"{}\" (similarity {:.2}){}\n{}",
                i + 1,
                m.query_text,
                m.score,
                if i == 0 { ", active" } else { "" },
                m.answer_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{
        harness, harness_with_cache_store, FailingEngine, Fault, FaultyStore, RecordingEngine, SlowEngine,
    };
    use crate::core::SimilarityStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_miss_generates_records_and_caches() {
        let engine = Arc::new(RecordingEngine::new(["```sql\nSELECT \"CustomerID\" FROM sales.customer;\n```"]));
        let h = harness(engine.clone(), OrchestratorConfig::default()).await;

        let outcome = h.orchestrator.ask(None, "list every CustomerID").await.unwrap();
        let AskOutcome::Answered(answer) = outcome else {
            panic!("expected a generated answer");
        };

        assert_eq!(answer.structured_output, "SELECT \"CustomerID\" FROM sales.customer;");
        assert_eq!(answer.turn_id, 1);
        assert_eq!(answer.source, AnswerSource::Generated);
        assert!(!answer.context_fingerprint.is_empty());
        assert!(engine.prompts()[0].contains("sales.customer.\"CustomerID\""));
        assert!(engine.prompts()[0].contains("Description: Customers of the shop"));

        let turns = h.orchestrator.memory().recent_turns(&answer.session_id, 5).await;
        assert_eq!(turns.len(), 1);
        assert!(turns[0].assembled_context.contains("sales.customer"));
        assert_eq!(h.cache_store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hit_returns_candidates_without_reuse() {
        let engine = Arc::new(RecordingEngine::new(["SELECT 1;"]));
        let h = harness(engine.clone(), OrchestratorConfig::default()).await;
        h.orchestrator
            .cache()
            .store("show top 10 customers by revenue", "SQL_A", "fp")
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .ask(Some("s1"), "top 10 customers by revenue")
            .await
            .unwrap();

        let AskOutcome::Candidates { session_id, candidates } = outcome else {
            panic!("expected candidates");
        };
        assert_eq!(session_id, "s1");
        assert_eq!(candidates[0].answer_text, "SQL_A");
        assert!(candidates[0].score > 0.9);
        assert!(engine.prompts().is_empty());
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 0);
    }

    #[tokio::test]
    async fn test_follow_up_prompt_includes_previous_turn() {
        let engine = Arc::new(RecordingEngine::new([
            "SELECT * FROM sales.customer ORDER BY revenue DESC LIMIT 10;",
            "SELECT * FROM sales.customer ORDER BY revenue DESC LIMIT 5;",
        ]));
        let h = harness(engine.clone(), OrchestratorConfig::default()).await;

        let first = h
            .orchestrator
            .resolve_selection("s1", "show top 10 customers by revenue", Selection::GenerateNew)
            .await
            .unwrap();
        assert_eq!(first.turn_id, 1);

        let second = h
            .orchestrator
            .resolve_selection("s1", "now only show 5", Selection::GenerateNew)
            .await
            .unwrap();
        assert_eq!(second.turn_id, 2);

        let prompts = engine.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("show top 10 customers by revenue"));
        assert!(prompts[1].contains("ORDER BY revenue DESC LIMIT 10;"));
        assert!(prompts[1].contains("Resolve such references"));
        assert!(!prompts[0].contains("Conversation so far"));
    }

    #[tokio::test]
    async fn test_generation_timeout_leaves_no_trace() {
        let engine = Arc::new(FailingEngine(GenerationFailure::Timeout));
        let h = harness(engine, OrchestratorConfig::default()).await;

        let err = h
            .orchestrator
            .resolve_selection("s1", "top customers", Selection::GenerateNew)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Generation(GenerationFailure::Timeout)));
        assert!(err.user_message().contains("try again"));
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 0);
        assert_eq!(h.cache_store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_engine_is_cut_off() {
        let config = OrchestratorConfig {
            generation_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        };
        let h = harness(Arc::new(SlowEngine(Duration::from_secs(5))), config).await;

        let started = std::time::Instant::now();
        let err = h.orchestrator.ask(Some("s1"), "top customers").await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, Error::Generation(GenerationFailure::Timeout)));
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 0);
    }

    #[tokio::test]
    async fn test_malformed_output_fails_without_writes() {
        let engine = Arc::new(RecordingEngine::new(["Sorry, I am not sure what you mean."]));
        let h = harness(engine, OrchestratorConfig::default()).await;

        let err = h.orchestrator.ask(Some("s1"), "top customers").await.unwrap_err();
        assert!(matches!(err, Error::Generation(GenerationFailure::Malformed(_))));
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 0);
        assert_eq!(h.cache_store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_multi_select_first_entry_is_active() {
        let engine = Arc::new(RecordingEngine::new(["SELECT 0;"]));
        let h = harness(engine.clone(), OrchestratorConfig::default()).await;
        let cache = h.orchestrator.cache();
        let id_a = cache.store("top customers by revenue", "SQL_A", "fp-a").await.unwrap();
        let id_b = cache
            .store("top customers by revenue this year", "SQL_B", "fp-b")
            .await
            .unwrap();

        let AskOutcome::Candidates { candidates, .. } = h
            .orchestrator
            .ask(Some("s1"), "top customers by revenue")
            .await
            .unwrap()
        else {
            panic!("expected candidates");
        };
        assert_eq!(candidates.len(), 2);

        let answer = h
            .orchestrator
            .resolve_selection(
                "s1",
                "top customers by revenue",
                Selection::CacheEntries(vec![id_b, id_a]),
            )
            .await
            .unwrap();

        assert!(answer.answer_text.contains("SQL_A"));
        assert!(answer.answer_text.contains("SQL_B"));
        assert!(answer.answer_text.contains("\"top customers by revenue this year\""));
        assert!(answer.answer_text.find("SQL_B") < answer.answer_text.find("SQL_A"));
        assert_eq!(answer.structured_output, "SQL_B");
        assert_eq!(answer.context_fingerprint, "fp-b");
        assert_eq!(answer.source, AnswerSource::Cached { entry_ids: vec![id_b, id_a] });

        let turns = h.orchestrator.memory().recent_turns("s1", 5).await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].structured_output, "SQL_B");
        assert!(engine.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_single_selection_without_pending_list() {
        let engine = Arc::new(RecordingEngine::new(["SELECT 0;"]));
        let h = harness(engine, OrchestratorConfig::default()).await;
        let id = h
            .orchestrator
            .cache()
            .store("orders per day", "SELECT day, count(*) FROM sales.orders GROUP BY day;", "")
            .await
            .unwrap();

        let answer = h
            .orchestrator
            .resolve_selection("fresh", "orders per day", Selection::CacheEntries(vec![id]))
            .await
            .unwrap();
        assert_eq!(answer.answer_text, answer.structured_output);
        assert_eq!(answer.turn_id, 1);
    }

    #[tokio::test]
    async fn test_unknown_or_empty_selection_is_rejected() {
        let h = harness(Arc::new(RecordingEngine::new(["SELECT 0;"])), OrchestratorConfig::default()).await;

        let err = h
            .orchestrator
            .resolve_selection("s1", "q", Selection::CacheEntries(vec![Uuid::new_v4()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = h
            .orchestrator
            .resolve_selection("s1", "q", Selection::CacheEntries(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 0);

        assert!(matches!(
            h.orchestrator.ask(None, "   ").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_selection_keeps_offered_candidates() {
        let h = harness(Arc::new(RecordingEngine::new(["SELECT 0;"])), OrchestratorConfig::default()).await;
        let id = h.orchestrator.cache().store("orders per day", "SQL_A", "").await.unwrap();
        let AskOutcome::Candidates { candidates, .. } =
            h.orchestrator.ask(Some("s1"), "orders per day").await.unwrap()
        else {
            panic!("expected candidates");
        };
        let offered_score = candidates[0].score;

        let err = h
            .orchestrator
            .resolve_selection("s1", "orders per day", Selection::CacheEntries(vec![id, Uuid::new_v4()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(h.orchestrator.pending.read().await.len(), 1);

        let answer = h
            .orchestrator
            .resolve_selection("s1", "orders per day", Selection::CacheEntries(vec![id]))
            .await
            .unwrap();
        assert_eq!(answer.structured_output, "SQL_A");
        assert!(h.orchestrator.pending.read().await.is_empty());
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 1);
        assert!(offered_score > 0.99);
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_swallowed() {
        let engine = Arc::new(RecordingEngine::new(["SELECT 1;"]));
        let store = Arc::new(FaultyStore::new("query_cache", Fault::RejectWrites));
        let h = harness_with_cache_store(engine, store, OrchestratorConfig::default()).await;

        let answer = h
            .orchestrator
            .resolve_selection("s1", "count customers", Selection::GenerateNew)
            .await
            .unwrap();
        assert_eq!(answer.structured_output, "SELECT 1;");
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 1);
    }

    #[tokio::test]
    async fn test_cache_search_error_counts_as_miss() {
        let engine = Arc::new(RecordingEngine::new(["SELECT count(*) FROM sales.orders;"]));
        let store = Arc::new(FaultyStore::new("query_cache", Fault::FailSearch));
        let h = harness_with_cache_store(engine.clone(), store, OrchestratorConfig::default()).await;

        let outcome = h.orchestrator.ask(Some("s1"), "how many orders are there").await.unwrap();
        let AskOutcome::Answered(answer) = outcome else {
            panic!("a failed cache search should fall through to generation");
        };
        assert_eq!(answer.source, AnswerSource::Generated);
        assert_eq!(engine.prompts().len(), 1);
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 1);
    }

    #[tokio::test]
    async fn test_stalled_cache_search_times_out_to_miss() {
        let config = OrchestratorConfig {
            lookup_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        };
        let engine = Arc::new(RecordingEngine::new(["SELECT count(*) FROM sales.orders;"]));
        let store = Arc::new(FaultyStore::new("query_cache", Fault::StallSearch));
        let h = harness_with_cache_store(engine.clone(), store, config).await;

        let started = std::time::Instant::now();
        let outcome = h.orchestrator.ask(Some("s1"), "how many orders are there").await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        let AskOutcome::Answered(answer) = outcome else {
            panic!("a stalled cache search should fall through to generation");
        };
        assert_eq!(answer.structured_output, "SELECT count(*) FROM sales.orders;");
        assert_eq!(engine.prompts().len(), 1);
        assert_eq!(h.orchestrator.memory().turn_count("s1").await, 1);
    }

    #[tokio::test]
    async fn test_generated_answer_is_offered_next_time() {
        let engine = Arc::new(RecordingEngine::new(["SELECT count(*) FROM sales.orders;"]));
        let h = harness(engine, OrchestratorConfig::default()).await;

        h.orchestrator.ask(Some("s1"), "how many orders are there").await.unwrap();
        let outcome = h.orchestrator.ask(Some("s2"), "how many orders are there").await.unwrap();

        let AskOutcome::Candidates { candidates, .. } = outcome else {
            panic!("expected candidates");
        };
        assert_eq!(candidates[0].answer_text, "SELECT count(*) FROM sales.orders;");
    }

    #[tokio::test]
    async fn test_clear_session() {
        let engine = Arc::new(RecordingEngine::new(["SELECT 1;"]));
        let h = harness(engine, OrchestratorConfig::default()).await;
        h.orchestrator
            .resolve_selection("s1", "count customers", Selection::GenerateNew)
            .await
            .unwrap();

        h.orchestrator.clear_session("s1").await;
        assert!(h.orchestrator.memory().recent_turns("s1", 5).await.is_empty());
        h.orchestrator.clear_session("s1").await;
        h.orchestrator.clear_session("never-seen").await;
    }

    #[tokio::test]
    async fn test_record_turn_recreates_vanished_session() {
        let h = harness(Arc::new(RecordingEngine::new(["SELECT 1;"])), OrchestratorConfig::default()).await;

        let turn_id = h
            .orchestrator
            .record_turn("gone", NewTurn {
                input_text: "q".into(),
                answer_text: "SELECT 1;".into(),
                structured_output: "SELECT 1;".into(),
                ..NewTurn::default()
            })
            .await
            .unwrap();
        assert_eq!(turn_id, 1);
        assert!(h.orchestrator.memory().contains("gone").await);
    }

    #[tokio::test]
    async fn test_expire_idle_sessions_drops_pending() {
        let config = OrchestratorConfig {
            session_idle_timeout: Duration::from_millis(1),
            ..OrchestratorConfig::default()
        };
        let h = harness(Arc::new(RecordingEngine::new(["SELECT 1;"])), config).await;
        h.orchestrator.cache().store("orders per day", "SQL", "").await.unwrap();
        h.orchestrator.ask(Some("s1"), "orders per day").await.unwrap();
        assert_eq!(h.orchestrator.pending.read().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.orchestrator.expire_idle_sessions().await, 1);
        assert!(h.orchestrator.pending.read().await.is_empty());
    }
}
