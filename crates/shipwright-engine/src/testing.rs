//! Test support: scripted collaborators and a scripted agent backend.
//!
//! Not part of the stable API. These doubles let engine and integration
//! tests drive full pipelines deterministically: the backend replays
//! queued results or answers through a responder closure, and the memory
//! store scripts worktree merge outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use shipwright_agent::{
    AgentBackend, AgentRequest, AgentResult, AgentStatus, TimeoutKind,
};
use shipwright_utils::error::StoreError;
use shipwright_utils::types::TokenUsage;

use crate::ports::{ArtifactStore, KnowledgeEntry, KnowledgeStore, MergeOutcome};

type Responder = dyn Fn(&AgentRequest) -> Option<AgentResult> + Send + Sync;

/// Scripted [`AgentBackend`]: pops queued results in order, then consults
/// the responder, then falls back to a default `done` result.
pub struct ScriptedBackend {
    queue: Mutex<VecDeque<AgentResult>>,
    responder: Option<Box<Responder>>,
    default: AgentResult,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default_done("ok")
    }

    /// A backend whose fallback response is `done` with the given text.
    #[must_use]
    pub fn default_done(text: &str) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            default: Self::done_result(text),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Route unqueued requests through a closure. Return `None` to fall
    /// back to the default result.
    #[must_use]
    pub fn with_responder(
        mut self,
        responder: impl Fn(&AgentRequest) -> Option<AgentResult> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Queue one result; queued results win over the responder.
    pub fn push(&self, result: AgentResult) {
        self.queue.lock().unwrap().push_back(result);
    }

    /// Every request seen so far, in arrival order.
    #[must_use]
    pub fn recorded_requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Prompts of every request seen so far.
    #[must_use]
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    // ----- result constructors -----

    #[must_use]
    pub fn done_result(text: &str) -> AgentResult {
        Self::done_with_usage(text, 0, 0)
    }

    #[must_use]
    pub fn done_with_usage(text: &str, input: u64, output: u64) -> AgentResult {
        AgentResult {
            status: AgentStatus::Done,
            stdout: text.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            timeout_kind: None,
            final_text: text.to_string(),
            token_usage: TokenUsage::new(input, output),
            duration: Duration::from_millis(5),
        }
    }

    #[must_use]
    pub fn failed_result(stderr: &str) -> AgentResult {
        AgentResult {
            status: AgentStatus::Failed,
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
            timeout_kind: None,
            final_text: String::new(),
            token_usage: TokenUsage::default(),
            duration: Duration::from_millis(5),
        }
    }

    #[must_use]
    pub fn rate_limited_result() -> AgentResult {
        AgentResult {
            status: AgentStatus::RateLimited,
            stdout: String::new(),
            stderr: "429 rate limit exceeded".to_string(),
            exit_code: Some(1),
            timeout_kind: None,
            final_text: String::new(),
            token_usage: TokenUsage::default(),
            duration: Duration::from_millis(5),
        }
    }

    #[must_use]
    pub fn timeout_result(kind: TimeoutKind) -> AgentResult {
        AgentResult {
            status: AgentStatus::Timeout,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timeout_kind: Some(kind),
            final_text: String::new(),
            token_usage: TokenUsage::default(),
            duration: Duration::from_millis(5),
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn invoke(&self, request: &AgentRequest) -> AgentResult {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(result) = self.queue.lock().unwrap().pop_front() {
            return result;
        }
        if let Some(responder) = &self.responder {
            if let Some(result) = responder(request) {
                return result;
            }
        }
        self.default.clone()
    }
}

/// In-memory [`ArtifactStore`] with scriptable worktree merge outcomes.
pub struct MemoryArtifactStore {
    files: Mutex<HashMap<(String, String), String>>,
    merges: Mutex<VecDeque<MergeOutcome>>,
    merge_calls: Mutex<Vec<Vec<String>>>,
    diff: Mutex<String>,
}

impl MemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            merges: Mutex::new(VecDeque::new()),
            merge_calls: Mutex::new(Vec::new()),
            diff: Mutex::new(String::new()),
        }
    }

    /// Queue the outcome of the next `merge_worktrees` call; unqueued
    /// calls merge cleanly.
    pub fn script_merge(&self, outcome: MergeOutcome) {
        self.merges.lock().unwrap().push_back(outcome);
    }

    /// Set the diff text returned by `worktree_diff`.
    pub fn set_diff(&self, diff: &str) {
        *self.diff.lock().unwrap() = diff.to_string();
    }

    /// Project lists passed to `merge_worktrees`, in call order.
    #[must_use]
    pub fn merge_calls(&self) -> Vec<Vec<String>> {
        self.merge_calls.lock().unwrap().clone()
    }

    /// Direct read access for assertions.
    #[must_use]
    pub fn content(&self, task_id: &str, name: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(task_id.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of artifacts saved for a task, sorted.
    #[must_use]
    pub fn saved_names(&self, task_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|(t, _)| t == task_id)
            .map(|(_, n)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Seed an artifact directly.
    pub fn seed(&self, task_id: &str, name: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert((task_id.to_string(), name.to_string()), content.to_string());
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn load_artifact(&self, task_id: &str, name: &str) -> Result<String, StoreError> {
        self.content(task_id, name).ok_or_else(|| StoreError::NotFound {
            task_id: task_id.to_string(),
            name: name.to_string(),
        })
    }

    async fn save_artifact(
        &self,
        task_id: &str,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.seed(task_id, name, content);
        Ok(())
    }

    async fn merge_worktrees(
        &self,
        _task_id: &str,
        projects: &[String],
    ) -> Result<MergeOutcome, StoreError> {
        self.merge_calls.lock().unwrap().push(projects.to_vec());
        Ok(self
            .merges
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MergeOutcome::Clean))
    }

    async fn worktree_diff(&self, _task_id: &str, _project: &str) -> Result<String, StoreError> {
        Ok(self.diff.lock().unwrap().clone())
    }

    fn sanitize_content(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Knowledge store returning a fixed entry list.
pub struct StaticKnowledge {
    entries: Vec<KnowledgeEntry>,
}

impl StaticKnowledge {
    #[must_use]
    pub fn new(entries: Vec<(&str, &str)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(title, body)| KnowledgeEntry {
                    title: title.to_string(),
                    body: body.to_string(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl KnowledgeStore for StaticKnowledge {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, StoreError> {
        Ok(self.entries.iter().take(limit).cloned().collect())
    }
}

/// Knowledge store that is always unreachable; callers must swallow it.
pub struct UnreachableKnowledge;

#[async_trait]
impl KnowledgeStore for UnreachableKnowledge {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<KnowledgeEntry>, StoreError> {
        Err(StoreError::Unsupported {
            operation: "knowledge search (store offline)".to_string(),
        })
    }
}
