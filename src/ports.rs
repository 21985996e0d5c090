use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use crate::citations::SourceRef;
use crate::error::{AgentError, AgentResult};

/// One ranked retrieval hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub text: String,
    pub source: SourceRef,
}

/// Text generation, consumed by every stage that talks to the model.
/// Implementations report failures as the transient kind; structural
/// problems with the returned text are the caller's to judge.
#[async_trait]
pub trait CompletionPort: Send + Sync {
    async fn complete(&self, prompt: &str) -> AgentResult<String>;
}

/// Ranked passages for a query, restricted to the given task-id scope.
/// The scope is a hard contract: no returned passage may belong to a
/// task outside it.
#[async_trait]
pub trait RetrievalPort: Send + Sync {
    async fn retrieve(&self, scope: &BTreeSet<String>, query: &str) -> AgentResult<Vec<Passage>>;
}

/// Run `call` with a per-call timeout, retrying transient failures with
/// exponential backoff up to `max_attempts` total attempts. A timeout
/// counts as transient. Non-transient errors return immediately.
pub async fn with_retries<T, F, Fut>(
    max_attempts: usize,
    base_backoff: Duration,
    per_call_timeout: Duration,
    mut call: F,
) -> AgentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0usize;

    loop {
        let outcome = match tokio::time::timeout(per_call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::transient("call timed out")),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = base_backoff * 2u32.pow(attempt as u32);
                tracing::warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "transient failure, retrying: {}", e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Completion port replaying a scripted queue of outcomes. When the
    /// queue runs dry it returns the fallback text, or a transient error
    /// if none was set.
    pub struct ScriptedCompletion {
        script: Mutex<VecDeque<AgentResult<String>>>,
        fallback: Option<String>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedCompletion {
        pub fn new(script: Vec<AgentResult<String>>) -> Self {
            ScriptedCompletion {
                script: Mutex::new(script.into()),
                fallback: None,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn always(text: &str) -> Self {
            ScriptedCompletion {
                script: Mutex::new(VecDeque::new()),
                fallback: Some(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            ScriptedCompletion {
                script: Mutex::new(VecDeque::new()),
                fallback: None,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn prompt_log(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionPort for ScriptedCompletion {
        async fn complete(&self, prompt: &str) -> AgentResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return next;
            }
            match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(AgentError::transient("scripted failure")),
            }
        }
    }

    /// Retrieval port over passages pre-tagged with a task id. Only
    /// entries tagged inside the requested scope come back, which is
    /// what the scope-leakage tests assert against.
    pub struct TaggedRetrieval {
        entries: Vec<(String, Passage)>,
        fail: bool,
        pub queries: Mutex<Vec<(BTreeSet<String>, String)>>,
    }

    impl TaggedRetrieval {
        pub fn new(entries: Vec<(String, Passage)>) -> Self {
            TaggedRetrieval {
                entries,
                fail: false,
                queries: Mutex::new(Vec::new()),
            }
        }

        pub fn empty() -> Self {
            Self::new(Vec::new())
        }

        pub fn failing() -> Self {
            TaggedRetrieval {
                entries: Vec::new(),
                fail: true,
                queries: Mutex::new(Vec::new()),
            }
        }

        pub fn entry(task_id: &str, url: &str, text: &str) -> (String, Passage) {
            (
                task_id.to_string(),
                Passage {
                    text: text.to_string(),
                    source: SourceRef::new(url, format!("Title for {}", url)),
                },
            )
        }
    }

    #[async_trait]
    impl RetrievalPort for TaggedRetrieval {
        async fn retrieve(
            &self,
            scope: &BTreeSet<String>,
            query: &str,
        ) -> AgentResult<Vec<Passage>> {
            self.queries
                .lock()
                .unwrap()
                .push((scope.clone(), query.to_string()));
            if self.fail {
                return Err(AgentError::Retrieval("scripted retrieval failure".into()));
            }
            Ok(self
                .entries
                .iter()
                .filter(|(tag, _)| scope.contains(tag))
                .map(|(_, p)| p.clone())
                .collect())
        }
    }
}
