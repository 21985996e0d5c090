use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::AgentResult;
use crate::memory::{Finding, ResearchMemory};
use crate::plan::{next_pending, Plan, SupervisorState};
use crate::ports::{with_retries, CompletionPort, Passage, RetrievalPort};
use crate::progress::{ProgressEmitter, ProgressKind};

/// Research supervisor/executor loop. The supervisor re-scans the task
/// list each iteration for the first pending task and dispatches it; a
/// failed task is contained (marked and skipped) so the loop always
/// reaches the all-done state.
pub struct ResearchLoop<'a> {
    completion: &'a dyn CompletionPort,
    retrieval: &'a dyn RetrievalPort,
    emitter: &'a ProgressEmitter,
    cfg: &'a RunConfig,
    cancel: &'a CancellationToken,
}

impl<'a> ResearchLoop<'a> {
    pub fn new(
        completion: &'a dyn CompletionPort,
        retrieval: &'a dyn RetrievalPort,
        emitter: &'a ProgressEmitter,
        cfg: &'a RunConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        ResearchLoop {
            completion,
            retrieval,
            emitter,
            cfg,
            cancel,
        }
    }

    pub async fn run(&self, plan: &mut Plan, memory: &mut ResearchMemory) {
        let total = plan.research_tasks.len();

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("cancelled, not dispatching further research tasks");
                break;
            }

            match next_pending(&plan.research_tasks) {
                SupervisorState::NoPlan | SupervisorState::AllDone => break,
                SupervisorState::HasNextTask(i) => {
                    let task_id = plan.research_tasks[i].id.clone();
                    let description = plan.research_tasks[i].description.clone();

                    self.emitter
                        .progress(ProgressKind::Research, i + 1, total, &description);
                    plan.research_tasks[i].start();

                    match self.execute(&task_id, &description).await {
                        Ok(finding) => {
                            tracing::info!(task = %task_id, sources = finding.sources.len(), "research task done");
                            memory.insert(finding);
                            plan.research_tasks[i].finish();
                        }
                        Err(e) => {
                            tracing::warn!(task = %task_id, "research task failed: {}", e);
                            plan.research_tasks[i].fail();
                        }
                    }
                }
            }
        }
    }

    /// One research task: retrieve passages for it, then have the model
    /// synthesize a Finding from them. No passages (or a retrieval
    /// error) degrades to completion-only synthesis with an empty
    /// source set; only completion exhaustion fails the task.
    async fn execute(&self, task_id: &str, description: &str) -> AgentResult<Finding> {
        let scope: BTreeSet<String> = [task_id.to_string()].into();

        let passages = match self.retrieval.retrieve(&scope, description).await {
            Ok(passages) => passages,
            Err(e) => {
                tracing::warn!(task = %task_id, "retrieval failed ({}), continuing without passages", e);
                Vec::new()
            }
        };

        let prompt = research_prompt(description, &passages);
        let content = with_retries(
            self.cfg.max_attempts,
            self.cfg.backoff(),
            self.cfg.request_timeout(),
            || self.completion.complete(&prompt),
        )
        .await?;

        let sources = passages.into_iter().map(|p| p.source).collect();
        Ok(Finding::new(task_id, content, sources))
    }
}

fn research_prompt(description: &str, passages: &[Passage]) -> String {
    if passages.is_empty() {
        return format!(
            "Research task: {description}\n\n\
            No reference passages are available. Write what is reliably known about this task \
            from general knowledge. Do not invent sources or cite anything."
        );
    }

    let passage_block = passages
        .iter()
        .map(|p| format!("- {} ({}): {}", p.source.url, p.source.title, p.text))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "CITATION REQUIREMENT: When citing sources, ALWAYS use the full URL in the format \
        [Source: https://full-url.com]. Cite only URLs listed below.\n\n\
        Research task: {description}\n\n\
        Reference passages:\n{passage_block}\n\n\
        Synthesize the findings for this task from the passages above. Keep every relevant fact \
        and attach its source."
    )
}
