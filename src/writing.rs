use tokio_util::sync::CancellationToken;

use crate::citations::{CitationAssembler, DraftSection, SourceRef};
use crate::config::RunConfig;
use crate::error::AgentResult;
use crate::memory::{Finding, ResearchMemory};
use crate::plan::{next_pending, Plan, Section, SupervisorState};
use crate::ports::{with_retries, CompletionPort, Passage, RetrievalPort};
use crate::progress::{ProgressEmitter, ProgressKind, RunEvent};

/// Writing supervisor/executor loop. Structurally the research loop's
/// mirror, but each executor call sees Research Memory only through the
/// section's `relevant_task_ids` scope, and every finished section is
/// renumbered and streamed as a chapter immediately.
pub struct WritingLoop<'a> {
    completion: &'a dyn CompletionPort,
    retrieval: &'a dyn RetrievalPort,
    emitter: &'a ProgressEmitter,
    cfg: &'a RunConfig,
    cancel: &'a CancellationToken,
}

impl<'a> WritingLoop<'a> {
    pub fn new(
        completion: &'a dyn CompletionPort,
        retrieval: &'a dyn RetrievalPort,
        emitter: &'a ProgressEmitter,
        cfg: &'a RunConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        WritingLoop {
            completion,
            retrieval,
            emitter,
            cfg,
            cancel,
        }
    }

    pub async fn run(
        &self,
        plan: &mut Plan,
        memory: &ResearchMemory,
        brief: &str,
        assembler: &mut CitationAssembler,
    ) -> Vec<DraftSection> {
        let total = plan.writing_tasks.len();
        let mut drafts = Vec::with_capacity(total);

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("cancelled, not dispatching further sections");
                break;
            }

            match next_pending(&plan.writing_tasks) {
                SupervisorState::NoPlan | SupervisorState::AllDone => break,
                SupervisorState::HasNextTask(i) => {
                    let section = plan.writing_tasks[i].clone();

                    self.emitter
                        .progress(ProgressKind::Writing, i + 1, total, &section.title);
                    plan.writing_tasks[i].start();

                    let scoped = memory.scoped(&section.relevant_task_ids);
                    let allowed = allowed_sources(&scoped);

                    let draft = match self.execute(&section, brief, &scoped, &allowed).await {
                        Ok(text) => {
                            plan.writing_tasks[i].finish();
                            DraftSection {
                                section_id: section.id.clone(),
                                title: section.title.clone(),
                                text,
                                sources: allowed,
                            }
                        }
                        Err(e) => {
                            tracing::warn!(section = %section.id, "section failed: {}", e);
                            plan.writing_tasks[i].fail();
                            DraftSection {
                                section_id: section.id.clone(),
                                title: section.title.clone(),
                                text: "*This section could not be generated and was left as a stub.*"
                                    .to_string(),
                                sources: Vec::new(),
                            }
                        }
                    };

                    // Renumber now so the streamed chapter already carries
                    // final citation numbers.
                    let content = assembler.assemble_section(&draft);
                    self.emitter.emit(RunEvent::Chapter {
                        title: draft.title.clone(),
                        content,
                    });
                    drafts.push(draft);
                }
            }
        }

        drafts
    }

    async fn execute(
        &self,
        section: &Section,
        brief: &str,
        scoped: &[&Finding],
        allowed: &[SourceRef],
    ) -> AgentResult<String> {
        // Finer-grained passages from the same scope; failures here only
        // cost context, never the section.
        let passages = match self
            .retrieval
            .retrieve(&section.relevant_task_ids, &section.title)
            .await
        {
            Ok(passages) => passages,
            Err(e) => {
                tracing::warn!(section = %section.id, "scoped re-query failed ({}), writing from findings only", e);
                Vec::new()
            }
        };

        let prompt = writer_prompt(section, brief, scoped, allowed, &passages);
        with_retries(
            self.cfg.max_attempts,
            self.cfg.backoff(),
            self.cfg.request_timeout(),
            || self.completion.complete(&prompt),
        )
        .await
    }
}

fn allowed_sources(scoped: &[&Finding]) -> Vec<SourceRef> {
    let mut seen = std::collections::BTreeSet::new();
    scoped
        .iter()
        .flat_map(|f| f.sources.iter())
        .filter(|s| seen.insert(s.url.clone()))
        .cloned()
        .collect()
}

fn writer_prompt(
    section: &Section,
    brief: &str,
    scoped: &[&Finding],
    allowed: &[SourceRef],
    passages: &[Passage],
) -> String {
    let findings_block = if scoped.is_empty() {
        "(no research findings are available for this section)".to_string()
    } else {
        scoped
            .iter()
            .map(|f| format!("### {}\n{}", f.task_id, f.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let passage_block = if passages.is_empty() {
        String::new()
    } else {
        let lines = passages
            .iter()
            .map(|p| format!("- {}: {}", p.source.url, p.text))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\nSupporting passages:\n{}", lines)
    };

    let source_block = if allowed.is_empty() {
        "This section has no citable sources. Do not add citation markers.".to_string()
    } else {
        let urls = allowed
            .iter()
            .map(|s| format!("- {}", s.url))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "CITATION REQUIREMENT: Mark every claim that needs attribution with [Source: <url>], \
            using ONLY urls from this list:\n{}",
            urls
        )
    };

    format!(
        "You are writing one section of an article.\n\n\
        Section title: {title}\n\n\
        Research brief:\n{brief}\n\n\
        Findings for this section:\n{findings_block}{passage_block}\n\n\
        {source_block}\n\n\
        Write the section prose in markdown, without repeating the section title as a heading.",
        title = section.title,
    )
}
