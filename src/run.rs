use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::citations::{self, AssembledDocument, CitationAssembler};
use crate::config::RunConfig;
use crate::error::{AgentError, AgentResult};
use crate::memory::ResearchMemory;
use crate::plan::Planner;
use crate::ports::{CompletionPort, RetrievalPort};
use crate::progress::{ProgressEmitter, RunEvent};
use crate::research::ResearchLoop;
use crate::summarize::Summarizer;
use crate::writing::WritingLoop;

/// What the transport collaborator hands over: one message (the topic)
/// and the session it belongs to. Triggers exactly one run.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub message: String,
    pub session_id: String,
}

/// One configured agent. Holds the two ports and the run policy;
/// everything per-run (plan, memory, citation registry) lives on the
/// stack of `run`, so concurrent runs never share state.
pub struct Agent {
    completion: Arc<dyn CompletionPort>,
    retrieval: Arc<dyn RetrievalPort>,
    cfg: RunConfig,
}

impl Agent {
    pub fn new(
        completion: Arc<dyn CompletionPort>,
        retrieval: Arc<dyn RetrievalPort>,
        cfg: RunConfig,
    ) -> Self {
        Agent {
            completion,
            retrieval,
            cfg,
        }
    }

    /// Run to a terminal event, whatever happens: on success the stream
    /// ends `references, sources, [DONE]`; on a fatal error it ends
    /// `error, [DONE]`. Returns the document for persistence.
    pub async fn execute(
        &self,
        request: &RunRequest,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Option<AssembledDocument> {
        tracing::info!(session = %request.session_id, "starting run");

        match self.run(&request.message, emitter, cancel).await {
            Ok(document) => {
                emitter.emit(RunEvent::Done);
                Some(document)
            }
            Err(e) => {
                tracing::error!("run failed: {}", e);
                emitter.emit(RunEvent::Error {
                    error: e.to_string(),
                });
                emitter.emit(RunEvent::Done);
                None
            }
        }
    }

    /// Plan -> research loop -> summarizers -> section plan -> writing
    /// loop -> assembly. The loops run strictly in sequence; sections
    /// may depend on the complete research brief.
    async fn run(
        &self,
        topic: &str,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> AgentResult<AssembledDocument> {
        let planner = Planner::new(self.completion.as_ref(), &self.cfg);

        let mut plan = planner
            .plan_research(topic)
            .await
            .map_err(|e| AgentError::fatal(format!("no research plan could be produced: {}", e)))?;
        tracing::info!(tasks = plan.research_tasks.len(), "research plan ready");

        let mut memory = ResearchMemory::new();
        ResearchLoop::new(
            self.completion.as_ref(),
            self.retrieval.as_ref(),
            emitter,
            &self.cfg,
            cancel,
        )
        .run(&mut plan, &mut memory)
        .await;
        check_cancel(cancel)?;

        let brief = Summarizer::new(self.completion.as_ref(), &self.cfg)
            .brief(topic, &plan.narrative_frame, &memory)
            .await;
        check_cancel(cancel)?;

        planner.plan_sections(topic, &brief, &mut plan).await;
        tracing::info!(sections = plan.writing_tasks.len(), "writing plan ready");
        check_cancel(cancel)?;

        let mut assembler = CitationAssembler::new();
        let drafts = WritingLoop::new(
            self.completion.as_ref(),
            self.retrieval.as_ref(),
            emitter,
            &self.cfg,
            cancel,
        )
        .run(&mut plan, &memory, &brief, &mut assembler)
        .await;
        check_cancel(cancel)?;

        let document = citations::assemble(&drafts);
        emitter.emit(RunEvent::References {
            content: document.references.clone(),
        });
        emitter.emit(RunEvent::Sources {
            sources: document.sources.clone(),
        });

        Ok(document)
    }
}

fn check_cancel(cancel: &CancellationToken) -> AgentResult<()> {
    if cancel.is_cancelled() {
        Err(AgentError::fatal("run cancelled"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::fakes::{ScriptedCompletion, TaggedRetrieval};
    use crate::progress::ProgressKind;
    use tokio::sync::mpsc;

    fn cfg() -> RunConfig {
        RunConfig {
            backoff_ms: 1,
            request_timeout_secs: 5,
            ..RunConfig::default()
        }
    }

    fn request(topic: &str) -> RunRequest {
        RunRequest {
            message: topic.to_string(),
            session_id: "session-1".to_string(),
        }
    }

    async fn run_agent(
        completion: ScriptedCompletion,
        retrieval: TaggedRetrieval,
        topic: &str,
    ) -> (Option<AssembledDocument>, Vec<RunEvent>) {
        let agent = Agent::new(Arc::new(completion), Arc::new(retrieval), cfg());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = ProgressEmitter::new(tx);
        let cancel = CancellationToken::new();

        let document = agent.execute(&request(topic), &emitter, &cancel).await;
        drop(emitter);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (document, events)
    }

    fn count_progress(events: &[RunEvent], want: ProgressKind) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, RunEvent::Progress { kind, .. } if *kind == want))
            .count()
    }

    #[tokio::test]
    async fn test_full_run_event_stream_and_document() {
        let completion = ScriptedCompletion::new(vec![
            // phase one plan
            Ok(r#"{"narrative_frame": "From lab to market", "tasks": ["invention context", "commercial impact"]}"#.to_string()),
            // research executors
            Ok("Findings on the invention.".to_string()),
            Ok("Findings on the market.".to_string()),
            // overall synthesis
            Ok("the brief".to_string()),
            // phase two plan
            Ok(r#"{"sections": [{"title": "Invention", "task_ids": ["r1"]}, {"title": "Impact", "task_ids": ["r2"]}]}"#.to_string()),
            // section executors
            Ok("Bell Labs built it [Source: https://r1.example].".to_string()),
            Ok("Markets shifted [Source: https://r2.example].".to_string()),
        ]);
        let retrieval = TaggedRetrieval::new(vec![
            TaggedRetrieval::entry("r1", "https://r1.example", "invention passage"),
            TaggedRetrieval::entry("r2", "https://r2.example", "impact passage"),
        ]);

        let (document, events) =
            run_agent(completion, retrieval, "History of the transistor").await;

        // one progress event per task per loop
        assert_eq!(count_progress(&events, ProgressKind::Research), 2);
        assert_eq!(count_progress(&events, ProgressKind::Writing), 2);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RunEvent::Chapter { .. }))
                .count(),
            2
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RunEvent::References { .. }))
                .count(),
            1
        );

        // research progress strictly precedes writing progress
        let first_writing = events
            .iter()
            .position(|e| matches!(e, RunEvent::Progress { kind: ProgressKind::Writing, .. }))
            .unwrap();
        let last_research = events
            .iter()
            .rposition(|e| matches!(e, RunEvent::Progress { kind: ProgressKind::Research, .. }))
            .unwrap();
        assert!(last_research < first_writing);

        // terminal sentinel closes the stream
        assert_eq!(events.last(), Some(&RunEvent::Done));

        let document = document.unwrap();
        assert!(document.body.contains("[1]"));
        assert!(document.body.contains("[2]"));
        // bibliography length equals distinct source urls across findings
        assert_eq!(document.sources.len(), 2);
        assert!(document.references.contains("## References"));
    }

    #[tokio::test]
    async fn test_unreachable_completion_port_is_run_fatal() {
        let (document, events) =
            run_agent(ScriptedCompletion::failing(), TaggedRetrieval::empty(), "topic").await;

        assert!(document.is_none());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunEvent::Error { .. }));
        assert_eq!(events[1], RunEvent::Done);
    }

    #[tokio::test]
    async fn test_failed_task_contained_run_still_terminates() {
        let completion = ScriptedCompletion::new(vec![
            Ok(r#"{"narrative_frame": "f", "tasks": ["works", "breaks"]}"#.to_string()),
            // r1 succeeds
            Ok("Findings from the working task.".to_string()),
            // r2 exhausts both attempts
            Err(AgentError::transient("down")),
            Err(AgentError::transient("down")),
            // synthesis
            Ok("the brief".to_string()),
            // section plan pulls from both tasks; only r1 has a finding
            Ok(r#"{"sections": [{"title": "Overview", "task_ids": ["r1", "r2"]}]}"#.to_string()),
            // section prose cites the one real source and one fabrication
            Ok("Claim [Source: https://r1.example]. Fake [Source: https://nowhere.example]."
                .to_string()),
        ]);
        let retrieval = TaggedRetrieval::new(vec![TaggedRetrieval::entry(
            "r1",
            "https://r1.example",
            "passage",
        )]);

        let agent = Agent::new(Arc::new(completion), Arc::new(retrieval), cfg());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = ProgressEmitter::new(tx);
        let cancel = CancellationToken::new();

        let document = agent.execute(&request("topic"), &emitter, &cancel).await.unwrap();
        drop(emitter);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        // both research tasks were dispatched despite the failure
        assert_eq!(count_progress(&events, ProgressKind::Research), 2);
        assert_eq!(events.last(), Some(&RunEvent::Done));

        // the orphan marker was dropped, the real one numbered
        assert!(document.body.contains("Claim [1]."));
        assert!(document.body.contains("Fake."));
        assert_eq!(document.sources, vec!["https://r1.example"]);
    }

    #[tokio::test]
    async fn test_degraded_run_with_no_retrieval_at_all() {
        let completion = ScriptedCompletion::new(vec![
            Ok(r#"{"narrative_frame": "f", "tasks": ["only task"]}"#.to_string()),
            Ok("Knowledge-only findings.".to_string()),
            Ok("the brief".to_string()),
            Ok(r#"{"sections": [{"title": "Overview", "task_ids": ["r1"]}]}"#.to_string()),
            // the model fabricates a citation; nothing is citable
            Ok("Uncited prose [Source: https://fabricated.example].".to_string()),
        ]);

        let (document, events) =
            run_agent(completion, TaggedRetrieval::empty(), "topic").await;

        let document = document.unwrap();
        assert!(document.sources.is_empty());
        assert!(document.references.is_empty());
        assert!(document.body.contains("Uncited prose."));
        assert!(!document.body.contains("[1]"));

        // references event still emitted, with empty content
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::References { content } if content.is_empty())));
        assert_eq!(events.last(), Some(&RunEvent::Done));
    }

    #[tokio::test]
    async fn test_cancelled_run_emits_error_then_done() {
        // planning still answers (falls back to the default plan), but
        // the research loop must not dispatch anything
        let completion = ScriptedCompletion::always("unparsable plan text");
        let retrieval = TaggedRetrieval::empty();
        let agent = Agent::new(Arc::new(completion), Arc::new(retrieval), cfg());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = ProgressEmitter::new(tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let document = agent.execute(&request("topic"), &emitter, &cancel).await;
        drop(emitter);

        assert!(document.is_none());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(
            &events[events.len() - 2],
            RunEvent::Error { error } if error.contains("cancelled")
        ));
        assert_eq!(events.last(), Some(&RunEvent::Done));

        // the plan's tasks were never dispatched
        assert_eq!(count_progress(&events, ProgressKind::Research), 0);
    }

    #[test]
    fn test_run_request_parses_transport_payload() {
        let request: RunRequest =
            serde_json::from_str(r#"{"message": "topic", "session_id": "abc"}"#).unwrap();
        assert_eq!(request.message, "topic");
        assert_eq!(request.session_id, "abc");
    }

    #[tokio::test]
    async fn test_run_with_unwritable_section_still_terminates() {
        let completion = ScriptedCompletion::new(vec![
            Ok(r#"{"narrative_frame": "f", "tasks": ["t"]}"#.to_string()),
            Ok("findings".to_string()),
            Ok("brief".to_string()),
            Ok(r#"{"sections": [{"title": "S", "task_ids": ["r1"]}]}"#.to_string()),
            Err(AgentError::transient("down")),
            Err(AgentError::transient("down")),
        ]);

        let (document, events) =
            run_agent(completion, TaggedRetrieval::empty(), "topic").await;

        let document = document.unwrap();
        assert!(document.body.contains("stub"));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::Chapter { content, .. } if content.contains("stub"))));
        assert_eq!(events.last(), Some(&RunEvent::Done));
    }
}
