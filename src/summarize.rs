use crate::config::RunConfig;
use crate::memory::{Finding, ResearchMemory};
use crate::ports::{with_retries, CompletionPort};

/// The two reduction passes between research and writing: condense any
/// oversized Finding, then merge everything into the overall brief that
/// seeds section planning and backs every writing call. Reads Research
/// Memory, mutates nothing.
pub struct Summarizer<'a> {
    completion: &'a dyn CompletionPort,
    cfg: &'a RunConfig,
}

impl<'a> Summarizer<'a> {
    pub fn new(completion: &'a dyn CompletionPort, cfg: &'a RunConfig) -> Self {
        Summarizer { completion, cfg }
    }

    pub async fn brief(&self, topic: &str, narrative_frame: &str, memory: &ResearchMemory) -> String {
        if memory.is_empty() {
            tracing::warn!("no findings to summarize");
            return "No research findings were collected.".to_string();
        }

        let mut condensed = Vec::with_capacity(memory.len());
        for finding in memory.iter() {
            let content = if finding.content.len() > self.cfg.summary_threshold_chars {
                self.condense(finding).await
            } else {
                finding.content.clone()
            };
            condensed.push(format!("### Findings ({})\n{}", finding.task_id, content));
        }
        let merged = condensed.join("\n\n");

        let prompt = format!(
            "You are preparing a research brief for an article.\n\n\
            Topic: {topic}\n\
            Narrative frame: {narrative_frame}\n\n\
            Merge the research findings below into one compact brief that a writer can keep in \
            mind for every section. Keep all key facts and figures; drop repetition and filler.\n\n\
            {merged}"
        );

        match with_retries(
            self.cfg.max_attempts,
            self.cfg.backoff(),
            self.cfg.request_timeout(),
            || self.completion.complete(&prompt),
        )
        .await
        {
            Ok(brief) => brief,
            Err(e) => {
                tracing::warn!("overall synthesis failed ({}), using merged findings as brief", e);
                merged
            }
        }
    }

    async fn condense(&self, finding: &Finding) -> String {
        let prompt = format!(
            "Condense these research findings while preserving all key information:\n\n\
            - Keep ALL facts, data points, and citations\n\
            - Preserve technical details and specifications\n\
            - Remove only redundant explanations and filler words\n\n\
            Research findings:\n{}",
            finding.content
        );

        match with_retries(
            self.cfg.max_attempts,
            self.cfg.backoff(),
            self.cfg.request_timeout(),
            || self.completion.complete(&prompt),
        )
        .await
        {
            Ok(summary) => {
                tracing::debug!(
                    task = %finding.task_id,
                    from = finding.content.len(),
                    to = summary.len(),
                    "condensed finding"
                );
                summary
            }
            Err(e) => {
                tracing::warn!(task = %finding.task_id, "condensation failed ({}), truncating", e);
                let truncated: String = finding
                    .content
                    .chars()
                    .take(self.cfg.summary_threshold_chars)
                    .collect();
                format!("{}...\n\n[Note: content truncated due to length]", truncated)
            }
        }
    }
}
