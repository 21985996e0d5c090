use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::RunConfig;
use crate::error::{AgentError, AgentResult};
use crate::ports::{with_retries, CompletionPort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

// Statuses only move forward: pending -> in_progress -> {done, failed}.
// A terminal unit never re-enters the queue.
fn advance(status: &mut TaskStatus, next: TaskStatus) {
    if status.is_terminal() {
        tracing::warn!(?status, ?next, "ignoring status change on terminal unit");
        return;
    }
    *status = next;
}

/// One research unit, owned exclusively by the research loop.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
        }
    }

    pub fn start(&mut self) {
        advance(&mut self.status, TaskStatus::InProgress);
    }

    pub fn finish(&mut self) {
        advance(&mut self.status, TaskStatus::Done);
    }

    pub fn fail(&mut self) {
        advance(&mut self.status, TaskStatus::Failed);
    }
}

/// One writing unit. `relevant_task_ids` is the section's retrieval
/// scope: the writing executor may only see Findings from these tasks.
#[derive(Debug, Clone)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub relevant_task_ids: BTreeSet<String>,
}

impl Section {
    pub fn new(id: impl Into<String>, title: impl Into<String>, relevant_task_ids: BTreeSet<String>) -> Self {
        Section {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Pending,
            relevant_task_ids,
        }
    }

    pub fn start(&mut self) {
        advance(&mut self.status, TaskStatus::InProgress);
    }

    pub fn finish(&mut self) {
        advance(&mut self.status, TaskStatus::Done);
    }

    pub fn fail(&mut self) {
        advance(&mut self.status, TaskStatus::Failed);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub narrative_frame: String,
    pub research_tasks: Vec<Task>,
    pub writing_tasks: Vec<Section>,
}

impl Plan {
    pub fn task_ids(&self) -> BTreeSet<String> {
        self.research_tasks.iter().map(|t| t.id.clone()).collect()
    }
}

/// What a supervisor scan over an ordered unit list can conclude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NoPlan,
    HasNextTask(usize),
    AllDone,
}

pub trait WorkItem {
    fn status(&self) -> TaskStatus;
}

impl WorkItem for Task {
    fn status(&self) -> TaskStatus {
        self.status
    }
}

impl WorkItem for Section {
    fn status(&self) -> TaskStatus {
        self.status
    }
}

/// The supervisor transition rule shared by both loops: first Pending
/// unit in order wins; none left means the loop is done. Re-scanned on
/// every iteration, so skip/fail semantics stay trivial.
pub fn next_pending<T: WorkItem>(items: &[T]) -> SupervisorState {
    if items.is_empty() {
        return SupervisorState::NoPlan;
    }
    for (i, item) in items.iter().enumerate() {
        if item.status() == TaskStatus::Pending {
            return SupervisorState::HasNextTask(i);
        }
    }
    SupervisorState::AllDone
}

/// Extract the first balanced JSON object from model output, tolerating
/// code fences and surrounding chatter.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct ResearchPlanPayload {
    narrative_frame: String,
    tasks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SectionPlanPayload {
    sections: Vec<SectionPayload>,
}

#[derive(Debug, Deserialize)]
struct SectionPayload {
    title: String,
    #[serde(default)]
    task_ids: Vec<String>,
}

/// Two-phase planner. Phase one produces the narrative frame and the
/// research tasks before any research runs; phase two produces the
/// section list after research, so structure reflects what was actually
/// found.
pub struct Planner<'a> {
    completion: &'a dyn CompletionPort,
    cfg: &'a RunConfig,
}

impl<'a> Planner<'a> {
    pub fn new(completion: &'a dyn CompletionPort, cfg: &'a RunConfig) -> Self {
        Planner { completion, cfg }
    }

    async fn complete(&self, prompt: &str) -> AgentResult<String> {
        with_retries(
            self.cfg.max_attempts,
            self.cfg.backoff(),
            self.cfg.request_timeout(),
            || self.completion.complete(prompt),
        )
        .await
    }

    /// Phase one. Transient exhaustion here is the caller's problem (no
    /// plan at all is run-fatal); malformed structure is retried once
    /// with a stricter instruction, then falls back to a single task
    /// covering the whole topic.
    pub async fn plan_research(&self, topic: &str) -> AgentResult<Plan> {
        let raw = self
            .complete(&research_plan_prompt(topic, self.cfg.max_research_tasks, false))
            .await?;

        match self.parse_research_plan(&raw) {
            Ok(plan) => return Ok(plan),
            Err(e) => tracing::warn!("research plan malformed, retrying strictly: {}", e),
        }

        let strict = self
            .complete(&research_plan_prompt(topic, self.cfg.max_research_tasks, true))
            .await
            .and_then(|raw| self.parse_research_plan(&raw));

        match strict {
            Ok(plan) => Ok(plan),
            Err(e) => {
                tracing::warn!("research planning failed twice ({}), using fallback plan", e);
                Ok(Plan {
                    narrative_frame: topic.to_string(),
                    research_tasks: vec![Task::new("r1", format!("Research the topic: {}", topic))],
                    writing_tasks: Vec::new(),
                })
            }
        }
    }

    fn parse_research_plan(&self, raw: &str) -> AgentResult<Plan> {
        let json = extract_json_object(raw)
            .ok_or_else(|| AgentError::PlanningMalformed("no JSON object in output".into()))?;
        let payload: ResearchPlanPayload = serde_json::from_str(json)
            .map_err(|e| AgentError::PlanningMalformed(e.to_string()))?;

        let research_tasks: Vec<Task> = payload
            .tasks
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .take(self.cfg.max_research_tasks)
            .enumerate()
            .map(|(i, d)| Task::new(format!("r{}", i + 1), d))
            .collect();

        if research_tasks.is_empty() {
            return Err(AgentError::PlanningMalformed("plan contained no tasks".into()));
        }

        Ok(Plan {
            narrative_frame: payload.narrative_frame.trim().to_string(),
            research_tasks,
            writing_tasks: Vec::new(),
        })
    }

    /// Phase two, after research: fills `plan.writing_tasks` from the
    /// overall brief. Any failure degrades to a single section over all
    /// tasks; research already succeeded, so this never aborts the run.
    pub async fn plan_sections(&self, topic: &str, brief: &str, plan: &mut Plan) {
        let prompt = section_plan_prompt(topic, plan, brief, self.cfg.max_sections, false);
        let first = match self.complete(&prompt).await {
            Ok(raw) => self.parse_sections(&raw, plan),
            Err(e) => Err(e),
        };

        let sections = match first {
            Ok(sections) => Some(sections),
            Err(e) => {
                tracing::warn!("section plan malformed, retrying strictly: {}", e);
                let strict_prompt =
                    section_plan_prompt(topic, plan, brief, self.cfg.max_sections, true);
                match self.complete(&strict_prompt).await {
                    Ok(raw) => self.parse_sections(&raw, plan).ok(),
                    Err(_) => None,
                }
            }
        };

        plan.writing_tasks = sections.unwrap_or_else(|| {
            tracing::warn!("section planning failed twice, using fallback outline");
            vec![Section::new("s1", "Overview", plan.task_ids())]
        });
    }

    fn parse_sections(&self, raw: &str, plan: &Plan) -> AgentResult<Vec<Section>> {
        let json = extract_json_object(raw)
            .ok_or_else(|| AgentError::PlanningMalformed("no JSON object in output".into()))?;
        let payload: SectionPlanPayload = serde_json::from_str(json)
            .map_err(|e| AgentError::PlanningMalformed(e.to_string()))?;

        let known = plan.task_ids();
        let sections: Vec<Section> = payload
            .sections
            .into_iter()
            .filter(|s| !s.title.trim().is_empty())
            .take(self.cfg.max_sections)
            .enumerate()
            .map(|(i, s)| {
                let mut scope: BTreeSet<String> = s
                    .task_ids
                    .into_iter()
                    .filter(|id| known.contains(id))
                    .collect();
                // A section the planner did not tie to any real task gets
                // the whole corpus; an empty scope would starve it.
                if scope.is_empty() {
                    scope = known.clone();
                }
                Section::new(format!("s{}", i + 1), s.title.trim(), scope)
            })
            .collect();

        if sections.is_empty() {
            return Err(AgentError::PlanningMalformed("plan contained no sections".into()));
        }
        Ok(sections)
    }
}

fn research_plan_prompt(topic: &str, max_tasks: usize, strict: bool) -> String {
    let strict_note = if strict {
        "\n\nYour previous answer could not be parsed. Respond with ONLY the JSON object: no prose, no markdown, no code fences."
    } else {
        ""
    };
    format!(
        "You are planning research for an article.\n\n\
        Topic: {topic}\n\n\
        Decide on a narrative frame for the article, then break the topic into at most {max_tasks} \
        independent research tasks that together cover it.\n\n\
        Respond with a JSON object in exactly this shape:\n\
        {{\"narrative_frame\": \"<one sentence>\", \"tasks\": [\"<task description>\", ...]}}{strict_note}"
    )
}

fn section_plan_prompt(topic: &str, plan: &Plan, brief: &str, max_sections: usize, strict: bool) -> String {
    let task_list = plan
        .research_tasks
        .iter()
        .map(|t| format!("- {}: {}", t.id, t.description))
        .collect::<Vec<_>>()
        .join("\n");
    let strict_note = if strict {
        "\n\nYour previous answer could not be parsed. Respond with ONLY the JSON object: no prose, no markdown, no code fences."
    } else {
        ""
    };
    format!(
        "You are outlining an article now that research is complete.\n\n\
        Topic: {topic}\n\
        Narrative frame: {frame}\n\n\
        Research brief:\n{brief}\n\n\
        Research tasks and their ids:\n{task_list}\n\n\
        Propose at most {max_sections} sections in reading order. For each section list the ids of \
        the research tasks it should draw on.\n\n\
        Respond with a JSON object in exactly this shape:\n\
        {{\"sections\": [{{\"title\": \"<section title>\", \"task_ids\": [\"r1\", ...]}}, ...]}}{strict_note}",
        frame = plan.narrative_frame,
    )
}
