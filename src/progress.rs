use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

/// Which loop a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Research,
    Writing,
}

/// One outbound event, in the order the run produced it. The transport
/// layer frames these; nothing downstream may reorder or coalesce them.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Progress {
        kind: ProgressKind,
        current: usize,
        total: usize,
        description: String,
    },
    Chapter {
        title: String,
        content: String,
    },
    References {
        content: String,
    },
    Sources {
        sources: Vec<String>,
    },
    Error {
        error: String,
    },
    Done,
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Progress { .. } => "progress",
            RunEvent::Chapter { .. } => "chapter",
            RunEvent::References { .. } => "references",
            RunEvent::Sources { .. } => "sources",
            RunEvent::Error { .. } => "error",
            RunEvent::Done => "message",
        }
    }

    /// The data line payload. JSON for every event except the terminal
    /// sentinel, which is the literal `[DONE]`.
    pub fn payload(&self) -> String {
        match self {
            RunEvent::Progress {
                kind,
                current,
                total,
                description,
            } => json!({
                "type": kind,
                "current": current,
                "total": total,
                "description": description,
            })
            .to_string(),
            RunEvent::Chapter { title, content } => {
                json!({ "title": title, "content": content }).to_string()
            }
            RunEvent::References { content } => json!({ "content": content }).to_string(),
            RunEvent::Sources { sources } => json!({ "sources": sources }).to_string(),
            RunEvent::Error { error } => json!({ "error": error }).to_string(),
            RunEvent::Done => "[DONE]".to_string(),
        }
    }

    /// SSE framing for the console driver (and any SSE transport).
    pub fn to_sse(&self) -> String {
        match self {
            RunEvent::Done => format!("data: {}\n\n", self.payload()),
            _ => format!("event: {}\ndata: {}\n\n", self.name(), self.payload()),
        }
    }
}

/// Stateless translator from run milestones to the event channel. A
/// closed receiver (client gone) is tolerated: events drop, the loops
/// never notice.
#[derive(Clone)]
pub struct ProgressEmitter {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl ProgressEmitter {
    pub fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        ProgressEmitter { tx: Some(tx) }
    }

    /// Emitter with no consumer, for callers that only want the result.
    #[allow(dead_code)]
    pub fn disabled() -> Self {
        ProgressEmitter { tx: None }
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn progress(&self, kind: ProgressKind, current: usize, total: usize, description: &str) {
        self.emit(RunEvent::Progress {
            kind,
            current,
            total,
            description: description.to_string(),
        });
    }
}
