use std::collections::BTreeSet;

use crate::citations::SourceRef;

/// What one research task produced. Never mutated after insertion.
#[derive(Debug, Clone)]
pub struct Finding {
    pub task_id: String,
    pub content: String,
    pub sources: Vec<SourceRef>,
}

impl Finding {
    /// Sources are deduplicated by url at construction; a Finding is the
    /// unit the allowed citation set is built from, so duplicates here
    /// would only add noise downstream.
    pub fn new(task_id: impl Into<String>, content: impl Into<String>, sources: Vec<SourceRef>) -> Self {
        let mut seen = BTreeSet::new();
        let sources = sources
            .into_iter()
            .filter(|s| seen.insert(s.url.clone()))
            .collect();
        Finding {
            task_id: task_id.into(),
            content: content.into(),
            sources,
        }
    }
}

/// Append-only store of Findings, written exclusively by the research
/// loop and read by everything after it. Insertion order is preserved
/// (it matches research task order) so prompts assembled from it are
/// stable.
#[derive(Debug, Default)]
pub struct ResearchMemory {
    findings: Vec<Finding>,
}

impl ResearchMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a Finding. A second Finding for the same task id is a
    /// logic error in the caller; the first one wins.
    pub fn insert(&mut self, finding: Finding) {
        if self.get(&finding.task_id).is_some() {
            tracing::warn!(task = %finding.task_id, "duplicate finding ignored");
            return;
        }
        self.findings.push(finding);
    }

    pub fn get(&self, task_id: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.task_id == task_id)
    }

    /// The scoped-retrieval contract: only Findings whose task id is in
    /// `scope` come back, in insertion order.
    pub fn scoped(&self, scope: &BTreeSet<String>) -> Vec<&Finding> {
        self.findings
            .iter()
            .filter(|f| scope.contains(&f.task_id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter()
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(task_id: &str) -> Finding {
        Finding::new(
            task_id,
            format!("content for {}", task_id),
            vec![SourceRef::new(format!("https://{}.example", task_id), "t")],
        )
    }

    #[test]
    fn test_scoped_returns_only_in_scope_findings() {
        let mut memory = ResearchMemory::new();
        memory.insert(finding("r1"));
        memory.insert(finding("r2"));
        memory.insert(finding("r3"));

        let scope: BTreeSet<String> = ["r1".to_string(), "r3".to_string()].into();
        let scoped = memory.scoped(&scope);
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|f| scope.contains(&f.task_id)));
    }

    #[test]
    fn test_scoped_preserves_insertion_order() {
        let mut memory = ResearchMemory::new();
        for id in ["r2", "r10", "r1"] {
            memory.insert(finding(id));
        }

        let scope: BTreeSet<String> =
            ["r1".to_string(), "r2".to_string(), "r10".to_string()].into();
        let order: Vec<&str> = memory
            .scoped(&scope)
            .iter()
            .map(|f| f.task_id.as_str())
            .collect();
        assert_eq!(order, vec!["r2", "r10", "r1"]);
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let mut memory = ResearchMemory::new();
        memory.insert(Finding::new("r1", "first", vec![]));
        memory.insert(Finding::new("r1", "second", vec![]));

        assert_eq!(memory.len(), 1);
        assert_eq!(memory.get("r1").unwrap().content, "first");
    }

    #[test]
    fn test_finding_dedups_sources_by_url() {
        let f = Finding::new(
            "r1",
            "c",
            vec![
                SourceRef::new("https://a.example", "first title"),
                SourceRef::new("https://a.example", "second title"),
                SourceRef::new("https://b.example", "other"),
            ],
        );
        assert_eq!(f.sources.len(), 2);
        assert_eq!(f.sources[0].title, "first title");
    }
}
