use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Placeholder citation marker produced by the writing executor.
/// The leading-whitespace group lets a dropped marker take its padding
/// with it instead of leaving a double space behind.
static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\s*)\[Source:\s*([^\]]+)\]").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub url: String,
    pub title: String,
}

impl SourceRef {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        SourceRef {
            url: url.into(),
            title: title.into(),
        }
    }
}

/// One completed section, pre-renumbering. `sources` is the allowed set
/// observed while writing it: the deduplicated SourceRefs of the
/// Findings scoped to the section. Markers citing anything else are
/// generation errors and get dropped.
#[derive(Debug, Clone)]
pub struct DraftSection {
    pub section_id: String,
    pub title: String,
    pub text: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone)]
pub struct AssembledDocument {
    pub body: String,
    pub references: String,
    pub sources: Vec<String>,
}

/// Owned citation registry. Numbers are assigned once, in first-appearance
/// order across the sections it is fed, starting at 1. Never shared
/// between runs; each run constructs its own.
#[derive(Debug, Default)]
pub struct CitationAssembler {
    order: Vec<SourceRef>,
    numbers: HashMap<String, usize>,
}

impl CitationAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite one section's markers to final `[n]` citations, assigning
    /// numbers to urls seen for the first time. Markers whose url is not
    /// in the section's allowed set are dropped from the output.
    pub fn assemble_section(&mut self, draft: &DraftSection) -> String {
        let allowed: HashMap<&str, &SourceRef> = draft
            .sources
            .iter()
            .map(|s| (s.url.as_str(), s))
            .collect();

        MARKER_RE
            .replace_all(&draft.text, |caps: &regex::Captures| {
                let pad = &caps[1];
                let url = caps[2].trim();
                match allowed.get(url) {
                    Some(&source) => {
                        let n = self.assign(source);
                        format!("{}[{}]", pad, n)
                    }
                    None => {
                        tracing::warn!(
                            section = %draft.section_id,
                            url,
                            "dropping citation marker for source outside the section scope"
                        );
                        String::new()
                    }
                }
            })
            .into_owned()
    }

    fn assign(&mut self, source: &SourceRef) -> usize {
        if let Some(&n) = self.numbers.get(&source.url) {
            return n;
        }
        self.order.push(source.clone());
        let n = self.order.len();
        self.numbers.insert(source.url.clone(), n);
        n
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Rendered bibliography, ordered by citation number. Empty string
    /// when nothing was cited.
    pub fn references_markdown(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::from("## References\n\n");
        for (i, source) in self.order.iter().enumerate() {
            if source.title.is_empty() {
                out.push_str(&format!("{}. <{}>\n", i + 1, source.url));
            } else {
                out.push_str(&format!("{}. [{}]({})\n", i + 1, source.title, source.url));
            }
        }
        out
    }

    pub fn source_urls(&self) -> Vec<String> {
        self.order.iter().map(|s| s.url.clone()).collect()
    }
}

/// Assemble the final document from draft sections in writing order.
/// Pure: a fresh registry is walked over the same drafts, so calling
/// this twice (or after an incremental per-chapter pass over the same
/// sequence) yields identical numbering.
pub fn assemble(drafts: &[DraftSection]) -> AssembledDocument {
    let mut assembler = CitationAssembler::new();
    let mut parts = Vec::with_capacity(drafts.len());

    for draft in drafts {
        let text = assembler.assemble_section(draft);
        parts.push(format!("## {}\n\n{}", draft.title, text));
    }
    tracing::debug!(sections = drafts.len(), citations = assembler.len(), "document assembled");

    AssembledDocument {
        body: parts.join("\n\n"),
        references: assembler.references_markdown(),
        sources: assembler.source_urls(),
    }
}
