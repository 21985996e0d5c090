use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::citations::SourceRef;
use crate::error::{AgentError, AgentResult};
use crate::ports::{Passage, RetrievalPort};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

/// Retrieval port backed by a SearxNG-style JSON search endpoint.
///
/// Passages returned for a query are remembered in an in-run index,
/// tagged with the task ids of the requesting scope. Later queries
/// whose scope already has indexed passages are answered from the
/// index by term-overlap ranking without touching the network; this is
/// what lets the writing loop re-query for finer passages while staying
/// inside its section's scope.
pub struct SearchRetrieval {
    client: reqwest::Client,
    endpoint: String,
    top_k: usize,
    index: Mutex<Vec<(String, Passage)>>,
}

impl SearchRetrieval {
    pub fn new(endpoint: String, top_k: usize) -> Self {
        SearchRetrieval {
            client: reqwest::Client::new(),
            endpoint,
            top_k: top_k.max(1),
            index: Mutex::new(Vec::new()),
        }
    }

    async fn web_search(&self, query: &str) -> AgentResult<Vec<Passage>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| AgentError::Retrieval(format!("search request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::Retrieval(format!(
                "search API error: {}",
                response.status()
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Retrieval(format!("search response unreadable: {}", e)))?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|r| !r.url.is_empty())
            .take(self.top_k)
            .map(|r| Passage {
                text: r.content,
                source: SourceRef::new(r.url, r.title),
            })
            .collect())
    }

    fn remember(&self, scope: &BTreeSet<String>, passages: &[Passage]) {
        let mut index = self.index.lock().unwrap();
        for tag in scope {
            for passage in passages {
                index.push((tag.clone(), passage.clone()));
            }
        }
    }

    fn scoped_hits(&self, scope: &BTreeSet<String>, query: &str) -> Vec<Passage> {
        let index = self.index.lock().unwrap();
        let mut seen = BTreeSet::new();
        let mut scored: Vec<(usize, &Passage)> = index
            .iter()
            .filter(|(tag, _)| scope.contains(tag))
            .filter(|(_, p)| seen.insert(p.source.url.clone()))
            .map(|(_, p)| (term_overlap(query, &p.text), p))
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.top_k)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// How many distinct query terms (4+ chars) appear in the passage text.
fn term_overlap(query: &str, text: &str) -> usize {
    let haystack = text.to_lowercase();
    let mut terms: BTreeSet<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| t.len() >= 4)
        .collect();
    terms.retain(|t| haystack.contains(t.as_str()));
    terms.len()
}

#[async_trait]
impl RetrievalPort for SearchRetrieval {
    async fn retrieve(&self, scope: &BTreeSet<String>, query: &str) -> AgentResult<Vec<Passage>> {
        let indexed = self.scoped_hits(scope, query);
        if !indexed.is_empty() {
            return Ok(indexed);
        }

        let passages = self.web_search(query).await?;
        self.remember(scope, &passages);
        Ok(passages)
    }
}
