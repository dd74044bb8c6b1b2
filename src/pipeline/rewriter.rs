use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::llm::prompt::{extract_delimited, sanitize_for_prompt, truncate_to_char_boundary};
use crate::llm::TextGenerator;
use crate::models::ChatMessage;

pub const SYSTEM_PROMPT: &str = "You rewrite questions for a document search engine. \
Given a question, write alternative phrasings that keep its meaning but use different \
wording, synonyms or related terms, so that passages the original wording misses can \
still be found. Respond with ONLY a JSON array of strings. No explanation.";

/// Longest previous answer quoted back as negative context.
const MAX_NEGATIVE_CHARS: usize = 600;

/// Expands a question into related search queries.
pub struct QueryRewriter {
    generator: Arc<dyn TextGenerator>,
}

impl QueryRewriter {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Return up to `k` distinct variants, the original query first and verbatim.
    ///
    /// `rejected` is an earlier answer that failed validation; the model is told
    /// not to steer the search toward it.
    ///
    /// Fails with [`PipelineError::RewriteDegraded`] when the model is unreachable
    /// or produces nothing usable; callers then search with the original alone.
    pub async fn rewrite(&self, query: &str, k: usize, rejected: Option<&str>) -> Result<Vec<String>> {
        if query.trim().is_empty() {
            return Err(PipelineError::InvalidQuery("query is empty".to_string()));
        }
        if k <= 1 {
            return Ok(vec![query.to_string()]);
        }

        let wanted = k - 1;
        let mut prompt = format!(
            "Question: \"{}\"\n\nWrite exactly {wanted} alternative phrasing(s).",
            sanitize_for_prompt(query)
        );
        if let Some(previous) = rejected {
            prompt.push_str(&format!(
                "\n\nAn earlier search led to this answer, which was NOT supported by the \
                 documents. Do not steer the search toward it:\n\"{}\"",
                sanitize_for_prompt(truncate_to_char_boundary(previous, MAX_NEGATIVE_CHARS))
            ));
        }

        let reply = self
            .generator
            .generate(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)])
            .await
            .map_err(|e| PipelineError::RewriteDegraded(format!("{e:#}")))?;

        let alternatives = distinct_alternatives(query, parse_variants(&reply), wanted);
        if alternatives.is_empty() {
            return Err(PipelineError::RewriteDegraded(
                "model returned no usable variants".to_string(),
            ));
        }

        let mut variants = Vec::with_capacity(alternatives.len() + 1);
        variants.push(query.to_string());
        variants.extend(alternatives);
        tracing::info!(variants = variants.len(), "rewrite");
        Ok(variants)
    }
}

/// Accepts a JSON array, or one variant per line.
fn parse_variants(content: &str) -> Vec<String> {
    if let Some(json) = extract_delimited(content, '[', ']') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(json) {
            return list;
        }
    }

    content
        .lines()
        .map(strip_list_marker)
        .filter(|l| !l.is_empty() && !l.ends_with(':') && !l.starts_with("```"))
        .map(str::to_string)
        .collect()
}

/// "1. foo", "2) foo", "- foo", "* foo", "\"foo\"" → "foo"
fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let line = line
        .strip_prefix('.')
        .or_else(|| line.strip_prefix(')'))
        .unwrap_or(line);
    let line = line.trim_start_matches(['-', '*', '•']).trim();
    line.trim_matches(|c: char| c == '"' || c == ',').trim()
}

/// Drop blanks and duplicates (case-insensitive, including the original).
fn distinct_alternatives(original: &str, candidates: Vec<String>, wanted: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(original.trim().to_lowercase());

    candidates
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.to_lowercase()))
        .take(wanted)
        .collect()
}
