//! Best-effort fuzzy search over the tool catalog.
//!
//! Scoring, per whitespace-separated query term (case-insensitive):
//! exact name 100, name prefix 80, name substring 60, description
//! substring 40, otherwise an in-order subsequence of the name scored
//! 1..=30 by how tightly it packs. Every term must match; term scores are
//! summed. Ties break by name so results are stable.

use crate::types::ToolDefinition;

pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const MAX_SEARCH_LIMIT: usize = 50;

/// A matched tool and its score
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit<'a> {
    pub score: u32,
    pub tool: &'a ToolDefinition,
}

/// Score a tool against a query; `None` if any term fails to match.
pub fn score_tool(query: &str, tool: &ToolDefinition) -> Option<u32> {
    let name = tool.name.to_lowercase();
    let description = tool.description.to_lowercase();

    let mut total = 0;
    for term in query.split_whitespace() {
        let term = term.to_lowercase();
        total += score_term(&term, &name, &description)?;
    }
    Some(total)
}

fn score_term(term: &str, name: &str, description: &str) -> Option<u32> {
    if name == term {
        Some(100)
    } else if name.starts_with(term) {
        Some(80)
    } else if name.contains(term) {
        Some(60)
    } else if description.contains(term) {
        Some(40)
    } else {
        subsequence_score(term, name)
    }
}

fn subsequence_score(needle: &str, haystack: &str) -> Option<u32> {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() {
        return None;
    }

    let mut matched = 0;
    let mut first = None;
    let mut last = 0;
    for (pos, ch) in haystack.chars().enumerate() {
        if matched < needle.len() && ch == needle[matched] {
            if first.is_none() {
                first = Some(pos);
            }
            last = pos;
            matched += 1;
        }
    }

    if matched < needle.len() {
        return None;
    }

    let span = (last - first.unwrap_or(0) + 1) as u32;
    let density = 30 * needle.len() as u32 / span;
    Some(density.clamp(1, 30))
}

/// Rank `tools` against `query`, best first, at most `limit` hits.
pub fn search<'a, I>(tools: I, query: &str, limit: usize) -> Vec<SearchHit<'a>>
where
    I: IntoIterator<Item = &'a ToolDefinition>,
{
    let mut hits: Vec<SearchHit<'a>> = tools
        .into_iter()
        .filter_map(|tool| score_tool(query, tool).map(|score| SearchHit { score, tool }))
        .collect();

    hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.tool.name.cmp(&b.tool.name)));
    hits.truncate(limit.clamp(1, MAX_SEARCH_LIMIT));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition::new(name, description, serde_json::json!({"type": "object"}), "test")
    }

    #[test]
    fn test_exact_beats_prefix_beats_substring() {
        let tools = vec![
            tool("my_github_sync", ""),
            tool("github", ""),
            tool("github__create_issue", ""),
        ];
        let hits = search(&tools, "github", 10);
        let names: Vec<&str> = hits.iter().map(|h| h.tool.name.as_str()).collect();
        assert_eq!(names, vec!["github", "github__create_issue", "my_github_sync"]);
    }

    #[test]
    fn test_case_insensitive_description_match() {
        let tools = vec![tool("fs__read", "Read a FILE from disk")];
        let hits = search(&tools, "file", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 40);
    }

    #[test]
    fn test_subsequence_match() {
        let t = tool("create_issue", "");
        let tight = score_tool("cis", &t).unwrap();
        assert!(tight >= 1 && tight <= 30);
        assert!(score_tool("zzz", &t).is_none());
    }

    #[test]
    fn test_every_term_must_match() {
        let tools = vec![
            tool("github__create_issue", "Open an issue"),
            tool("jira__create_ticket", "Open a ticket"),
        ];
        let hits = search(&tools, "create issue", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool.name, "github__create_issue");
    }

    #[test]
    fn test_limit_and_tie_break() {
        let tools: Vec<ToolDefinition> = (0..5).map(|i| tool(&format!("tool_{}", i), "")).collect();
        let hits = search(&tools, "tool", 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].tool.name, "tool_0");
        assert_eq!(hits[2].tool.name, "tool_2");
    }
}
