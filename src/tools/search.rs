//! Ephemeral document search.
//!
//! `search_docs` loads the documents passed in the call into a throwaway
//! in-memory SQLite FTS5 table (Porter-stemmed) and ranks them with BM25 over
//! two columns, `title` and `content`, with title matches boosted. Nothing is
//! persisted between calls.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::mcp::handler::{get_string_arg, success_result, ToolHandler};
use crate::mcp::protocol::{Tool, ToolResult};

/// Weight of a title hit relative to a content hit.
pub const TITLE_BOOST: f64 = 1.8;

/// Default number of results.
pub const DEFAULT_K: usize = 5;

/// Upper bound on snippet length, in characters.
pub const SNIPPET_CHARS: usize = 300;

/// Tokens FTS5 puts in one snippet.
const SNIPPET_TOKENS: usize = 48;

/// Untitled documents take this many leading characters of their text as title.
const FALLBACK_TITLE_CHARS: usize = 120;

/// A document supplied by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceDocument {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "source_url")]
    pub url: Option<String>,
    #[serde(default, alias = "origin")]
    pub source: Option<String>,
    #[serde(default)]
    pub space: Option<String>,
    #[serde(default, alias = "id")]
    pub page_id: Option<String>,
}

impl SourceDocument {
    fn display_title(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => self.text.trim().chars().take(FALLBACK_TITLE_CHARS).collect(),
        }
    }
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub score: f64,
    pub title: String,
    pub url: String,
    pub source: String,
    pub space: String,
    pub page_id: String,
    pub snippet: String,
}

/// Turn free text into an FTS5 expression matching any of its words.
///
/// Every word is quoted, so operators and punctuation in the query are never
/// interpreted by FTS5. `None` when the query has no words.
fn prepare_match_query(query: &str) -> Option<String> {
    let mut words: Vec<String> = Vec::new();
    for word in query.split(|c: char| !c.is_alphanumeric()) {
        let word = word.to_lowercase();
        if !word.is_empty() && !words.contains(&word) {
            words.push(word);
        }
    }
    if words.is_empty() {
        return None;
    }
    Some(
        words
            .iter()
            .map(|w| format!("\"{}\"", w))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn build_index(documents: &[SourceDocument]) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "CREATE VIRTUAL TABLE docs USING fts5(
            title,
            content,
            tokenize = 'porter unicode61'
        );",
    )?;

    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare("INSERT INTO docs (rowid, title, content) VALUES (?1, ?2, ?3)")?;
        for (rowid, doc) in documents.iter().enumerate() {
            insert.execute(params![rowid as i64, doc.display_title(), doc.text])?;
        }
    }
    tx.commit()?;
    Ok(conn)
}

/// Rank `documents` against `query`, returning at most `k` hits, best first.
pub fn search_documents(
    documents: &[SourceDocument],
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit>> {
    let Some(match_query) = prepare_match_query(query) else {
        return Ok(Vec::new());
    };
    if documents.is_empty() {
        return Ok(Vec::new());
    }

    let conn = build_index(documents)?;
    let sql = format!(
        "SELECT
            rowid,
            title,
            snippet(docs, 1, '', '', '...', {tokens}) AS snippet,
            bm25(docs, {boost}, 1.0) AS score
         FROM docs
         WHERE docs MATCH ?1
         ORDER BY score, rowid
         LIMIT ?2",
        tokens = SNIPPET_TOKENS,
        boost = TITLE_BOOST,
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![match_query, k.max(1) as i64], |row| {
        let rowid: i64 = row.get(0)?;
        let title: String = row.get(1)?;
        let snippet: String = row.get(2)?;
        let bm25_score: f64 = row.get(3)?;
        Ok((rowid, title, snippet, bm25_score))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (rowid, title, snippet, bm25_score) = row?;
        let Some(doc) = usize::try_from(rowid).ok().and_then(|i| documents.get(i)) else {
            continue;
        };
        hits.push(SearchHit {
            // BM25 is negative in FTS5, lower is better.
            score: -bm25_score,
            title,
            url: doc.url.clone().unwrap_or_default(),
            source: doc.source.clone().unwrap_or_default(),
            space: doc.space.clone().unwrap_or_default(),
            page_id: doc.page_id.clone().unwrap_or_default(),
            snippet: snippet.chars().take(SNIPPET_CHARS).collect::<String>().trim().to_string(),
        });
    }
    Ok(hits)
}

/// `search_docs` tool.
pub struct SearchDocsTool;

impl SearchDocsTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SearchDocsTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for SearchDocsTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "search_docs".to_string(),
            description: r#"Rank a set of documents against a query.

Builds an in-memory index over the supplied documents (nothing is stored) and
scores them with BM25, weighting title matches 1.8x over body matches.

Returns a JSON array of {score, title, url, source, space, page_id, snippet},
best match first. An empty query returns []."#
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "documents": {
                        "type": "array",
                        "description": "Documents to search",
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": { "type": ["string", "null"] },
                                "text": { "type": "string" },
                                "url": { "type": ["string", "null"] },
                                "source": { "type": ["string", "null"] },
                                "space": { "type": ["string", "null"] },
                                "page_id": { "type": ["string", "null"] }
                            },
                            "required": ["text"]
                        }
                    },
                    "query": {
                        "type": "string",
                        "description": "Free-text query"
                    },
                    "k": {
                        "type": "integer",
                        "description": "Maximum number of results (default: 5)"
                    }
                },
                "required": ["documents", "query"]
            }),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<ToolResult> {
        let query = get_string_arg(&args, "query")?;
        let documents: Vec<SourceDocument> = match args.get("documents") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::InvalidParams(format!("Invalid documents: {}", e)))?,
            None => return Err(Error::InvalidParams("Missing required argument: documents".into())),
        };
        let k = args
            .get("k")
            .and_then(|v| v.as_i64())
            .map(|k| k.max(1) as usize)
            .unwrap_or(DEFAULT_K);

        let hits = if query.trim().is_empty() {
            Vec::new()
        } else {
            search_documents(&documents, &query, k)?
        };
        tracing::debug!("search_docs: {} of {} documents matched", hits.len(), documents.len());

        Ok(success_result(serde_json::to_string_pretty(&hits)?))
    }
}
