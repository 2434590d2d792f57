//! Query classifier: maps a raw statement to `{kind, relations}` using
//! cheap prefix matching plus a relation-extraction regex, grounded on the
//! regex-based lightweight SQL inspection found alongside `workload`
//! monitoring in the surrounding corpus (`sql_tuning`/`sql_monitor`-style
//! modules use `regex` rather than a full parser for exactly this kind of
//! approximate classification).
//!
//! The classifier has no runtime state and is safe to call concurrently;
//! it never returns an error. A statement it can't confidently classify
//! becomes `QueryKind::Unknown`, which the router treats as a write for
//! safety (see `Router::plan`).

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// Coarse classification of a statement's effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// A statement that only reads data (`SELECT`, `WITH`, `SHOW`, ...).
    Read,
    /// A statement that mutates data (`INSERT`, `UPDATE`, `DELETE`, ...).
    Write,
    /// A statement that mutates schema (`CREATE`, `DROP`, `ALTER`, ...).
    Ddl,
    /// A transaction-control statement (`BEGIN`, `COMMIT`, ...).
    TxControl,
    /// The classifier could not recognize the statement's leading keyword.
    Unknown,
}

impl QueryKind {
    /// Whether this kind must be routed to primary regardless of
    /// consistency or replica health (everything except `Read`).
    pub fn requires_primary(self) -> bool {
        !matches!(self, QueryKind::Read)
    }
}

/// Result of classifying one statement: its kind plus the lower-cased,
/// deduplicated set of relation names it references.
#[derive(Clone, Debug, Default)]
pub struct QueryClass {
    /// The statement's coarse kind.
    pub kind: Option<QueryKind>,
    /// Relations referenced by the statement, lower-cased and deduplicated.
    pub relations: BTreeSet<String>,
}

impl QueryClass {
    /// Convenience accessor defaulting to `Unknown` when no kind was set.
    pub fn kind(&self) -> QueryKind {
        self.kind.unwrap_or(QueryKind::Unknown)
    }
}

static RELATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+"?([A-Za-z_][A-Za-z0-9_]*)"?(?:\."?([A-Za-z_][A-Za-z0-9_]*)"?)?"#)
        .expect("relation pattern is a valid regex")
});

const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN"];
const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE", "TRUNCATE", "COPY"];
const DDL_KEYWORDS: &[&str] = &[
    "CREATE", "DROP", "ALTER", "GRANT", "REVOKE", "REINDEX", "COMMENT", "VACUUM", "ANALYZE",
];
const TX_KEYWORDS: &[&str] = &["BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE"];

/// Classify a statement: compute its `kind` from the first keyword (after
/// stripping leading whitespace and `--`/`/* */` comments) and extract the
/// set of relations it touches via [`RELATION_PATTERN`].
///
/// This is explicitly approximate — correctness of routing under edge
/// cases relies on the conservative default of "when in doubt, send to
/// primary", which is why a statement with no recognized leading keyword
/// classifies as `Unknown` rather than `Read`.
pub fn classify(statement: &str) -> QueryClass {
    let stripped = strip_leading_comments(statement);
    let first_word = stripped
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|w| !w.is_empty())
        .unwrap_or("");
    let upper = first_word.to_ascii_uppercase();

    let kind = if READ_KEYWORDS.contains(&upper.as_str()) {
        Some(QueryKind::Read)
    } else if WRITE_KEYWORDS.contains(&upper.as_str()) {
        Some(QueryKind::Write)
    } else if DDL_KEYWORDS.contains(&upper.as_str()) {
        Some(QueryKind::Ddl)
    } else if TX_KEYWORDS.contains(&upper.as_str()) {
        Some(QueryKind::TxControl)
    } else {
        None
    };

    let mut relations = BTreeSet::new();
    for caps in RELATION_PATTERN.captures_iter(statement) {
        if let Some(schema_qualified) = caps.get(2) {
            relations.insert(schema_qualified.as_str().to_ascii_lowercase());
        } else if let Some(table) = caps.get(1) {
            relations.insert(table.as_str().to_ascii_lowercase());
        }
    }

    QueryClass { kind, relations }
}

/// Strip leading `--` line comments and `/* ... */` block comments plus
/// surrounding whitespace, so the first-keyword check isn't fooled by a
/// statement that opens with a comment.
fn strip_leading_comments(statement: &str) -> &str {
    let mut rest = statement;
    loop {
        let trimmed = rest.trim_start();
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
            continue;
        }
        if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
            continue;
        }
        return trimmed;
    }
}
