//! Statement splitting for non-transactional migrations
//!
//! Migrations that build indexes concurrently are executed one statement at a
//! time. The text is tokenized with `sqlparser` so that semicolons inside
//! quoted strings, dollar-quoted bodies and comments do not split a statement.
//! Statement text is cut from the original source at the semicolon tokens, so
//! escape strings and quoted identifiers are passed through byte for byte. If
//! tokenizing fails the splitter falls back to cutting on every `;`.
//!
//! After splitting, only statements containing one of the verbs `create`,
//! `alter`, `insert`, `update`, `delete` or `drop` are kept. This is a
//! heuristic: it discards transaction markers and stray fragments, and it also
//! discards statements such as `SET`, `GRANT`, `COMMENT ON` or `VACUUM` that
//! do not mention one of those verbs.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer, Whitespace};

static CONCURRENT_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(create\s+(unique\s+)?index\s+concurrently|drop\s+index\s+concurrently)\b")
        .expect("concurrent index pattern is valid")
});

static CORE_VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(create|alter|insert|update|delete|drop)\b").expect("verb pattern is valid")
});

static TRANSACTION_CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(begin|commit|end|rollback|abort)(\s+(work|transaction))?(\s+isolation\s+level\s+[a-z ]+)?$|^start\s+transaction\b",
    )
    .expect("transaction control pattern is valid")
});

/// Does the text contain a directive that cannot run inside a transaction block?
pub fn is_concurrent_index(sql: &str) -> bool {
    CONCURRENT_INDEX.is_match(sql)
}

/// Is this statement an explicit transaction marker?
pub fn is_transaction_control(statement: &str) -> bool {
    let normalized = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    TRANSACTION_CONTROL.is_match(&normalized)
}

/// Does the text contain a statement-level `BEGIN`, `COMMIT` or similar marker?
pub fn has_transaction_control(sql: &str) -> bool {
    tokenize_statements(sql)
        .unwrap_or_else(|_| naive_statements(sql))
        .iter()
        .any(|s| is_transaction_control(s.trim()))
}

/// Split migration text into executable statements.
///
/// Comments are removed, transaction markers are dropped and only statements
/// containing a core DDL/DML verb survive. Returned statements carry no
/// trailing semicolon.
pub fn split_statements(sql: &str) -> Vec<String> {
    let raw = match tokenize_statements(sql) {
        Ok(statements) => statements,
        Err(e) => {
            tracing::warn!("SQL tokenizing failed, using naive semicolon splitting: {}", e);
            naive_statements(sql)
        }
    };

    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| !is_transaction_control(s))
        .filter(|s| CORE_VERB.is_match(s))
        .collect()
}

fn tokenize_statements(sql: &str) -> Result<Vec<String>, sqlparser::tokenizer::TokenizerError> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql).with_unescape(false).tokenize_with_location()?;
    let locations: Vec<Location> = tokens.iter().map(|t| t.location).collect();
    let offsets = byte_offsets(sql, &locations);

    // Statement text is sliced from the source so literals reach the server untouched.
    let mut statements = Vec::new();
    let mut current = String::new();
    for (i, token) in tokens.iter().enumerate() {
        let start = offsets[i];
        let end = offsets.get(i + 1).copied().unwrap_or(sql.len());
        match &token.token {
            Token::SemiColon => statements.push(std::mem::take(&mut current)),
            Token::Whitespace(Whitespace::SingleLineComment { .. }) => current.push('\n'),
            Token::Whitespace(Whitespace::MultiLineComment(_)) => current.push(' '),
            Token::EOF => {}
            _ => current.push_str(&sql[start..end]),
        }
    }
    statements.push(current);
    Ok(statements)
}

/// Byte offset of each 1-based line/column location, which must be in order.
fn byte_offsets(sql: &str, locations: &[Location]) -> Vec<usize> {
    let mut chars = sql.char_indices().peekable();
    let (mut line, mut column) = (1u64, 1u64);
    let mut offsets = Vec::with_capacity(locations.len());

    for location in locations {
        while (line, column) < (location.line, location.column) {
            match chars.next() {
                Some((_, '\n')) => {
                    line += 1;
                    column = 1;
                }
                Some(_) => column += 1,
                None => break,
            }
        }
        offsets.push(chars.peek().map_or(sql.len(), |(offset, _)| *offset));
    }
    offsets
}

fn naive_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|fragment| {
            fragment
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}
