//! Value tuple tokenizer for `INSERT ... VALUES` statements
//!
//! Quoting contract:
//!
//! - Strings are delimited by `'` or `"`. Inside them the delimiter may be
//!   doubled (`'it''s'`) or backslash-escaped (`'it\'s'`).
//! - Backslash escapes follow MySQL dumps: `\0 \b \n \r \t \Z \\ \' \"`.
//!   `\%` and `\_` keep their backslash; any other escaped character stands
//!   for itself.
//! - Commas, parentheses and semicolons inside quotes are data.
//! - Unquoted `NULL` (any case) is a null. Every other unquoted token is kept
//!   verbatim as text, including nested calls such as `NOW()`.
//!
//! Quoted values are text too; typing is left to schema resolution.

use crate::error::{ExportError, Result};
use crate::model::Value;

/// Result of scanning from a position inside a `VALUES` list
#[derive(Debug, Clone, PartialEq)]
pub enum TupleScan {
    /// One parenthesised tuple; `next` is just past its `)`
    Row { values: Vec<Value>, next: usize },
    /// No more tuples in this statement; `next` is just past its `;`
    EndOfStatement { next: usize },
}

/// Scan the next value tuple starting at byte offset `pos`
///
/// `pos` must sit right after `VALUES` or after a previously scanned tuple.
pub fn scan_tuple(text: &str, pos: usize) -> Result<TupleScan> {
    let bytes = text.as_bytes();
    let mut i = pos;
    while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b',') {
        i += 1;
    }

    match bytes.get(i) {
        None => Ok(TupleScan::EndOfStatement { next: bytes.len() }),
        Some(b';') => Ok(TupleScan::EndOfStatement { next: i + 1 }),
        Some(b'(') => scan_values(text, i + 1),
        // trailing clauses such as ON DUPLICATE KEY UPDATE
        Some(_) => Ok(TupleScan::EndOfStatement {
            next: statement_end(text, i),
        }),
    }
}

fn scan_values(text: &str, start: usize) -> Result<TupleScan> {
    let bytes = text.as_bytes();
    let mut values = Vec::new();
    let mut i = skip_whitespace(bytes, start);

    if bytes.get(i) == Some(&b')') {
        return Ok(TupleScan::Row {
            values,
            next: i + 1,
        });
    }

    loop {
        i = skip_whitespace(bytes, i);
        let (value, after) = match bytes.get(i) {
            Some(b'\'') | Some(b'"') => {
                let (s, after) = scan_quoted(text, i)?;
                (Value::Text(s), after)
            },
            Some(_) => scan_unquoted(text, i)?,
            None => break,
        };
        values.push(value);

        i = skip_whitespace(bytes, after);
        match bytes.get(i) {
            Some(b',') => i += 1,
            Some(b')') => return Ok(TupleScan::Row { values, next: i + 1 }),
            Some(other) => {
                return Err(ExportError::adapter(format!(
                    "expected ',' or ')' at byte {} but found '{}'",
                    i, *other as char
                )))
            },
            None => break,
        }
    }

    Err(ExportError::adapter(format!(
        "unterminated value tuple starting at byte {}",
        start.saturating_sub(1)
    )))
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Scan a quoted string whose opening quote is at `start`
///
/// Returns the unescaped contents and the offset just past the closing quote.
pub fn scan_quoted(text: &str, start: usize) -> Result<(String, usize)> {
    let quote = match text.as_bytes().get(start) {
        Some(b'\'') => '\'',
        Some(b'"') => '"',
        _ => {
            return Err(ExportError::adapter(format!(
                "expected a quote at byte {}",
                start
            )))
        },
    };

    let body_start = start + 1;
    let mut out = String::new();
    let mut chars = text[body_start..].char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some((_, escaped)) => match escaped {
                    '0' => out.push('\0'),
                    'b' => out.push('\u{8}'),
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    'Z' => out.push('\u{1a}'),
                    '%' | '_' => {
                        out.push('\\');
                        out.push(escaped);
                    },
                    other => out.push(other),
                },
                None => break,
            }
        } else if c == quote {
            if matches!(chars.peek(), Some((_, next)) if *next == quote) {
                chars.next();
                out.push(quote);
            } else {
                return Ok((out, body_start + offset + 1));
            }
        } else {
            out.push(c);
        }
    }

    Err(ExportError::adapter(format!(
        "unterminated quoted string starting at byte {}",
        start
    )))
}

fn scan_unquoted(text: &str, start: usize) -> Result<(Value, usize)> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = start;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let (_, after) = scan_quoted(text, i)?;
                i = after;
                continue;
            },
            b'(' => depth += 1,
            b')' if depth == 0 => break,
            b')' => depth -= 1,
            b',' if depth == 0 => break,
            _ => {},
        }
        i += 1;
    }

    let token = text[start..i].trim();
    if token.is_empty() {
        return Err(ExportError::adapter(format!("empty value at byte {}", start)));
    }

    let value = if token.eq_ignore_ascii_case("null") {
        Value::Null
    } else {
        Value::Text(token.to_string())
    };
    Ok((value, i))
}

/// Offset just past the next top-level `;`, or the end of the text
pub fn statement_end(text: &str, start: usize) -> usize {
    let bytes = text.as_bytes();
    let mut i = start;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => match scan_quoted(text, i) {
                Ok((_, after)) => {
                    i = after;
                    continue;
                },
                Err(_) => return bytes.len(),
            },
            b';' => return i + 1,
            _ => {},
        }
        i += 1;
    }

    bytes.len()
}
