//! Isolating the SQL statement from raw model output

use crate::error::GenerationFailure;

const SQL_STARTS: &[&str] = &[
    "select", "with", "insert", "update", "delete", "explain", "values", "table",
];

/// Words that follow a leading keyword in prose but not in a statement
const PROSE_FOLLOWERS: &[&str] = &["the", "this", "these", "those", "your", "my", "our"];

/// Whether a line opens a SQL statement rather than a sentence about one
fn starts_with_sql(line: &str) -> bool {
    if line.ends_with(':') || line.ends_with('.') || line.ends_with('!') {
        return false;
    }

    let line = line.trim_start_matches('(');
    let (keyword, rest) = match line.find(|c: char| c.is_whitespace() || c == '(') {
        Some(i) => (&line[..i], line[i..].trim()),
        None => (line.trim_end_matches(';'), ""),
    };
    let keyword = keyword.to_ascii_lowercase();
    if !SQL_STARTS.contains(&keyword.as_str()) {
        return false;
    }

    let rest = rest.to_ascii_lowercase();
    let next = rest
        .split(|c: char| c.is_whitespace() || c == ',')
        .next()
        .unwrap_or_default();
    if PROSE_FOLLOWERS.contains(&next) {
        return false;
    }

    match keyword.as_str() {
        "with" => {
            rest.is_empty()
                || next == "recursive"
                || rest.contains(" as (")
                || rest.contains(" as(")
                || rest.ends_with(" as")
        }
        // `TABLE name` names exactly one relation
        "table" => !rest.is_empty() && rest.trim_end_matches(';').split_whitespace().count() == 1,
        "values" => rest.is_empty() || rest.starts_with('('),
        "insert" => next == "into",
        "delete" => next == "from",
        _ => true,
    }
}

/// Body of the first fenced code block, without its language tag
fn fenced_block(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let after = &raw[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    Some(match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    })
}

/// Cut after the first `;` outside quotes and comments
fn first_statement(sql: &str) -> &str {
    let (mut single, mut double) = (false, false);
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let quoted = single || double;
        match c {
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            '-' if !quoted && matches!(chars.peek(), Some((_, '-'))) => {
                // Skip a line comment
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if !quoted && matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut star = false;
                for (_, c) in chars.by_ref() {
                    if star && c == '/' {
                        break;
                    }
                    star = c == '*';
                }
            }
            ';' if !quoted => return &sql[..=i],
            _ => {}
        }
    }
    sql
}

/// Strip markdown fences and surrounding prose, leaving one SQL statement
pub fn clean_sql(raw: &str) -> Result<String, GenerationFailure> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(GenerationFailure::EmptyResponse);
    }

    let body = fenced_block(raw).unwrap_or(raw);

    // Drop any lead-in prose before the statement
    let lines: Vec<&str> = body.lines().collect();
    let Some(start) = lines.iter().position(|l| starts_with_sql(l.trim())) else {
        let preview: String = raw.chars().take(80).collect();
        return Err(GenerationFailure::Malformed(format!("no SQL statement in: {}", preview)));
    };
    let statement = lines[start..].join("\n");

    let mut sql = first_statement(&statement).trim().to_string();
    if !sql.ends_with(';') {
        // Without a terminator, prose after a blank line is not part of the query
        if let Some(end) = sql.find("\n\n") {
            sql.truncate(end);
        }
        sql = sql.trim_end().to_string();
    }

    Ok(sql)
}
