//! Note body parsing with metadata block support.
//!
//! A body may open with a metadata block delimited by `---` lines:
//! ```markdown
//! ---
//! title: "My Note"
//! tags: [a, b, c]
//! modified: 2024-05-01T10:00:00Z
//! ---
//! # Content here
//! ```
//! Parsing never fails. A block without a closing delimiter is treated as
//! plain content, and unrecognised lines inside the block are skipped.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashMap;

/// Opening and closing line of a metadata block.
pub const METADATA_DELIMITER: &str = "---";
/// Title used when neither a title field nor content text exists.
pub const UNTITLED: &str = "Untitled";

/// Epoch values below this are seconds, at or above are milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// A metadata field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

/// A note body split into its metadata block and content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedNote {
    /// Raw block text including both delimiter lines (None if absent)
    pub metadata_block: Option<String>,
    /// Fields parsed from the block
    pub fields: HashMap<String, FieldValue>,
    /// Everything after the block
    pub content: String,
}

impl ParsedNote {
    /// Look up a field, accepting the lowercase and capitalized spellings.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        key_variants(key)
            .iter()
            .find_map(|variant| self.fields.get(variant))
    }

    /// Look up a scalar field.
    pub fn scalar(&self, key: &str) -> Option<&str> {
        match self.field(key)? {
            FieldValue::Scalar(value) => Some(value.as_str()),
            FieldValue::List(_) => None,
        }
    }
}

fn key_variants(key: &str) -> [String; 2] {
    let lower = key.to_lowercase();
    let mut chars = lower.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    [lower, capitalized]
}

/// Parse a note body into metadata block, fields and content.
pub fn parse(body: &str) -> ParsedNote {
    let mut lines = body.split_inclusive('\n');

    let opens_block = lines
        .next()
        .is_some_and(|first| strip_line_ending(first) == METADATA_DELIMITER);
    if !opens_block {
        return plain(body);
    }

    let mut offset = body
        .split_inclusive('\n')
        .next()
        .map(str::len)
        .unwrap_or_default();
    let mut field_lines = Vec::new();

    for line in lines {
        offset += line.len();
        if strip_line_ending(line) == METADATA_DELIMITER {
            let (block, content) = body.split_at(offset);
            return ParsedNote {
                metadata_block: Some(block.to_string()),
                fields: parse_fields(&field_lines),
                content: content.to_string(),
            };
        }
        field_lines.push(strip_line_ending(line));
    }

    // No closing delimiter
    plain(body)
}

/// Reassemble a body from its parts; inverse of `parse` for unmodified notes.
pub fn compose(metadata_block: Option<&str>, content: &str) -> String {
    match metadata_block {
        Some(block) => format!("{block}{content}"),
        None => content.to_string(),
    }
}

/// Title: explicit title field, else first non-blank content line, else "Untitled".
pub fn compose_title(parsed: &ParsedNote) -> String {
    if let Some(title) = parsed.scalar("title").map(str::trim) {
        if !title.is_empty() {
            return title.to_string();
        }
    }

    parsed
        .content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(UNTITLED)
        .to_string()
}

/// Tags in authored order; a scalar tags field yields a single tag.
pub fn extract_tags(parsed: &ParsedNote) -> Vec<String> {
    match parsed.field("tags") {
        Some(FieldValue::List(tags)) => tags.clone(),
        Some(FieldValue::Scalar(tag)) if !tag.trim().is_empty() => vec![tag.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Explicit modification time in milliseconds since epoch.
pub fn extract_updated_at(parsed: &ParsedNote) -> Option<i64> {
    let value = parsed.scalar("modified")?.trim();
    if value.is_empty() {
        return None;
    }

    if value.bytes().all(|b| b.is_ascii_digit()) {
        let epoch: i64 = value.parse().ok()?;
        return if epoch < MILLIS_THRESHOLD {
            epoch.checked_mul(1000)
        } else {
            Some(epoch)
        };
    }

    parse_date(value)
}

fn parse_date(value: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.timestamp_millis());
    }

    // Naive forms are read as UTC
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn plain(body: &str) -> ParsedNote {
    ParsedNote {
        metadata_block: None,
        fields: HashMap::new(),
        content: body.to_string(),
    }
}

fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches('\n').trim_end_matches('\r')
}

fn parse_fields(lines: &[&str]) -> HashMap<String, FieldValue> {
    let mut fields = HashMap::new();
    // Key of a `key:` line whose `- entry` lines may follow
    let mut open_list: Option<String> = None;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with([' ', '\t']) {
            let entry = line.trim_start().strip_prefix('-');
            match (open_list.as_ref(), entry) {
                (Some(key), Some(entry)) => {
                    let entry = unquote(entry.trim());
                    if entry.is_empty() {
                        continue;
                    }
                    let value = fields
                        .entry(key.clone())
                        .or_insert_with(|| FieldValue::List(Vec::new()));
                    match value {
                        FieldValue::List(items) => items.push(entry),
                        scalar => *scalar = FieldValue::List(vec![entry]),
                    }
                }
                _ => open_list = None,
            }
            continue;
        }

        match split_key_value(line) {
            Some((key, "")) => {
                fields.insert(key.to_string(), FieldValue::Scalar(String::new()));
                open_list = Some(key.to_string());
            }
            Some((key, value)) => {
                fields.insert(key.to_string(), parse_scalar(value));
                open_list = None;
            }
            None => open_list = None,
        }
    }

    fields
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim_end();
    if key.is_empty() || key.starts_with(['-', '#']) {
        return None;
    }
    Some((key, value.trim()))
}

fn parse_scalar(value: &str) -> FieldValue {
    if is_double_quoted(value) {
        return FieldValue::Scalar(unquote(value));
    }

    match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        Some(inner) => FieldValue::List(
            inner
                .split(',')
                .map(|item| unquote(item.trim()))
                .filter(|item| !item.is_empty())
                .collect(),
        ),
        None => FieldValue::Scalar(value.to_string()),
    }
}

fn is_double_quoted(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('"') && value.ends_with('"')
}

fn unquote(value: &str) -> String {
    if is_double_quoted(value) {
        value[1..value.len() - 1].replace("\\\"", "\"")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_metadata_block() {
        let body = "---\ntitle: Test Note\ntags:\n  - rust\n  - notes\n---\n# Hello\n\nBody.";

        let parsed = parse(body);
        assert_eq!(
            parsed.metadata_block.as_deref(),
            Some("---\ntitle: Test Note\ntags:\n  - rust\n  - notes\n---\n")
        );
        assert_eq!(parsed.content, "# Hello\n\nBody.");
        assert_eq!(parsed.scalar("title"), Some("Test Note"));
        assert_eq!(extract_tags(&parsed), vec!["rust", "notes"]);
    }

    #[test]
    fn test_roundtrip_reproduces_body() {
        for body in [
            "---\ntitle: \"Quoted \\\"x\\\"\"\nmodified: 1700000000\n---\ncontent\n",
            "---\r\ntags: [a, b]\r\n---\r\n\r\ntext",
            "---\n---\n",
            "---\nkey: value\n---",
            "plain text only",
            "",
        ] {
            let parsed = parse(body);
            assert_eq!(
                compose(parsed.metadata_block.as_deref(), &parsed.content),
                body
            );
        }
    }

    #[test]
    fn test_unterminated_block_is_content() {
        let body = "---\ntitle: Nope\nstill going";
        let parsed = parse(body);
        assert!(parsed.metadata_block.is_none());
        assert!(parsed.fields.is_empty());
        assert_eq!(parsed.content, body);
        assert_eq!(compose_title(&parsed), "---");
    }

    #[test]
    fn test_first_line_must_be_exact_delimiter() {
        let parsed = parse("--- \ntitle: x\n---\nbody");
        assert!(parsed.metadata_block.is_none());

        let parsed = parse("text\n---\ntitle: x\n---\n");
        assert!(parsed.metadata_block.is_none());
    }

    #[test]
    fn test_title_resolution() {
        assert_eq!(
            compose_title(&parse("no frontmatter\nsecond line")),
            "no frontmatter"
        );
        assert_eq!(compose_title(&parse("")), UNTITLED);
        assert_eq!(compose_title(&parse("\n   \n\t\n")), UNTITLED);
        assert_eq!(compose_title(&parse("---\nTitle: Caps\n---\nbody")), "Caps");
        assert_eq!(
            compose_title(&parse("---\ntitle: \"say \\\"hi\\\"\"\n---\nbody")),
            "say \"hi\""
        );
        assert_eq!(
            compose_title(&parse("---\ntitle:\n---\n\n  first line  \n")),
            "first line"
        );
    }

    #[test]
    fn test_tag_extraction() {
        assert_eq!(
            extract_tags(&parse("---\ntags: [a, b, c]\n---\n")),
            vec!["a", "b", "c"]
        );
        assert_eq!(extract_tags(&parse("---\ntags: solo\n---\n")), vec!["solo"]);
        assert_eq!(extract_tags(&parse("---\nTags: [x, , y]\n---\n")), vec!["x", "y"]);
        assert!(extract_tags(&parse("---\ntitle: t\n---\n")).is_empty());
        assert!(extract_tags(&parse("no metadata")).is_empty());
    }

    #[test]
    fn test_tags_keep_authored_order_and_duplicates() {
        let parsed = parse("---\ntags:\n  - b\n  - a\n  - b\n---\n");
        assert_eq!(extract_tags(&parsed), vec!["b", "a", "b"]);
    }

    #[test]
    fn test_unparsable_line_closes_open_list() {
        let body = "---\ntags:\n  - one\nnot a field\n  - two\n---\n";
        let parsed = parse(body);
        assert_eq!(extract_tags(&parsed), vec!["one"]);
    }

    #[test]
    fn test_updated_at_epoch_seconds_and_millis() {
        let secs = parse("---\nmodified: 1700000000\n---\n");
        assert_eq!(extract_updated_at(&secs), Some(1_700_000_000_000));

        let millis = parse("---\nModified: 1700000000123\n---\n");
        assert_eq!(extract_updated_at(&millis), Some(1_700_000_000_123));
    }

    #[test]
    fn test_updated_at_date_strings() {
        let iso = parse("---\nmodified: 2024-01-02T03:04:05Z\n---\n");
        assert_eq!(extract_updated_at(&iso), Some(1_704_164_645_000));

        let offset = parse("---\nmodified: 2024-01-02T05:04:05+02:00\n---\n");
        assert_eq!(extract_updated_at(&offset), Some(1_704_164_645_000));

        let date_only = parse("---\nmodified: 2024-01-02\n---\n");
        assert_eq!(extract_updated_at(&date_only), Some(1_704_153_600_000));

        let rfc2822 = parse("---\nmodified: \"Tue, 02 Jan 2024 03:04:05 +0000\"\n---\n");
        assert_eq!(extract_updated_at(&rfc2822), Some(1_704_164_645_000));
    }

    #[test]
    fn test_updated_at_invalid_is_absent() {
        assert_eq!(extract_updated_at(&parse("---\nmodified: yesterday\n---\n")), None);
        assert_eq!(extract_updated_at(&parse("---\nmodified:\n---\n")), None);
        assert_eq!(
            extract_updated_at(&parse("---\nmodified: 99999999999999999999999\n---\n")),
            None
        );
        assert_eq!(extract_updated_at(&parse("body only")), None);
    }
}
