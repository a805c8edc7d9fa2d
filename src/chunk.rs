//! Markdown chunker.
//!
//! Splits a document into heading-scoped paragraph chunks with stable,
//! re-derivable line ranges. Front matter is parsed from a restricted
//! key/value YAML subset; an unterminated front-matter block is treated
//! as body text rather than an error.
//!
//! Each chunk text is prefixed with its heading breadcrumb and carries a
//! SHA-256 hash for staleness detection. Oversized paragraphs are
//! sub-split with a sliding overlap window; the sub-chunks share the
//! whole paragraph's line range (intentional — consumers cite whole
//! paragraphs).

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::models::{Link, LinkKind};
use crate::util::sha256_text;

static RE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*\S)\s*$").unwrap());
static RE_MD_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]+\]\(([^)]+)\)").unwrap());
static RE_WIKI_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").unwrap());

/// A front-matter value. The subset is deliberately flat: scalar strings,
/// booleans, and string lists. Nested mappings are ignored by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FmValue {
    String(String),
    Bool(bool),
    List(Vec<String>),
}

impl FmValue {
    /// Scalar string content, if this value is a non-empty string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FmValue::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }

    /// Coerce to an ordered, deduplicated string list. Scalars become a
    /// one-element list; booleans yield nothing.
    pub fn as_str_list(&self) -> Vec<String> {
        match self {
            FmValue::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![s.to_string()]
                }
            }
            FmValue::List(items) => {
                let mut out: Vec<String> = Vec::new();
                for item in items {
                    let s = item.trim();
                    if !s.is_empty() && !out.iter().any(|x| x == s) {
                        out.push(s.to_string());
                    }
                }
                out
            }
            FmValue::Bool(_) => Vec::new(),
        }
    }
}

pub type FrontMatter = BTreeMap<String, FmValue>;

/// A chunk produced by [`chunk_markdown`]. Line numbers are 1-based and
/// inclusive, and reference the original file including any front matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_index: usize,
    pub heading_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub text_hash: String,
}

/// Parse front matter from the document's lines.
///
/// Returns the parsed map and the 0-based index of the first body line.
/// A front-matter block exists only when the first line is exactly `---`
/// and a closing `---` follows; otherwise the result is `({}, 0)` and the
/// whole text is body. Lines the subset cannot represent (nested maps,
/// bare scalars) are silently skipped.
pub fn parse_front_matter(lines: &[&str]) -> (FrontMatter, usize) {
    let mut fm = FrontMatter::new();
    if lines.is_empty() || lines[0].trim() != "---" {
        return (fm, 0);
    }
    let Some(end) = lines[1..].iter().position(|l| l.trim() == "---") else {
        return (fm, 0);
    };
    let end = end + 1;

    let mut cur_list_key: Option<String> = None;
    for raw_line in &lines[1..end] {
        let line = raw_line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if let Some(key) = &cur_list_key {
            if let Some(item) = line.trim_start().strip_prefix("- ") {
                if let Some(FmValue::List(items)) = fm.get_mut(key) {
                    items.push(item.trim().to_string());
                }
                continue;
            }
        }
        cur_list_key = None;
        // Indented continuation lines (nested mappings, folded scalars)
        // are outside the subset and contribute nothing.
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }
        if value.is_empty() {
            cur_list_key = Some(key.to_string());
            fm.insert(key.to_string(), FmValue::List(Vec::new()));
            continue;
        }
        if let Some(inner) = value
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
        {
            let items: Vec<String> = inner
                .split(',')
                .map(|v| v.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
                .filter(|v| !v.is_empty())
                .collect();
            fm.insert(key.to_string(), FmValue::List(items));
            continue;
        }
        let lower = value.to_ascii_lowercase();
        if lower == "true" || lower == "false" {
            fm.insert(key.to_string(), FmValue::Bool(lower == "true"));
            continue;
        }
        fm.insert(
            key.to_string(),
            FmValue::String(value.trim_matches(|c| c == '\'' || c == '"').to_string()),
        );
    }
    (fm, end + 1)
}

/// Split Markdown text into heading-scoped paragraph chunks.
///
/// Maintains a stack of enclosing ATX headings; each flushed paragraph is
/// formatted as `heading_path + "\n\n" + paragraph` (breadcrumb omitted
/// when empty) and then windowed by [`split_with_overlap`]. Never fails:
/// an empty body produces zero chunks.
pub fn chunk_markdown(
    text: &str,
    max_chars: usize,
    overlap_chars: usize,
    min_chars: usize,
) -> (FrontMatter, Vec<Chunk>) {
    let lines: Vec<&str> = text.lines().collect();
    let (fm, body_start) = parse_front_matter(&lines);

    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut chunk_index = 0usize;

    let mut paragraph_lines: Vec<&str> = Vec::new();
    let mut paragraph_start_line = body_start + 1;
    let mut cur_heading_path = String::new();

    let mut flush = |paragraph_lines: &mut Vec<&str>,
                     chunk_index: &mut usize,
                     heading_path: &str,
                     start_line: usize,
                     end_line: usize| {
        let raw = paragraph_lines.join("\n");
        paragraph_lines.clear();
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        let source = if heading_path.is_empty() {
            raw.to_string()
        } else {
            format!("{heading_path}\n\n{raw}")
        };
        for piece in split_with_overlap(&source, max_chars, overlap_chars, min_chars) {
            let text_hash = sha256_text(&piece);
            chunks.push(Chunk {
                chunk_index: *chunk_index,
                heading_path: heading_path.to_string(),
                start_line,
                end_line,
                text: piece,
                text_hash,
            });
            *chunk_index += 1;
        }
    };

    for (i, line) in lines.iter().enumerate().skip(body_start) {
        if let Some(caps) = RE_HEADING.captures(line) {
            flush(
                &mut paragraph_lines,
                &mut chunk_index,
                &cur_heading_path,
                paragraph_start_line,
                i,
            );
            let level = caps[1].len();
            let title = caps[2].trim().to_string();
            while heading_stack.last().is_some_and(|(l, _)| *l >= level) {
                heading_stack.pop();
            }
            heading_stack.push((level, title));
            cur_heading_path = heading_stack
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > ");
            paragraph_start_line = i + 2;
            continue;
        }

        if line.trim().is_empty() {
            flush(
                &mut paragraph_lines,
                &mut chunk_index,
                &cur_heading_path,
                paragraph_start_line,
                i + 1,
            );
            paragraph_start_line = i + 2;
            continue;
        }

        paragraph_lines.push(line);
    }

    flush(
        &mut paragraph_lines,
        &mut chunk_index,
        &cur_heading_path,
        paragraph_start_line,
        lines.len(),
    );

    (fm, chunks)
}

/// Text of the first level-1 heading, else `fallback`.
pub fn guess_title(text: &str, fallback: &str) -> String {
    for line in text.lines() {
        if let Some(caps) = RE_HEADING.captures(line) {
            if caps[1].len() == 1 {
                return caps[2].trim().to_string();
            }
        }
    }
    fallback.to_string()
}

/// All `[label](target)` and `[[wiki target]]` references, in order of
/// appearance per kind, duplicates retained.
pub fn extract_links(text: &str) -> Vec<Link> {
    let mut out = Vec::new();
    for caps in RE_MD_LINK.captures_iter(text) {
        out.push(Link {
            target: caps[1].trim().to_string(),
            kind: LinkKind::Markdown,
            anchor: None,
        });
    }
    for caps in RE_WIKI_LINK.captures_iter(text) {
        out.push(Link {
            target: caps[1].trim().to_string(),
            kind: LinkKind::Wiki,
            anchor: None,
        });
    }
    out
}

/// Window `text` into pieces of at most `max_chars` characters, stepping
/// by `max_chars - overlap_chars` (minimum step 1). Each window is
/// trimmed; windows shorter than `min_chars` are dropped unless they are
/// the final window, so trailing content is never lost. Offsets are in
/// characters, not bytes, so windows never split a UTF-8 scalar.
pub fn split_with_overlap(
    text: &str,
    max_chars: usize,
    overlap_chars: usize,
    min_chars: usize,
) -> Vec<String> {
    let t = text.trim();
    if t.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = t.chars().collect();
    let n = chars.len();
    if n <= max_chars {
        return vec![t.to_string()];
    }

    let step = std::cmp::max(1, max_chars.saturating_sub(overlap_chars));
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < n {
        let end = std::cmp::min(n, i + max_chars);
        let piece: String = chars[i..end].iter().collect();
        let piece = piece.trim();
        let is_last = i + max_chars >= n;
        if !piece.is_empty() && (piece.chars().count() >= min_chars || is_last) {
            out.push(piece.to_string());
        }
        if is_last {
            break;
        }
        i += step;
    }
    out
}
