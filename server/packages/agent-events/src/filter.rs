use std::sync::OnceLock;

use regex::Regex;

/// Longest incomplete tag, in characters, held back before it is released as text.
pub const DEFAULT_MAX_BUFFER: usize = 50;

const FINISH: &str = "finish";

/// Removes `<finish>` / `</finish>` markers from a stream of text fragments.
///
/// Markers may be split across fragments, so a trailing `<...` that still
/// looks like the start of a tag is held back until the next fragment
/// completes it. Everything else, including other tags and stray `<`
/// characters used as comparison operators, passes through unchanged.
#[derive(Debug, Clone)]
pub struct DeltaFilter {
    buffer: String,
    max_buffer: usize,
}

impl Default for DeltaFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaFilter {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffer,
        }
    }

    /// Text currently held back waiting for a tag to complete.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Feeds one fragment and returns the text that is safe to emit now.
    pub fn push(&mut self, fragment: &str) -> String {
        self.buffer.push_str(fragment);
        let input = std::mem::take(&mut self.buffer);

        let mut output = String::with_capacity(input.len());
        let mut rest = input.as_str();
        let mut retained = "";

        while let Some(start) = rest.find('<') {
            output.push_str(&rest[..start]);
            let candidate = &rest[start..];
            match find_tag_end(candidate) {
                Some(end) => {
                    let tag = &candidate[..=end];
                    if !is_finish_tag(tag) {
                        output.push_str(tag);
                    }
                    rest = &candidate[end + 1..];
                }
                None if looks_like_tag_start(candidate) => {
                    retained = candidate;
                    rest = "";
                    break;
                }
                None => {
                    output.push('<');
                    rest = &candidate[1..];
                }
            }
        }
        output.push_str(rest);

        if !retained.is_empty() {
            let retained_chars = retained.chars().count();
            if retained_chars > self.max_buffer {
                tracing::warn!(
                    retained_chars = retained_chars,
                    max_buffer = self.max_buffer,
                    "delta_filter: incomplete tag exceeded buffer, releasing as text"
                );
                output.push_str(&strip_finish_tags(retained));
            } else {
                self.buffer = retained.to_string();
            }
        }

        output
    }

    /// Releases whatever is still held back at the end of a stream. A dangling
    /// finish marker fragment of at least `<fin` or `</fin` is dropped; shorter
    /// tails such as `<` or `<f` are ordinary text.
    pub fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        if rest.is_empty() || is_partial_finish_tag(&rest) {
            return String::new();
        }
        strip_finish_tags(&rest)
    }
}

/// Byte offset of the `>` closing the tag that starts at `candidate[0]`.
/// Quoted attribute values may contain `>`. Another unquoted `<` means the
/// first one was not a tag opener.
fn find_tag_end(candidate: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut previous = b'<';
    for (index, &byte) in candidate.as_bytes().iter().enumerate().skip(1) {
        if let Some(open) = quote {
            if byte == open {
                quote = None;
                previous = byte;
            }
            continue;
        }
        match byte {
            b'>' => return Some(index),
            b'<' => return None,
            b'"' | b'\'' if previous == b'=' => quote = Some(byte),
            _ => {}
        }
        if !byte.is_ascii_whitespace() {
            previous = byte;
        }
    }
    None
}

fn looks_like_tag_start(candidate: &str) -> bool {
    let body = &candidate[1..];
    match body.chars().next() {
        None => true,
        Some(first) if first.is_ascii_alphabetic() || first == '/' => !body
            .contains(|c: char| matches!(c, '<' | '=' | '+' | '-' | '*' | '%' | '\n' | '\r')),
        Some(_) => false,
    }
}

fn is_finish_tag(tag: &str) -> bool {
    let inner = tag
        .strip_prefix('<')
        .and_then(|tag| tag.strip_suffix('>'))
        .unwrap_or(tag)
        .trim();
    let inner = inner.strip_prefix('/').unwrap_or(inner).trim();
    inner.eq_ignore_ascii_case(FINISH)
}

/// Letters of `finish` a tail must carry before flush treats it as a marker.
const MIN_PARTIAL_NAME: usize = 3;

fn is_partial_finish_tag(rest: &str) -> bool {
    let Some(body) = rest.strip_prefix('<') else {
        return false;
    };
    let name = body.strip_prefix('/').unwrap_or(body).to_ascii_lowercase();
    name.len() >= MIN_PARTIAL_NAME && FINISH.starts_with(&name)
}

fn finish_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)<\s*/?\s*finish\s*>").expect("valid finish tag pattern"))
}

fn strip_finish_tags(text: &str) -> String {
    finish_tag_pattern().replace_all(text, "").into_owned()
}
