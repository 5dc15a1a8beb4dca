//! Content processors: turn raw fetched bytes into standardised Markdown.
//!
//! Each [`SourceType`] has one processor. Fetching is the caller's job;
//! processors only see bytes and the URL they came from. Output always
//! starts with a `#` heading, uses blank lines between blocks, and ends
//! with a newline, so equal content standardises to equal bodies.
//!
//! | Source | Input | Extraction |
//! |--------|-------|------------|
//! | HTML | page bytes | tag stripping, headings, lists, entity decoding |
//! | PDF | document bytes | `pdf-extract` |
//! | YouTube | transcript JSON or plain text | segment text joined |

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use digest_store_core::SourceType;

/// Extraction error. The caller skips the item; nothing is stored.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("invalid transcript: {0}")]
    Transcript(String),
}

/// Output of a processor: an optional title and the Markdown body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standardised {
    pub title: Option<String>,
    pub body: String,
}

pub trait ContentProcessor: Send + Sync {
    fn source_type(&self) -> SourceType;

    fn standardise(&self, raw: &[u8], url: &str) -> Result<Standardised, ProcessError>;
}

/// Pick the processor for a source type.
pub fn processor_for(source_type: SourceType) -> Box<dyn ContentProcessor> {
    match source_type {
        SourceType::Html => Box::new(HtmlProcessor),
        SourceType::Pdf => Box::new(PdfProcessor),
        SourceType::Youtube => Box::new(YoutubeProcessor),
    }
}

/// Guess the source type from the URL alone.
///
/// `youtube.com/watch` and `youtu.be/…` are YouTube, a path ending in
/// `.pdf` is PDF, anything else (including unparseable input) is HTML.
pub fn detect_source_type(url: &str) -> SourceType {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return SourceType::Html;
    };
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let host = host.strip_prefix("m.").unwrap_or(host);

    if (host == "youtube.com" && parsed.path() == "/watch") || host == "youtu.be" {
        SourceType::Youtube
    } else if parsed.path().to_ascii_lowercase().ends_with(".pdf") {
        SourceType::Pdf
    } else {
        SourceType::Html
    }
}

// ============ HTML ============

pub struct HtmlProcessor;

/// Elements whose content is never text.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "head", "svg", "template"];
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "footer", "nav", "aside", "ul", "ol",
    "table", "tr", "pre", "figure", "figcaption", "blockquote",
];

impl ContentProcessor for HtmlProcessor {
    fn source_type(&self) -> SourceType {
        SourceType::Html
    }

    fn standardise(&self, raw: &[u8], url: &str) -> Result<Standardised, ProcessError> {
        let html = String::from_utf8_lossy(raw);
        let page_title = html_title(&html);
        let text = html_to_markdown(&html);
        if text.trim().is_empty() {
            warn!(url = %url, "no text extracted from HTML");
        }

        let body = standardise_markdown(&text, page_title.as_deref());
        let title = page_title.or_else(|| first_heading(&body));
        debug!(url = %url, bytes = raw.len(), "standardised HTML");
        Ok(Standardised { title, body })
    }
}

fn html_title(html: &str) -> Option<String> {
    let start = find_ci(html, "<title")?;
    let open_end = html[start..].find('>')? + start + 1;
    let close = find_ci(&html[open_end..], "</title")? + open_end;
    let title = collapse_whitespace(&decode_entities(&html[open_end..close]));
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Lower-case tag name and whether it is a closing tag.
fn tag_name(tag: &str) -> (String, bool) {
    let tag = tag.trim_start();
    let (closing, tag) = match tag.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, tag),
    };
    let name = tag
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    (name, closing)
}

fn html_to_markdown(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        push_text(&mut out, &rest[..lt]);
        let after = &rest[lt..];

        if after.starts_with("<!--") {
            rest = after.find("-->").map(|i| &after[i + 3..]).unwrap_or("");
            continue;
        }
        let Some(gt) = after.find('>') else {
            rest = "";
            break;
        };
        let (name, closing) = tag_name(&after[1..gt]);
        rest = &after[gt + 1..];

        if !closing && SKIPPED_ELEMENTS.contains(&name.as_str()) {
            let close = format!("</{}", name);
            if let Some(i) = find_ci(rest, &close) {
                let tail = &rest[i..];
                rest = tail.find('>').map(|j| &tail[j + 1..]).unwrap_or("");
            }
            continue;
        }

        match name.as_str() {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                out.push_str("\n\n");
                if !closing {
                    let level = name[1..].parse::<usize>().unwrap_or(1);
                    out.push_str(&"#".repeat(level));
                    out.push(' ');
                }
            }
            "li" if !closing => out.push_str("\n- "),
            "br" | "hr" => out.push('\n'),
            "blockquote" if !closing => out.push_str("\n\n> "),
            n if BLOCK_ELEMENTS.contains(&n) => out.push_str("\n\n"),
            _ => {}
        }
    }
    push_text(&mut out, rest);
    out
}

fn push_text(out: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    out.push_str(&decode_entities(&collapse_whitespace(text)));
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let decoded = after
            .find(';')
            .filter(|&i| i <= 10)
            .and_then(|i| decode_entity(&after[1..i]).map(|c| (c, i)));
        match decoded {
            Some((c, i)) => {
                out.push(c);
                rest = &after[i + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        "ndash" => Some('\u{2013}'),
        "mdash" => Some('\u{2014}'),
        "hellip" => Some('\u{2026}'),
        "rsquo" => Some('\u{2019}'),
        "lsquo" => Some('\u{2018}'),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// ASCII case-insensitive substring search returning a byte offset.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .to_ascii_lowercase()
        .find(&needle.to_ascii_lowercase())
}

// ============ PDF ============

pub struct PdfProcessor;

impl ContentProcessor for PdfProcessor {
    fn source_type(&self) -> SourceType {
        SourceType::Pdf
    }

    fn standardise(&self, raw: &[u8], url: &str) -> Result<Standardised, ProcessError> {
        let text =
            pdf_extract::extract_text_from_mem(raw).map_err(|e| ProcessError::Pdf(e.to_string()))?;

        let paragraphs: Vec<String> = text
            .split("\n\n")
            .map(|p| collapse_whitespace(p).trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let title = paragraphs
            .first()
            .map(|p| p.chars().take(120).collect::<String>());
        let content = if paragraphs.is_empty() {
            warn!(url = %url, "no text extracted from PDF");
            "*No text content could be extracted*".to_string()
        } else {
            paragraphs.join("\n\n")
        };

        let body = standardise_markdown(&content, Some("PDF Document"));
        Ok(Standardised { title, body })
    }
}

// ============ YouTube ============

pub struct YoutubeProcessor;

#[derive(Debug, Deserialize)]
struct TranscriptSegment {
    #[serde(default)]
    text: String,
    #[allow(dead_code)]
    #[serde(default)]
    start: f64,
    #[allow(dead_code)]
    #[serde(default)]
    duration: f64,
}

impl ContentProcessor for YoutubeProcessor {
    fn source_type(&self) -> SourceType {
        SourceType::Youtube
    }

    /// Accepts a JSON array of `{text, start, duration}` segments or a
    /// plain-text transcript.
    fn standardise(&self, raw: &[u8], url: &str) -> Result<Standardised, ProcessError> {
        let raw = std::str::from_utf8(raw).map_err(|e| ProcessError::Transcript(e.to_string()))?;

        let text = if raw.trim_start().starts_with('[') {
            let segments: Vec<TranscriptSegment> =
                serde_json::from_str(raw).map_err(|e| ProcessError::Transcript(e.to_string()))?;
            segments
                .iter()
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            collapse_whitespace(raw).trim().to_string()
        };

        let content = if text.is_empty() {
            warn!(url = %url, "empty transcript");
            "*No transcript available*".to_string()
        } else {
            text
        };

        let title = video_id(url).map(|id| format!("YouTube video {}", id));
        let body = standardise_markdown(&content, Some("YouTube Video Transcript"));
        Ok(Standardised { title, body })
    }
}

/// Video ID from `youtube.com/watch?v=…` or `youtu.be/…`.
pub fn video_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let id = if host == "youtu.be" {
        parsed.path_segments()?.next().map(str::to_string)
    } else {
        parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
    };
    id.filter(|id| !id.is_empty())
}

// ============ Markdown normalization ============

fn is_block_start(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("```") || is_list_item(line) || line.starts_with("> ")
}

fn is_list_item(line: &str) -> bool {
    line.starts_with("- ") || line.starts_with("* ")
}

/// Normalize Markdown layout: trimmed lines, a blank line around headings
/// and before each block (consecutive list items and quote lines stay
/// together), no runs of blank lines, a leading heading and a trailing
/// newline. Fenced code is kept as written.
///
/// `fallback_title` becomes the heading when the content has none.
pub fn standardise_markdown(content: &str, fallback_title: Option<&str>) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for raw in content.lines() {
        if in_fence {
            let line = raw.trim_end();
            if line.trim_start().starts_with("```") {
                in_fence = false;
                lines.push(line.trim_start());
            } else {
                lines.push(line);
            }
            continue;
        }

        let line = raw.trim();
        let prev = lines.last().copied();
        if line.is_empty() {
            if matches!(prev, Some(p) if !p.is_empty()) {
                lines.push("");
            }
            continue;
        }
        if let Some(p) = prev {
            let same_run = (is_list_item(p) && is_list_item(line))
                || (p.starts_with("> ") && line.starts_with("> "));
            let needs_gap = p.starts_with('#') || (is_block_start(line) && !same_run);
            if !p.is_empty() && needs_gap {
                lines.push("");
            }
        }
        if line.starts_with("```") {
            in_fence = true;
        }
        lines.push(line);
    }
    while lines.last() == Some(&"") {
        lines.pop();
    }

    if lines.is_empty() {
        return "# Empty Content\n\n*No content was provided*\n".to_string();
    }

    let mut out = String::new();
    if !lines[0].starts_with('#') {
        out.push_str("# ");
        out.push_str(fallback_title.unwrap_or("Extracted Content"));
        out.push_str("\n\n");
    }
    out.push_str(&lines.join("\n"));
    out.push('\n');
    out
}

fn first_heading(markdown: &str) -> Option<String> {
    markdown
        .lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
