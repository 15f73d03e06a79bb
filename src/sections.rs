//! Heading-bounded section splitting.
//!
//! The splitter walks normalized markdown line by line and starts a new
//! section at every heading, accumulating the blocks that follow it.
//! Content preceding the first heading becomes an initial headerless
//! section, and a document with no headings yields exactly one section.
//! Heading-based splitting keeps sections coherent and citeable; each
//! section embeds independently.

/// One embeddable unit of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    /// Text of the heading that opened this section, if any.
    pub heading: Option<String>,
    /// The section's full text, heading line included.
    pub content: String,
}

/// Splits markdown-like text into heading-bounded sections.
///
/// Fenced code blocks are opaque: a `#` inside a fence never starts a
/// section. Whitespace-only sections are dropped rather than embedded.
pub fn split_markdown(markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut heading: Option<String> = None;
    let mut buffer = String::new();
    let mut in_fence = false;

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            buffer.push_str(line);
            buffer.push('\n');
            continue;
        }

        match parse_heading(line) {
            Some(text) if !in_fence => {
                push_section(&mut sections, heading.take(), &buffer);
                buffer.clear();
                heading = Some(text.to_string());
                buffer.push_str(line);
                buffer.push('\n');
            }
            _ => {
                buffer.push_str(line);
                buffer.push('\n');
            }
        }
    }
    push_section(&mut sections, heading, &buffer);

    sections
}

/// Returns the heading text when `line` is an ATX heading (`#` through
/// `######` followed by non-empty text).
fn parse_heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    let text = rest.strip_prefix(' ')?.trim();
    if text.is_empty() { None } else { Some(text) }
}

fn push_section(sections: &mut Vec<Section>, heading: Option<String>, buffer: &str) {
    let content = buffer.trim();
    if content.is_empty() {
        return;
    }
    sections.push(Section {
        heading,
        content: content.to_string(),
    });
}
