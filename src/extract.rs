//! Content extraction: fetch a web page and normalize it into
//! markdown-like text suitable for heading-based splitting.
//!
//! Non-content elements (scripts, styles, navigation, forms, media,
//! iframes, headers/footers) are skipped while walking the DOM, so their
//! text never reaches the output. Headings are emitted as `#`-prefixed
//! lines because the section splitter keys off heading markers.

use regex::Regex;
use reqwest::Client;
use scraper::{Html, Node};
use url::Url;

use crate::stores::LinkMetadata;
use crate::types::PipelineError;

type DomNode<'a> = ego_tree::NodeRef<'a, Node>;

/// Elements whose entire subtree is excluded from extraction.
const SKIPPED_ELEMENTS: &[&str] = &[
    "style", "script", "link", "meta", "noscript", "template", "img", "svg", "picture", "video",
    "audio", "iframe", "canvas", "object", "embed", "input", "textarea", "select", "button",
    "form", "nav", "header", "footer", "aside",
];

/// Inline elements whose text flows into the surrounding paragraph.
const INLINE_ELEMENTS: &[&str] = &[
    "a", "span", "em", "strong", "b", "i", "u", "s", "code", "mark", "small", "sub", "sup",
    "abbr", "time", "label", "q", "cite",
];

/// A fetched page reduced to markdown-like text plus source metadata.
#[derive(Clone, Debug)]
pub struct ExtractedPage {
    pub markdown: String,
    pub metadata: LinkMetadata,
}

/// Fetches `url` and extracts its textual content.
///
/// Network failures and non-success statuses surface as
/// [`PipelineError::Fetch`]; a response that declares a non-HTML content
/// type or strips down to nothing is [`PipelineError::Extract`]. Neither is
/// retried here; retry policy belongs to the caller.
pub async fn fetch_page(client: &Client, url: &Url) -> Result<ExtractedPage, PipelineError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| PipelineError::Fetch(err.to_string()))?
        .error_for_status()
        .map_err(|err| PipelineError::Fetch(err.to_string()))?;

    if let Some(content_type) = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        let is_html = content_type.contains("text/html")
            || content_type.contains("application/xhtml")
            || content_type.contains("text/plain");
        if !is_html {
            return Err(PipelineError::Extract(format!(
                "unsupported content type `{content_type}` at {url}"
            )));
        }
    }

    let html = response
        .text()
        .await
        .map_err(|err| PipelineError::Fetch(err.to_string()))?;
    extract_content(&html)
}

/// Extracts `(markdown, metadata)` from raw HTML.
///
/// Prefers `<main>` as the content root and falls back to `<body>`.
pub fn extract_content(html: &str) -> Result<ExtractedPage, PipelineError> {
    let document = Html::parse_document(html);
    let root = document.tree.root();

    let title = find_element(root, "title").map(|node| {
        let mut text = String::new();
        collect_text(node, &mut text);
        squash_whitespace(&text)
    });
    let title = title.filter(|text| !text.is_empty());

    let content_root = find_element(root, "main")
        .or_else(|| find_element(root, "body"))
        .unwrap_or(root);

    let mut writer = MarkdownWriter::default();
    writer.walk(content_root);
    let markdown = writer.finish();

    if markdown.trim().is_empty() {
        return Err(PipelineError::Extract(
            "no textual content left after stripping markup".into(),
        ));
    }

    Ok(ExtractedPage {
        markdown,
        metadata: LinkMetadata { title },
    })
}

/// Fetches a sitemap and returns every `<loc>` entry that parses as a URL.
///
/// Used when an operator registers a whole site instead of a single page.
pub async fn discover_sitemap_urls(
    client: &Client,
    sitemap_url: &Url,
) -> Result<Vec<Url>, PipelineError> {
    let body = client
        .get(sitemap_url.clone())
        .send()
        .await
        .map_err(|err| PipelineError::Fetch(err.to_string()))?
        .error_for_status()
        .map_err(|err| PipelineError::Fetch(err.to_string()))?
        .text()
        .await
        .map_err(|err| PipelineError::Fetch(err.to_string()))?;

    let loc = Regex::new(r"<loc>\s*([^<]+?)\s*</loc>")
        .map_err(|err| PipelineError::Extract(err.to_string()))?;
    let urls = loc
        .captures_iter(&body)
        .filter_map(|captures| Url::parse(&captures[1]).ok())
        .collect();
    Ok(urls)
}

fn find_element<'a>(root: DomNode<'a>, name: &str) -> Option<DomNode<'a>> {
    root.descendants()
        .find(|node| matches!(node.value(), Node::Element(el) if el.name() == name))
}

/// Appends all text beneath `node`, skipping excluded subtrees.
fn collect_text(node: DomNode<'_>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(&text),
        Node::Element(el) => {
            if SKIPPED_ELEMENTS.contains(&el.name()) {
                return;
            }
            for child in node.children() {
                collect_text(child, out);
            }
        }
        _ => {
            for child in node.children() {
                collect_text(child, out);
            }
        }
    }
}

fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn heading_level(name: &str) -> Option<usize> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

/// Accumulates block output while flowing inline text into paragraphs.
#[derive(Default)]
struct MarkdownWriter {
    out: String,
    paragraph: String,
}

impl MarkdownWriter {
    fn walk(&mut self, node: DomNode<'_>) {
        for child in node.children() {
            match child.value() {
                Node::Text(text) => {
                    self.paragraph.push_str(&text);
                    self.paragraph.push(' ');
                }
                Node::Element(el) => {
                    let name = el.name();
                    if SKIPPED_ELEMENTS.contains(&name) {
                        continue;
                    }
                    if let Some(level) = heading_level(name) {
                        self.flush_paragraph();
                        let mut text = String::new();
                        collect_text(child, &mut text);
                        let text = squash_whitespace(&text);
                        if !text.is_empty() {
                            self.out.push_str(&"#".repeat(level));
                            self.out.push(' ');
                            self.out.push_str(&text);
                            self.out.push_str("\n\n");
                        }
                        continue;
                    }
                    match name {
                        "p" | "blockquote" | "figcaption" | "dt" | "dd" => {
                            self.flush_paragraph();
                            let mut text = String::new();
                            collect_text(child, &mut text);
                            self.push_paragraph(&text);
                        }
                        "li" => {
                            self.flush_paragraph();
                            let mut text = String::new();
                            collect_text(child, &mut text);
                            let text = squash_whitespace(&text);
                            if !text.is_empty() {
                                self.out.push_str("- ");
                                self.out.push_str(&text);
                                self.out.push('\n');
                            }
                        }
                        "ul" | "ol" | "dl" => {
                            self.flush_paragraph();
                            self.walk(child);
                            self.out.push('\n');
                        }
                        "pre" => {
                            self.flush_paragraph();
                            let mut text = String::new();
                            collect_text(child, &mut text);
                            let text = text.trim_matches('\n');
                            if !text.trim().is_empty() {
                                self.out.push_str("```\n");
                                self.out.push_str(text);
                                self.out.push_str("\n```\n\n");
                            }
                        }
                        "br" => self.paragraph.push(' '),
                        "td" | "th" => {
                            let mut text = String::new();
                            collect_text(child, &mut text);
                            self.paragraph.push_str(&text);
                            self.paragraph.push(' ');
                        }
                        "tr" => {
                            self.flush_paragraph();
                            self.walk(child);
                            self.flush_paragraph();
                        }
                        name if INLINE_ELEMENTS.contains(&name) => {
                            let mut text = String::new();
                            collect_text(child, &mut text);
                            self.paragraph.push_str(&text);
                            self.paragraph.push(' ');
                        }
                        // div, section, article, table and anything unknown:
                        // treat as a block container and recurse.
                        _ => {
                            self.flush_paragraph();
                            self.walk(child);
                            self.flush_paragraph();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn push_paragraph(&mut self, text: &str) {
        let text = squash_whitespace(text);
        if !text.is_empty() {
            self.out.push_str(&text);
            self.out.push_str("\n\n");
        }
    }

    fn flush_paragraph(&mut self) {
        let pending = std::mem::take(&mut self.paragraph);
        self.push_paragraph(&pending);
    }

    fn finish(mut self) -> String {
        self.flush_paragraph();
        self.out.trim_end().to_string()
    }
}
