// Markdown → Telegram MarkdownV2 converter
// Telegram rejects any unescaped reserved character with "can't parse entities",
// so every text run is escaped and only the constructs below emit markup.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

/// Characters reserved by MarkdownV2 outside code and link targets
const RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

/// Escape ordinary text
pub fn escape_v2(text: &str) -> String {
    escape_with(text, RESERVED)
}

/// Escape the body of inline code and pre blocks
fn escape_code(text: &str) -> String {
    escape_with(text, &['`', '\\'])
}

/// Escape the target of an inline link
fn escape_url(text: &str) -> String {
    escape_with(text, &[')', '\\'])
}

fn escape_with(text: &str, reserved: &[char]) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if reserved.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

enum ListKind {
    Unordered,
    Ordered(u64),
}

/// Output buffer with lazily inserted line breaks
struct V2Writer {
    out: String,
    /// Newlines owed before the next content
    pending_breaks: usize,
    quote_depth: usize,
}

impl V2Writer {
    fn new() -> Self {
        Self { out: String::new(), pending_breaks: 0, quote_depth: 0 }
    }

    /// Append already-escaped markup
    fn push(&mut self, s: &str) {
        if self.pending_breaks > 0 && !self.out.is_empty() {
            for _ in 0..self.pending_breaks {
                self.out.push('\n');
            }
            if self.quote_depth > 0 {
                self.out.push('>');
            }
        } else if self.out.is_empty() && self.quote_depth > 0 {
            self.out.push('>');
        }
        self.pending_breaks = 0;
        self.out.push_str(s);
    }

    fn line_break(&mut self) {
        self.pending_breaks = self.pending_breaks.max(1);
    }

    fn end_block(&mut self) {
        // A blank line would terminate a quote
        let breaks = if self.quote_depth > 0 { 1 } else { 2 };
        self.pending_breaks = self.pending_breaks.max(breaks);
    }
}

/// Convert Markdown into Telegram MarkdownV2 text.
pub fn markdown_to_telegram_v2(md: &str) -> String {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(md, opts);

    let mut w = V2Writer::new();
    let mut list_stack: Vec<ListKind> = Vec::new();
    let mut link_stack: Vec<String> = Vec::new();
    let mut code_block: Option<(String, String)> = None; // (lang, body)

    for event in parser {
        if let Some((_, body)) = code_block.as_mut() {
            match event {
                Event::Text(ref text) => {
                    body.push_str(text);
                    continue;
                }
                Event::End(TagEnd::CodeBlock) => {}
                _ => continue,
            }
        }

        match event {
            Event::Start(Tag::Strong) | Event::End(TagEnd::Strong) => w.push("*"),
            Event::Start(Tag::Emphasis) | Event::End(TagEnd::Emphasis) => w.push("_"),
            Event::Start(Tag::Strikethrough) | Event::End(TagEnd::Strikethrough) => w.push("~"),
            Event::Start(Tag::Heading { .. }) => {
                w.end_block();
                w.push("*");
            }
            Event::End(TagEnd::Heading(_)) => {
                w.push("*");
                w.end_block();
            }
            Event::Start(Tag::Paragraph) => {}
            Event::End(TagEnd::Paragraph) => {
                if list_stack.is_empty() {
                    w.end_block();
                } else {
                    w.line_break();
                }
            }
            Event::Start(Tag::BlockQuote(_)) => {
                w.end_block();
                w.quote_depth += 1;
            }
            Event::End(TagEnd::BlockQuote(_)) => {
                w.quote_depth = w.quote_depth.saturating_sub(1);
                w.end_block();
            }
            Event::Start(Tag::List(start)) => {
                if list_stack.is_empty() {
                    w.end_block();
                } else {
                    w.line_break();
                }
                list_stack.push(match start {
                    Some(n) => ListKind::Ordered(n),
                    None => ListKind::Unordered,
                });
            }
            Event::End(TagEnd::List(_)) => {
                list_stack.pop();
                if list_stack.is_empty() {
                    w.end_block();
                }
            }
            Event::Start(Tag::Item) => {
                w.line_break();
                let indent = "  ".repeat(list_stack.len().saturating_sub(1));
                let prefix = match list_stack.last_mut() {
                    Some(ListKind::Ordered(n)) => {
                        let p = format!("{}{}\\. ", indent, n);
                        *n += 1;
                        p
                    }
                    _ => format!("{}• ", indent),
                };
                w.push(&prefix);
            }
            Event::End(TagEnd::Item) => w.line_break(),
            Event::Start(Tag::CodeBlock(kind)) => {
                w.end_block();
                let lang = match kind {
                    CodeBlockKind::Fenced(lang) => lang.split_whitespace().next().unwrap_or("").to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                code_block = Some((lang, String::new()));
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((lang, body)) = code_block.take() {
                    let mut block = format!("```{}\n{}", escape_code(&lang), escape_code(&body));
                    if !block.ends_with('\n') {
                        block.push('\n');
                    }
                    block.push_str("```");
                    w.push(&block);
                }
                w.end_block();
            }
            Event::Start(Tag::Link { dest_url, .. }) | Event::Start(Tag::Image { dest_url, .. }) => {
                w.push("[");
                link_stack.push(dest_url.to_string());
            }
            Event::End(TagEnd::Link) | Event::End(TagEnd::Image) => {
                let url = link_stack.pop().unwrap_or_default();
                w.push(&format!("]({})", escape_url(&url)));
            }
            Event::Text(text) | Event::Html(text) | Event::InlineHtml(text) => {
                w.push(&escape_v2(&text));
            }
            Event::Code(code) => w.push(&format!("`{}`", escape_code(&code))),
            Event::SoftBreak | Event::HardBreak => w.line_break(),
            Event::Rule => {
                w.end_block();
                w.push("——————");
                w.end_block();
            }
            _ => {}
        }
    }

    w.out
}
