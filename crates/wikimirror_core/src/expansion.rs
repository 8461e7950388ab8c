//! Template expansion used by the link-graph cache.
//!
//! The cache only needs the expanded text and the set of pages that were
//! transcluded, so expansion stops at the preprocessor level: parser
//! functions and magic words are kept verbatim.

use std::collections::{BTreeMap, HashMap};

use crate::title::TitleResolver;
use crate::wikitext::strip_comments;

/// Content lookup for a transcluded page. Returns `None` when the page does
/// not exist. Every call marks the page as visited.
pub type ContentLookup<'a> = dyn FnMut(i64, &str) -> Option<String> + 'a;

pub trait TemplateExpander {
    /// Expands the raw content of a page as it renders on that page.
    fn expand(
        &mut self,
        titles: &TitleResolver,
        content: &str,
        lookup: &mut ContentLookup<'_>,
    ) -> String;
}

pub const DEFAULT_MAX_DEPTH: usize = 40;

const TEMPLATE_NAMESPACE: i64 = 10;

/// Deepest `{{`/`{{{` nesting the parser follows; deeper openers stay text.
const MAX_NESTING: usize = 256;

/// Lowercase prefixes that mark `{{name:...}}` as a parser function.
const FUNCTION_PREFIXES: &[&str] = &[
    "anchorencode", "canonicalurl", "defaultsort", "displaytitle", "filepath", "formatnum",
    "fullurl", "gender", "grammar", "int", "lc", "lcfirst", "localurl", "msg", "msgnw", "ns",
    "nse", "padleft", "padright", "plural", "raw", "safesubst", "subst", "tag", "uc", "ucfirst",
    "urlencode",
];

const MAGIC_WORDS: &[&str] = &[
    "!", "=", "PAGENAME", "PAGENAMEE", "FULLPAGENAME", "FULLPAGENAMEE", "BASEPAGENAME",
    "SUBPAGENAME", "ROOTPAGENAME", "TALKPAGENAME", "NAMESPACE", "NAMESPACENUMBER", "SITENAME",
    "SERVER", "SERVERNAME", "SCRIPTPATH", "CURRENTYEAR", "CURRENTMONTH", "CURRENTMONTHNAME",
    "CURRENTDAY", "CURRENTDAY2", "CURRENTDOW", "CURRENTDAYNAME", "CURRENTTIME", "CURRENTHOUR",
    "CURRENTTIMESTAMP", "LOCALYEAR", "LOCALMONTH", "LOCALDAY", "LOCALTIME", "LOCALTIMESTAMP",
    "NUMBEROFPAGES", "NUMBEROFARTICLES", "NUMBEROFFILES", "NUMBEROFUSERS", "NUMBEROFEDITS",
    "REVISIONID", "REVISIONDAY", "REVISIONMONTH", "REVISIONYEAR", "REVISIONTIMESTAMP",
    "REVISIONUSER", "PAGEID", "CONTENTLANGUAGE", "DIRMARK", "NOTOC", "FORCETOC", "TOC",
    "NOEDITSECTION", "__NOTOC__",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Template(Vec<Vec<Node>>),
    Param(Vec<Vec<Node>>),
}

/// Preprocessor-level expander for `{{...}}` transclusions and `{{{...}}}` parameters.
#[derive(Debug, Clone)]
pub struct BasicExpander {
    max_depth: usize,
}

impl Default for BasicExpander {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

struct Frame<'f> {
    args: Option<&'f BTreeMap<String, String>>,
    stack: &'f [(i64, String)],
}

struct Expansion<'r, 'l, 'a> {
    titles: &'r TitleResolver,
    lookup: &'l mut ContentLookup<'a>,
    max_depth: usize,
}

impl BasicExpander {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl TemplateExpander for BasicExpander {
    fn expand(
        &mut self,
        titles: &TitleResolver,
        content: &str,
        lookup: &mut ContentLookup<'_>,
    ) -> String {
        let text = page_text(&strip_comments(content));
        let nodes = parse(&text);
        let mut expansion = Expansion {
            titles,
            lookup,
            max_depth: self.max_depth,
        };
        expansion.render(&nodes, &Frame { args: None, stack: &[] })
    }
}

impl Expansion<'_, '_, '_> {
    fn render(&mut self, nodes: &[Node], frame: &Frame<'_>) -> String {
        let mut out = String::new();
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Param(parts) => out.push_str(&self.render_param(parts, frame)),
                Node::Template(parts) => out.push_str(&self.render_template(parts, frame)),
            }
        }
        out
    }

    fn render_param(&mut self, parts: &[Vec<Node>], frame: &Frame<'_>) -> String {
        let name = self.render(&parts[0], frame).trim().to_string();
        if let Some(value) = frame.args.and_then(|args| args.get(&name)) {
            return value.clone();
        }
        match parts.get(1) {
            Some(default) => self.render(default, frame),
            None => format!("{{{{{{{name}}}}}}}"),
        }
    }

    fn render_template(&mut self, parts: &[Vec<Node>], frame: &Frame<'_>) -> String {
        let raw_name = self.render(&parts[0], frame);
        let name = raw_name.trim().to_string();
        if is_function_or_magic(&name) {
            let rendered = std::iter::once(raw_name)
                .chain(parts[1..].iter().map(|part| self.render(part, frame)))
                .collect::<Vec<_>>();
            return format!("{{{{{}}}}}", rendered.join("|"));
        }

        let Some(target) = self.titles.parse_link(&name, TEMPLATE_NAMESPACE) else {
            return self.literal(parts, frame);
        };
        if target.interwiki.is_some() || target.namespace < 0 || target.title.is_empty() {
            return self.literal(parts, frame);
        }
        let key = (target.namespace, target.title.clone());
        let full = self.titles.full_title(target.namespace, &target.title);
        if frame.stack.contains(&key) {
            return format!("<span class=\"error\">Template loop detected: [[{full}]]</span>");
        }
        if frame.stack.len() >= self.max_depth {
            return format!(
                "<span class=\"error\">Template recursion depth limit exceeded ({})</span>",
                self.max_depth
            );
        }

        let Some(body) = (self.lookup)(target.namespace, &target.title) else {
            return format!("[[:{full}]]");
        };
        let args = self.arguments(&parts[1..], frame);
        let nodes = parse(&transclusion_text(&strip_comments(&body)));
        let mut stack = frame.stack.to_vec();
        stack.push(key);
        self.render(
            &nodes,
            &Frame {
                args: Some(&args),
                stack: &stack,
            },
        )
    }

    fn literal(&mut self, parts: &[Vec<Node>], frame: &Frame<'_>) -> String {
        let rendered = parts
            .iter()
            .map(|part| self.render(part, frame))
            .collect::<Vec<_>>();
        format!("{{{{{}}}}}", rendered.join("|"))
    }

    /// Named arguments are trimmed; positional ones keep their whitespace.
    fn arguments(&mut self, parts: &[Vec<Node>], frame: &Frame<'_>) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        let mut position = 0usize;
        for part in parts {
            match split_named(part) {
                Some((key, value)) => {
                    let key = self.render(&key, frame).trim().to_string();
                    let value = self.render(&value, frame).trim().to_string();
                    args.insert(key, value);
                }
                None => {
                    position += 1;
                    let value = self.render(part, frame);
                    args.insert(position.to_string(), value);
                }
            }
        }
        args
    }
}

/// Splits an argument at its first top-level `=`.
fn split_named(part: &[Node]) -> Option<(Vec<Node>, Vec<Node>)> {
    for (index, node) in part.iter().enumerate() {
        let Node::Text(text) = node else { continue };
        if let Some((before, after)) = text.split_once('=') {
            let mut key = part[..index].to_vec();
            key.push(Node::Text(before.to_string()));
            let mut value = vec![Node::Text(after.to_string())];
            value.extend_from_slice(&part[index + 1..]);
            return Some((key, value));
        }
    }
    None
}

fn is_function_or_magic(name: &str) -> bool {
    if name.starts_with('#') || MAGIC_WORDS.contains(&name) {
        return true;
    }
    if let Some((prefix, _)) = name.split_once(':') {
        let prefix = prefix.trim().to_lowercase();
        return FUNCTION_PREFIXES.contains(&prefix.as_str())
            || MAGIC_WORDS.contains(&prefix.to_uppercase().as_str());
    }
    false
}

fn parse(text: &str) -> Vec<Node> {
    Parser::new(text)
        .parts(0, None)
        .and_then(|(mut parts, _)| parts.pop())
        .unwrap_or_default()
}

fn flush(buffer: &mut String, part: &mut Vec<Node>) {
    if !buffer.is_empty() {
        part.push(Node::Text(std::mem::take(buffer)));
    }
}

type Parsed = Option<(Vec<Vec<Node>>, usize)>;

struct Parser<'t> {
    text: &'t str,
    nesting: usize,
    /// Outcome of every bracketed parse, keyed by `(start, closer)`. An
    /// unclosed opener is retried from many positions, so failures must be
    /// remembered to keep parsing linear.
    memo: HashMap<(usize, usize), Parsed>,
}

impl<'t> Parser<'t> {
    fn new(text: &'t str) -> Self {
        Self {
            text,
            nesting: 0,
            memo: HashMap::new(),
        }
    }

    fn bracketed(&mut self, start: usize, closer: usize) -> Parsed {
        if let Some(parsed) = self.memo.get(&(start, closer)) {
            return parsed.clone();
        }
        if self.nesting >= MAX_NESTING {
            return None;
        }
        self.nesting += 1;
        let parsed = self.parts(start, Some(closer));
        self.nesting -= 1;
        self.memo.insert((start, closer), parsed.clone());
        parsed
    }

    /// Parses from `start` until `closer` braces (or the end of input when `closer` is `None`).
    /// Returns `None` when the closer never appears, so the caller can treat the opener as text.
    fn parts(&mut self, start: usize, closer: Option<usize>) -> Parsed {
        let text = self.text;
        let bytes = text.as_bytes();
        let mut parts = Vec::new();
        let mut part = Vec::new();
        let mut buffer = String::new();
        let mut link_depth = 0usize;
        let mut index = start;

        while index < bytes.len() {
            let rest = &text[index..];
            if let Some(count) = closer
                && bytes[index] == b'}'
                && rest.len() >= count
                && rest.as_bytes()[..count].iter().all(|byte| *byte == b'}')
            {
                flush(&mut buffer, &mut part);
                parts.push(part);
                return Some((parts, index + count));
            }
            if rest.starts_with("{{") {
                let run = rest.bytes().take_while(|byte| *byte == b'{').count();
                if run >= 3
                    && let Some((inner, end)) = self.bracketed(index + 3, 3)
                {
                    flush(&mut buffer, &mut part);
                    part.push(Node::Param(inner));
                    index = end;
                    continue;
                }
                if let Some((inner, end)) = self.bracketed(index + 2, 2) {
                    flush(&mut buffer, &mut part);
                    part.push(Node::Template(inner));
                    index = end;
                    continue;
                }
                buffer.push('{');
                index += 1;
                continue;
            }
            if closer.is_some() {
                if rest.starts_with("[[") {
                    link_depth += 1;
                } else if rest.starts_with("]]") && link_depth > 0 {
                    link_depth -= 1;
                    buffer.push_str("]]");
                    index += 2;
                    continue;
                } else if bytes[index] == b'|' && link_depth == 0 {
                    flush(&mut buffer, &mut part);
                    parts.push(std::mem::take(&mut part));
                    index += 1;
                    continue;
                }
            }
            let Some(ch) = rest.chars().next() else { break };
            buffer.push(ch);
            index += ch.len_utf8();
        }

        if closer.is_some() {
            return None;
        }
        flush(&mut buffer, &mut part);
        parts.push(part);
        Some((parts, index))
    }
}

fn find_ignore_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .to_ascii_lowercase()
        .find(needle)
        .map(|position| position + from)
}

/// Removes `<tag>...</tag>` blocks. An unclosed block runs to the end.
fn remove_sections(text: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(start) = find_ignore_case(text, &open, cursor) {
        out.push_str(&text[cursor..start]);
        match find_ignore_case(text, &close, start) {
            Some(end) => cursor = end + close.len(),
            None => return out,
        }
    }
    out.push_str(&text[cursor..]);
    out
}

/// Drops the `<tag>` and `</tag>` markers, keeping what is between them.
fn remove_markers(text: &str, tag: &str) -> String {
    let mut out = text.to_string();
    for marker in [format!("<{tag}>"), format!("</{tag}>")] {
        while let Some(position) = find_ignore_case(&out, &marker, 0) {
            out.replace_range(position..position + marker.len(), "");
        }
    }
    out
}

/// The concatenated `<onlyinclude>` blocks, if there are any.
fn only_sections(text: &str) -> Option<String> {
    let open = "<onlyinclude>";
    let close = "</onlyinclude>";
    let mut found = None::<String>;
    let mut cursor = 0;
    while let Some(start) = find_ignore_case(text, open, cursor) {
        let body_start = start + open.len();
        let end = find_ignore_case(text, close, body_start).unwrap_or(text.len());
        found.get_or_insert_with(String::new).push_str(&text[body_start..end]);
        cursor = (end + close.len()).min(text.len());
    }
    found
}

/// Content as seen when a page is rendered on its own.
fn page_text(raw: &str) -> String {
    let text = remove_sections(raw, "includeonly");
    let text = remove_markers(&text, "noinclude");
    remove_markers(&text, "onlyinclude")
}

/// Content as seen when a page is transcluded elsewhere.
fn transclusion_text(raw: &str) -> String {
    if let Some(only) = only_sections(raw) {
        return remove_markers(&remove_sections(&only, "noinclude"), "includeonly");
    }
    let text = remove_sections(raw, "noinclude");
    remove_markers(&text, "includeonly")
}
