//! Minimal wikitext scanners used to derive the link graph.

use std::collections::BTreeSet;

/// A `[[target|label]]` occurrence, with nested links inside the label reported separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLink {
    pub target: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: u8,
    pub title: String,
}

const URL_SCHEMES: &[&str] = &[
    "http://", "https://", "ftp://", "ftps://", "sftp://", "ssh://", "git://", "svn://",
    "irc://", "ircs://", "news:", "mailto:",
];

const URL_TERMINATORS: &[char] = &['<', '>', '[', ']', '{', '}', '|', '"'];

/// Removes `<!-- ... -->` comments. An unterminated comment runs to the end.
pub fn strip_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Every wikilink in document order, outer links before the links nested in their labels.
pub fn wikilinks(content: &str) -> Vec<WikiLink> {
    let mut out = Vec::new();
    collect_wikilinks(content, &mut out);
    out
}

fn collect_wikilinks(content: &str, out: &mut Vec<WikiLink>) {
    let bytes = content.as_bytes();
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'[' && bytes[cursor + 1] == b'[' {
            let start = cursor + 2;
            let Some(end) = matching_close(bytes, start) else {
                cursor += 2;
                continue;
            };
            let inner = &content[start..end];
            let (target, label) = match inner.split_once('|') {
                Some((target, label)) => (target, Some(label)),
                None => (inner, None),
            };
            let target = target.trim();
            if !target.is_empty() && !target.contains(['{', '}', '<', '>', '[', ']']) {
                out.push(WikiLink {
                    target: target.to_string(),
                    label: label.map(|label| label.trim().to_string()),
                });
            }
            if let Some(label) = label {
                collect_wikilinks(label, out);
            }
            cursor = end + 2;
            continue;
        }
        cursor += 1;
    }
}

/// Index of the `]]` closing a link opened just before `start`, honoring nesting.
fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut index = start;
    while index + 1 < bytes.len() {
        match (bytes[index], bytes[index + 1]) {
            (b'[', b'[') => {
                depth += 1;
                index += 2;
            }
            (b']', b']') => {
                if depth == 0 {
                    return Some(index);
                }
                depth -= 1;
                index += 2;
            }
            _ => index += 1,
        }
    }
    None
}

/// External link URLs, bracketed and bare, with invalid or host-less URLs dropped.
pub fn external_links(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut index = 0usize;
    while index < content.len() {
        let rest = &content[index..];
        let bracketed = rest.starts_with('[') && !rest.starts_with("[[");
        let candidate = if bracketed { &rest[1..] } else { rest };
        let boundary = index == 0
            || !content[..index]
                .chars()
                .next_back()
                .is_some_and(|previous| previous.is_alphanumeric());
        let scheme_found = URL_SCHEMES
            .iter()
            .any(|scheme| starts_with_ignore_case(candidate, scheme))
            || (bracketed && candidate.starts_with("//"));
        if scheme_found && (bracketed || boundary) {
            let end = candidate
                .find(|ch: char| ch.is_whitespace() || URL_TERMINATORS.contains(&ch))
                .unwrap_or(candidate.len());
            let mut url = &candidate[..end];
            if !bracketed {
                url = url.trim_end_matches(['.', ',', ';', ':', '!', '?', ')', '\'']);
            }
            if valid_url(url) {
                out.push(url.to_string());
            }
            index += usize::from(bracketed) + end.max(1);
            continue;
        }
        index += rest.chars().next().map(char::len_utf8).unwrap_or(1);
    }
    out
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// A URL is kept when it has a host, or when it is a `mailto:` address.
fn valid_url(url: &str) -> bool {
    if starts_with_ignore_case(url, "mailto:") {
        return url.len() > "mailto:".len();
    }
    let Some((_, after)) = url.split_once("//") else {
        return url.split_once(':').is_some_and(|(_, rest)| !rest.is_empty());
    };
    let authority = after.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = if let Some(literal) = host_port.strip_prefix('[') {
        literal.split(']').next().unwrap_or_default()
    } else {
        match host_port.split_once(':') {
            Some((host, port)) => {
                if !port.chars().all(|ch| ch.is_ascii_digit()) {
                    return false;
                }
                host
            }
            None => host_port,
        }
    };
    !host.is_empty()
}

/// Section headings in document order.
pub fn headings(content: &str) -> Vec<Heading> {
    let mut out = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.len() < 3 || !trimmed.starts_with('=') || !trimmed.ends_with('=') {
            continue;
        }

        let leading = trimmed.chars().take_while(|ch| *ch == '=').count();
        let trailing = trimmed.chars().rev().take_while(|ch| *ch == '=').count();
        let level = leading.min(trailing).min(6);
        if level * 2 >= trimmed.len() {
            continue;
        }

        let heading = trimmed[level..trimmed.len() - level].trim();
        if heading.is_empty() {
            continue;
        }
        out.push(Heading {
            level: u8::try_from(level).unwrap_or(6),
            title: heading.to_string(),
        });
    }
    out
}

/// Target of a `#REDIRECT [[...]]` page, if the content is a redirect.
pub fn redirect_target(content: &str) -> Option<String> {
    let trimmed = content.trim_start();
    if !starts_with_ignore_case(trimmed, "#redirect") {
        return None;
    }
    let rest = trimmed["#redirect".len()..].trim_start();
    let rest = rest.strip_prefix(':').unwrap_or(rest).trim_start();
    let inner = rest.strip_prefix("[[")?;
    let end = inner.find("]]")?;
    let target = inner[..end].split('|').next().unwrap_or_default().trim();
    if target.is_empty() || target.contains(['[', ']', '{', '}']) {
        return None;
    }
    Some(target.to_string())
}

/// Heading text with links reduced to their labels and emphasis removed.
pub fn plain_heading(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut rest = title;
    while let Some(start) = rest.find("[[") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("]]") {
            Some(end) => {
                let inner = &after[..end];
                out.push_str(inner.rsplit('|').next().unwrap_or(inner));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    let without_tags = strip_html_tags(&out.replace("'''", "").replace("''", ""));
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_html_tags(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut inside = false;
    for ch in value.chars() {
        match ch {
            '<' => inside = true,
            '>' if inside => inside = false,
            _ if !inside => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Dot-encoded anchors for the given headings, with `_2`, `_3`... suffixes on duplicates.
pub fn anchors(headings: &[Heading]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(headings.len());
    for heading in headings {
        let base = dot_encode(&plain_heading(&heading.title));
        let mut anchor = base.clone();
        let mut suffix = 2;
        while !seen.insert(anchor.to_lowercase()) {
            anchor = format!("{base}_{suffix}");
            suffix += 1;
        }
        out.push(anchor);
    }
    out
}

fn dot_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.replace(' ', "_").bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b':') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!(".{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_nested_links_from_labels() {
        let links = wikilinks("See [[File:A.png|thumb|About [[Foo bar|foo]]]] and [[ :Category:X ]].");
        let targets = links.iter().map(|link| link.target.as_str()).collect::<Vec<_>>();
        assert_eq!(targets, vec!["File:A.png", "Foo bar", ":Category:X"]);
        assert_eq!(links[1].label.as_deref(), Some("foo"));
    }

    #[test]
    fn external_links_keep_mailto_and_drop_hostless() {
        let urls = external_links(
            "[https://example.org/a label] http://x.test/b. [http:///var/run] mailto:me@example.org [http://h:port/]",
        );
        assert_eq!(
            urls,
            vec!["https://example.org/a", "http://x.test/b", "mailto:me@example.org"]
        );
    }

    #[test]
    fn headings_and_anchors() {
        let content = "intro\n== First ==\ntext\n=== [[Link|Sub]] part ===\n== First ==\n";
        let found = headings(content);
        assert_eq!(
            found.iter().map(|heading| heading.level).collect::<Vec<_>>(),
            vec![2, 3, 2]
        );
        assert_eq!(anchors(&found), vec!["First", "Sub_part", "First_2"]);
        assert_eq!(dot_encode("a/b"), "a.2Fb");
    }

    #[test]
    fn detects_redirects() {
        assert_eq!(
            redirect_target("#REDIRECT: [[Main Page#Top]]\nextra").as_deref(),
            Some("Main Page#Top")
        );
        assert_eq!(redirect_target("text #redirect [[X]]"), None);
        assert_eq!(strip_comments("a<!-- b -->c<!-- d"), "ac");
    }
}
