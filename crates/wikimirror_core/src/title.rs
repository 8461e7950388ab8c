use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use rusqlite::Connection;

#[derive(Debug, Clone)]
struct NamespaceEntry {
    name: String,
    first_letter: bool,
}

#[derive(Debug, Clone)]
struct InterwikiEntry {
    prefix: String,
    language: bool,
}

/// A wiki link target split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub leading_colon: bool,
    pub interwiki: Option<String>,
    /// Set when the interwiki prefix belongs to a language edition.
    pub language: bool,
    pub namespace: i64,
    pub title: String,
    pub fragment: Option<String>,
}

/// Resolves namespace and interwiki prefixes using the mirrored tables.
#[derive(Debug, Clone, Default)]
pub struct TitleResolver {
    names: HashMap<String, i64>,
    namespaces: BTreeMap<i64, NamespaceEntry>,
    interwiki: HashMap<String, InterwikiEntry>,
}

impl TitleResolver {
    pub fn load(connection: &Connection) -> Result<Self> {
        let mut resolver = Self::default();

        let mut statement = connection
            .prepare(
                "SELECT ns_id, ns_case, COALESCE(nss_name, '')
                 FROM namespace LEFT JOIN namespace_starname ON nss_id = ns_id",
            )
            .context("failed to prepare namespace lookup")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("failed to query namespaces")?;
        for row in rows {
            let (id, case, name) = row.context("failed to decode namespace row")?;
            resolver.namespaces.insert(
                id,
                NamespaceEntry {
                    name,
                    first_letter: case == "first-letter",
                },
            );
        }

        let mut statement = connection
            .prepare("SELECT nsn_id, nsn_name FROM namespace_name")
            .context("failed to prepare namespace name lookup")?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .context("failed to query namespace names")?;
        for row in rows {
            let (id, name) = row.context("failed to decode namespace name row")?;
            resolver.names.insert(fold_prefix(&name), id);
        }

        let mut statement = connection
            .prepare("SELECT iw_prefix, iw_language FROM interwiki")
            .context("failed to prepare interwiki lookup")?;
        let rows = statement
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .context("failed to query interwiki prefixes")?;
        for row in rows {
            let (prefix, language) = row.context("failed to decode interwiki row")?;
            resolver.interwiki.insert(
                fold_prefix(&prefix),
                InterwikiEntry {
                    prefix,
                    language: language.is_some(),
                },
            );
        }

        Ok(resolver)
    }

    pub fn namespace_name(&self, namespace: i64) -> Option<&str> {
        self.namespaces
            .get(&namespace)
            .map(|entry| entry.name.as_str())
    }

    pub fn namespace_ids(&self) -> Vec<i64> {
        self.namespaces.keys().copied().collect()
    }

    /// Full page name with the local namespace prefix.
    pub fn full_title(&self, namespace: i64, title: &str) -> String {
        match self.namespace_name(namespace) {
            Some(name) if !name.is_empty() => format!("{name}:{title}"),
            _ if namespace != 0 && !self.namespaces.contains_key(&namespace) => {
                format!("{{ns:{namespace}}}:{title}")
            }
            _ => title.to_string(),
        }
    }

    /// Splits a full page name into namespace number and unprefixed title.
    pub fn split(&self, full_title: &str) -> (i64, String) {
        let normalized = canonical_spacing(full_title);
        if let Some((prefix, rest)) = normalized.split_once(':')
            && let Some(id) = self.names.get(&fold_prefix(prefix))
        {
            let rest = rest.trim_start();
            return (*id, self.capitalize(*id, rest));
        }
        (0, self.capitalize(0, &normalized))
    }

    /// Title as stored in the mirror. The namespace prefix is stripped only
    /// when the parsed namespace matches `expected_namespace`.
    pub fn db_title(&self, full_title: &str, expected_namespace: i64) -> String {
        let (namespace, title) = self.split(full_title);
        if namespace == expected_namespace {
            title
        } else {
            self.capitalize(0, &canonical_spacing(full_title))
        }
    }

    /// Parses a link target as written in wikitext.
    pub fn parse_link(&self, target: &str, default_namespace: i64) -> Option<LinkTarget> {
        let mut rest = canonical_spacing(target);
        let leading_colon = rest.starts_with(':');
        if leading_colon {
            rest = rest[1..].trim_start().to_string();
        }

        let fragment = match rest.split_once('#') {
            Some((before, after)) => {
                let fragment = after.trim().to_string();
                rest = before.trim_end().to_string();
                (!fragment.is_empty()).then_some(fragment)
            }
            None => None,
        };

        let mut namespace = default_namespace;
        let mut interwiki = None;
        let mut language = false;
        if let Some((prefix, after)) = rest.split_once(':') {
            let folded = fold_prefix(prefix);
            if let Some(id) = self.names.get(&folded) {
                namespace = *id;
                rest = after.trim_start().to_string();
            } else if let Some(entry) = self.interwiki.get(&folded) {
                interwiki = Some(entry.prefix.clone());
                language = entry.language;
                namespace = 0;
                rest = after.trim_start().to_string();
            } else if leading_colon {
                namespace = 0;
            }
        } else if leading_colon {
            namespace = 0;
        }

        if interwiki.is_none() && rest.is_empty() && fragment.is_none() {
            return None;
        }
        let title = if interwiki.is_some() {
            rest
        } else {
            self.capitalize(namespace, &rest)
        };

        Some(LinkTarget {
            leading_colon,
            interwiki,
            language,
            namespace,
            title,
            fragment,
        })
    }

    fn capitalize(&self, namespace: i64, title: &str) -> String {
        let first_letter = self
            .namespaces
            .get(&namespace)
            .map(|entry| entry.first_letter)
            .unwrap_or(true);
        if first_letter {
            upper_first(title)
        } else {
            title.to_string()
        }
    }
}

/// Underscores become spaces and runs of whitespace collapse to one.
pub fn canonical_spacing(value: &str) -> String {
    value
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn upper_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn fold_prefix(value: &str) -> String {
    canonical_spacing(value).to_lowercase()
}

#[cfg(test)]
mod tests {
    use crate::test_support::{mirror_with_namespaces, seeded_resolver};

    #[test]
    fn splits_known_namespace_prefixes() {
        let resolver = seeded_resolver();
        assert_eq!(resolver.split("Template:Foo_bar"), (10, "Foo bar".to_string()));
        assert_eq!(resolver.split("template : foo"), (10, "Foo".to_string()));
        assert_eq!(resolver.split("Image:X.png"), (6, "X.png".to_string()));
        assert_eq!(resolver.split("Unknown:Thing"), (0, "Unknown:Thing".to_string()));
    }

    #[test]
    fn db_title_keeps_prefix_when_namespace_differs() {
        let resolver = seeded_resolver();
        assert_eq!(resolver.db_title("Help:Intro", 12), "Intro");
        assert_eq!(resolver.db_title("Help:Intro", 0), "Help:Intro");
    }

    #[test]
    fn full_title_uses_local_name() {
        let resolver = seeded_resolver();
        assert_eq!(resolver.full_title(0, "Main Page"), "Main Page");
        assert_eq!(resolver.full_title(14, "Tools"), "Category:Tools");
    }

    #[test]
    fn parses_link_variants() {
        let resolver = seeded_resolver();
        let link = resolver.parse_link(":Category:Tools#top", 0).expect("link");
        assert!(link.leading_colon);
        assert_eq!(link.namespace, 14);
        assert_eq!(link.fragment.as_deref(), Some("top"));

        let link = resolver.parse_link("de:Hauptseite", 0).expect("link");
        assert_eq!(link.interwiki.as_deref(), Some("de"));
        assert!(link.language);

        let link = resolver.parse_link("wikipedia:Rust", 0).expect("link");
        assert_eq!(link.interwiki.as_deref(), Some("wikipedia"));
        assert!(!link.language);

        let link = resolver.parse_link("Foo", 10).expect("link");
        assert_eq!((link.namespace, link.title.as_str()), (10, "Foo"));
        let link = resolver.parse_link(":Foo", 10).expect("link");
        assert_eq!(link.namespace, 0);

        assert!(resolver.parse_link("", 0).is_none());
    }

    #[test]
    fn loads_from_mirror_tables() {
        let (_temp, connection) = mirror_with_namespaces();
        let resolver = super::TitleResolver::load(&connection).expect("load");
        assert_eq!(resolver.namespace_name(10), Some("Template"));
        assert!(resolver.namespace_ids().contains(&0));
    }
}
