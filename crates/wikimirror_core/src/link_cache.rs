//! Derived link-graph tables kept in step with page content.
//!
//! Every page carries a consistency marker holding the revision its derived
//! rows were computed from. A page is recomputed when the marker is missing
//! or behind `page_latest`, or when it transcludes a page that is.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::config::DEFAULT_CONTENT_CACHE_CAPACITY;
use crate::expansion::{BasicExpander, TemplateExpander};
use crate::title::TitleResolver;
use crate::wikitext::{self, Heading};

const FILE_NAMESPACE: i64 = 6;
const CATEGORY_NAMESPACE: i64 = 14;
const MEDIA_NAMESPACE: i64 = -2;

const CATEGORY_COLLATION: &str = "uppercase";

const STALE_PAGES: &str = "
    WITH stale(id) AS (
        SELECT page_id FROM page
        LEFT JOIN ws_parser_cache_sync ON wspc_page_id = page_id
        WHERE wspc_rev_id IS NULL OR wspc_rev_id <> page_latest
        UNION
        SELECT tl_from FROM templatelinks
        JOIN page AS target ON target.page_namespace = tl_namespace AND target.page_title = tl_title
        LEFT JOIN ws_parser_cache_sync ON wspc_page_id = target.page_id
        WHERE wspc_rev_id IS NULL OR wspc_rev_id <> target.page_latest
    )
    SELECT page_id, page_namespace, page_title, page_latest FROM page
    WHERE page_id IN (SELECT id FROM stale) AND page_namespace >= 0
    ORDER BY page_namespace <> 10, page_namespace, page_title";

const LATEST_CONTENT: &str = "SELECT old_text FROM page
    JOIN revision ON rev_id = page_latest
    JOIN text ON old_id = rev_text_id
    WHERE page_namespace = ?1 AND page_title = ?2";

const DERIVED_TABLES: &[(&str, &str)] = &[
    ("pagelinks", "pl_from"),
    ("templatelinks", "tl_from"),
    ("imagelinks", "il_from"),
    ("categorylinks", "cl_from"),
    ("langlinks", "ll_from"),
    ("iwlinks", "iwl_from"),
    ("externallinks", "el_from"),
    ("redirect", "rd_from"),
    ("section", "sec_page"),
];

#[derive(Debug, Clone, Serialize)]
pub struct LinkCacheReport {
    pub stale: usize,
    pub recomputed: usize,
    /// Stale pages whose latest revision has no stored text.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StalePage {
    id: i64,
    namespace: i64,
    title: String,
    latest: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRow {
    /// `None` for interwiki redirects.
    pub namespace: Option<i64>,
    pub title: String,
    pub interwiki: Option<String>,
    pub fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRow {
    pub level: u8,
    pub title: String,
    pub anchor: String,
}

/// Every derived relation of one page, already deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedLinks {
    pub templates: BTreeSet<(i64, String)>,
    pub pages: BTreeSet<(i64, String)>,
    pub images: BTreeSet<String>,
    /// Category title to sort-key prefix. The last occurrence wins.
    pub categories: BTreeMap<String, String>,
    /// Language code to target. The first occurrence wins.
    pub languages: BTreeMap<String, String>,
    pub interwiki: BTreeSet<(String, String)>,
    pub external: BTreeSet<String>,
    pub redirect: Option<RedirectRow>,
    pub sections: Vec<SectionRow>,
}

/// Bounded memo of page content, scoped to one update cycle.
struct ContentCache {
    capacity: usize,
    entries: HashMap<(i64, String), Option<String>>,
    order: VecDeque<(i64, String)>,
}

impl ContentCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get_or_load(
        &mut self,
        connection: &Connection,
        namespace: i64,
        title: &str,
    ) -> Result<Option<String>> {
        let key = (namespace, title.to_string());
        if let Some(content) = self.entries.get(&key) {
            return Ok(content.clone());
        }
        let content = latest_content(connection, namespace, title)?;
        if self.order.len() >= self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.entries.remove(&evicted);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, content.clone());
        Ok(content)
    }
}

fn latest_content(connection: &Connection, namespace: i64, title: &str) -> Result<Option<String>> {
    connection
        .prepare_cached(LATEST_CONTENT)
        .context("failed to prepare content lookup")?
        .query_row(params![namespace, title], |row| row.get(0))
        .optional()
        .with_context(|| format!("failed to load content of {namespace}:{title}"))
}

/// Recomputes stale pages with a [`TemplateExpander`].
pub struct LinkCache<E: TemplateExpander = BasicExpander> {
    expander: E,
    content_cache_capacity: usize,
}

impl Default for LinkCache<BasicExpander> {
    fn default() -> Self {
        Self::new(DEFAULT_CONTENT_CACHE_CAPACITY)
    }
}

impl LinkCache<BasicExpander> {
    pub fn new(content_cache_capacity: usize) -> Self {
        Self::with_expander(BasicExpander::default(), content_cache_capacity)
    }
}

impl<E: TemplateExpander> LinkCache<E> {
    pub fn with_expander(expander: E, content_cache_capacity: usize) -> Self {
        Self {
            expander,
            content_cache_capacity,
        }
    }

    /// Brings every stale page up to date, one transaction per page.
    pub fn update(&mut self, connection: &mut Connection) -> Result<LinkCacheReport> {
        let titles = TitleResolver::load(connection)?;
        let stale = stale_pages(connection)?;
        let mut cache = ContentCache::new(self.content_cache_capacity);
        let mut report = LinkCacheReport {
            stale: stale.len(),
            recomputed: 0,
            skipped: 0,
        };
        tracing::info!(stale = stale.len(), "updating link cache");

        for page in &stale {
            let transaction = connection
                .transaction()
                .context("failed to start link cache transaction")?;
            let Some(content) = cache.get_or_load(&transaction, page.namespace, &page.title)? else {
                // The marker stays behind so the page is retried once text arrives.
                clear_links(&transaction, page.id)?;
                transaction
                    .commit()
                    .context("failed to commit link cache transaction")?;
                tracing::warn!(page = page.id, revision = page.latest, "no stored text, cleared derived links");
                report.skipped += 1;
                continue;
            };

            let mut transcluded = BTreeSet::new();
            let mut lookup_error = None;
            let expanded = {
                let mut lookup = |namespace: i64, title: &str| {
                    transcluded.insert((namespace, title.to_string()));
                    match cache.get_or_load(&transaction, namespace, title) {
                        Ok(content) => content,
                        Err(error) => {
                            lookup_error.get_or_insert(error);
                            None
                        }
                    }
                };
                self.expander.expand(&titles, &content, &mut lookup)
            };
            if let Some(error) = lookup_error {
                return Err(error);
            }

            let mut derived = derive_links(
                &titles,
                page.namespace,
                &page.title,
                &expanded,
                is_subject_namespace(page.namespace),
            );
            derived.templates = transcluded;
            store_links(&transaction, page, &derived)?;
            transaction
                .commit()
                .context("failed to commit link cache transaction")?;
            tracing::debug!(
                page = page.id,
                revision = page.latest,
                links = derived.pages.len(),
                templates = derived.templates.len(),
                "recomputed derived links"
            );
            report.recomputed += 1;
        }

        tracing::info!(
            recomputed = report.recomputed,
            skipped = report.skipped,
            "link cache updated"
        );
        Ok(report)
    }
}

fn stale_pages(connection: &Connection) -> Result<Vec<StalePage>> {
    let mut statement = connection
        .prepare(STALE_PAGES)
        .context("failed to prepare stale page query")?;
    statement
        .query_map([], |row| {
            Ok(StalePage {
                id: row.get(0)?,
                namespace: row.get(1)?,
                title: row.get(2)?,
                latest: row.get(3)?,
            })
        })
        .context("failed to query stale pages")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to decode stale pages")
}

/// Language links count on subject pages only; on talk pages they are interwiki links.
fn is_subject_namespace(namespace: i64) -> bool {
    namespace >= 0 && namespace % 2 == 0
}

/// Clears every consistency marker so the next update recomputes all pages.
pub fn invalidate_all(connection: &Connection) -> Result<usize> {
    let cleared = connection
        .execute("DELETE FROM ws_parser_cache_sync", [])
        .context("failed to clear link cache markers")?;
    tracing::info!(cleared, "invalidated link cache");
    Ok(cleared)
}

pub fn invalidate_pages(connection: &Connection, page_ids: &[i64]) -> Result<usize> {
    let encoded = serde_json::to_string(page_ids).context("failed to encode page ids")?;
    connection
        .execute(
            "DELETE FROM ws_parser_cache_sync
             WHERE wspc_page_id IN (SELECT value FROM json_each(?1))",
            params![encoded],
        )
        .context("failed to clear link cache markers")
}

/// Classifies the links of an expanded page into derived relations.
///
/// Template edges are not visible in expanded text and are left empty.
pub fn derive_links(
    titles: &TitleResolver,
    namespace: i64,
    title: &str,
    expanded: &str,
    language_links: bool,
) -> DerivedLinks {
    let mut derived = DerivedLinks::default();
    let redirect_target = wikitext::redirect_target(expanded);

    if let Some(target) = redirect_target
        .as_deref()
        .and_then(|target| titles.parse_link(target, 0))
    {
        derived.redirect = Some(RedirectRow {
            namespace: target.interwiki.is_none().then_some(target.namespace),
            title: target.title,
            interwiki: target.interwiki,
            fragment: target.fragment,
        });
    }

    for (index, link) in wikitext::wikilinks(expanded).iter().enumerate() {
        let raw = if link.target.starts_with('/') {
            format!("{}{}", titles.full_title(namespace, title), link.target.trim_end_matches('/'))
        } else {
            link.target.clone()
        };
        let Some(target) = titles.parse_link(&raw, 0) else {
            continue;
        };
        let redirect_link = redirect_target.is_some() && index == 0;

        if let Some(prefix) = target.interwiki {
            let full = match &target.fragment {
                Some(fragment) => format!("{}#{fragment}", target.title),
                None => target.title.clone(),
            };
            if target.language && !target.leading_colon && !redirect_link && language_links {
                derived.languages.entry(prefix).or_insert(full);
            } else {
                derived.interwiki.insert((prefix, target.title));
            }
            continue;
        }

        if !redirect_link {
            if target.namespace == MEDIA_NAMESPACE
                || (target.namespace == FILE_NAMESPACE && !target.leading_colon)
            {
                derived.images.insert(target.title);
                continue;
            }
            if target.namespace == CATEGORY_NAMESPACE && !target.leading_colon {
                derived
                    .categories
                    .insert(target.title, link.label.clone().unwrap_or_default());
                continue;
            }
        }

        if target.namespace < 0 || target.title.is_empty() {
            continue;
        }
        if target.namespace == namespace && target.title == title && target.fragment.is_none() {
            continue;
        }
        derived.pages.insert((target.namespace, target.title));
    }

    derived.external = wikitext::external_links(expanded).into_iter().collect();

    let headings: Vec<Heading> = wikitext::headings(expanded);
    let anchors = wikitext::anchors(&headings);
    derived.sections = headings
        .into_iter()
        .zip(anchors)
        .map(|(heading, anchor)| SectionRow {
            level: heading.level,
            title: wikitext::plain_heading(&heading.title),
            anchor,
        })
        .collect();
    derived
}

fn sort_key(prefix: &str, page_title: &str) -> String {
    let name = page_title.to_uppercase();
    if prefix.is_empty() {
        name
    } else {
        format!("{}\n{name}", prefix.to_uppercase())
    }
}

fn category_type(namespace: i64) -> &'static str {
    match namespace {
        FILE_NAMESPACE => "file",
        CATEGORY_NAMESPACE => "subcat",
        _ => "page",
    }
}

fn clear_links(connection: &Connection, page_id: i64) -> Result<()> {
    for (table, column) in DERIVED_TABLES {
        connection
            .execute(&format!("DELETE FROM {table} WHERE {column} = ?1"), params![page_id])
            .with_context(|| format!("failed to clear {table} for page {page_id}"))?;
    }
    Ok(())
}

fn store_links(connection: &Connection, page: &StalePage, derived: &DerivedLinks) -> Result<()> {
    clear_links(connection, page.id)?;

    let mut statement = connection
        .prepare_cached("INSERT INTO pagelinks (pl_from, pl_namespace, pl_title) VALUES (?1, ?2, ?3)")
        .context("failed to prepare pagelinks insert")?;
    for (namespace, title) in &derived.pages {
        statement
            .execute(params![page.id, namespace, title])
            .context("failed to insert pagelink")?;
    }

    let mut statement = connection
        .prepare_cached("INSERT INTO templatelinks (tl_from, tl_namespace, tl_title) VALUES (?1, ?2, ?3)")
        .context("failed to prepare templatelinks insert")?;
    for (namespace, title) in &derived.templates {
        statement
            .execute(params![page.id, namespace, title])
            .context("failed to insert templatelink")?;
    }

    let mut statement = connection
        .prepare_cached("INSERT INTO imagelinks (il_from, il_to) VALUES (?1, ?2)")
        .context("failed to prepare imagelinks insert")?;
    for image in &derived.images {
        statement
            .execute(params![page.id, image])
            .context("failed to insert imagelink")?;
    }

    let mut statement = connection
        .prepare_cached(
            "INSERT INTO categorylinks
                (cl_from, cl_to, cl_sortkey, cl_sortkey_prefix, cl_collation, cl_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .context("failed to prepare categorylinks insert")?;
    for (category, prefix) in &derived.categories {
        statement
            .execute(params![
                page.id,
                category,
                sort_key(prefix, &page.title),
                prefix,
                CATEGORY_COLLATION,
                category_type(page.namespace)
            ])
            .context("failed to insert categorylink")?;
    }

    let mut statement = connection
        .prepare_cached("INSERT INTO langlinks (ll_from, ll_lang, ll_title) VALUES (?1, ?2, ?3)")
        .context("failed to prepare langlinks insert")?;
    for (language, target) in &derived.languages {
        statement
            .execute(params![page.id, language, target])
            .context("failed to insert langlink")?;
    }

    let mut statement = connection
        .prepare_cached("INSERT INTO iwlinks (iwl_from, iwl_prefix, iwl_title) VALUES (?1, ?2, ?3)")
        .context("failed to prepare iwlinks insert")?;
    for (prefix, title) in &derived.interwiki {
        statement
            .execute(params![page.id, prefix, title])
            .context("failed to insert iwlink")?;
    }

    let mut statement = connection
        .prepare_cached("INSERT INTO externallinks (el_from, el_to) VALUES (?1, ?2)")
        .context("failed to prepare externallinks insert")?;
    for url in &derived.external {
        statement
            .execute(params![page.id, url])
            .context("failed to insert external link")?;
    }

    if let Some(redirect) = &derived.redirect {
        connection
            .execute(
                "INSERT INTO redirect (rd_from, rd_namespace, rd_title, rd_interwiki, rd_fragment)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    page.id,
                    redirect.namespace,
                    redirect.title,
                    redirect.interwiki,
                    redirect.fragment
                ],
            )
            .context("failed to insert redirect")?;
    }

    let mut statement = connection
        .prepare_cached(
            "INSERT INTO section (sec_page, sec_number, sec_level, sec_title, sec_anchor)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .context("failed to prepare section insert")?;
    for (index, section) in derived.sections.iter().enumerate() {
        statement
            .execute(params![
                page.id,
                index as i64 + 1,
                section.level,
                section.title,
                section.anchor
            ])
            .context("failed to insert section")?;
    }

    connection
        .execute(
            "INSERT INTO ws_parser_cache_sync (wspc_page_id, wspc_rev_id) VALUES (?1, ?2)
             ON CONFLICT(wspc_page_id) DO UPDATE SET wspc_rev_id = excluded.wspc_rev_id",
            params![page.id, page.latest],
        )
        .with_context(|| format!("failed to store link cache marker for page {}", page.id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::test_support::{count, seeded_resolver, synced_sample};

    fn marker(connection: &Connection, page_id: i64) -> Option<i64> {
        connection
            .query_row(
                "SELECT wspc_rev_id FROM ws_parser_cache_sync WHERE wspc_page_id = ?1",
                params![page_id],
                |row| row.get(0),
            )
            .optional()
            .expect("marker")
    }

    fn categories(connection: &Connection, page_id: i64) -> Vec<(String, String, String)> {
        let mut statement = connection
            .prepare("SELECT cl_to, cl_sortkey, cl_type FROM categorylinks WHERE cl_from = ?1 ORDER BY cl_to")
            .expect("prepare");
        statement
            .query_map(params![page_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("decode")
    }

    #[test]
    fn update_derives_relations_from_expanded_content() {
        let (_temp, mut connection) = synced_sample();
        let report = LinkCache::default().update(&mut connection).expect("update");
        assert_eq!((report.stale, report.recomputed, report.skipped), (2, 2, 0));

        assert_eq!(marker(&connection, 1), Some(11));
        assert_eq!(marker(&connection, 2), Some(12));
        let template: (i64, String) = connection
            .query_row(
                "SELECT tl_namespace, tl_title FROM templatelinks WHERE tl_from = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("templatelink");
        assert_eq!(template, (10, "Box".to_string()));
        let link: (i64, String) = connection
            .query_row(
                "SELECT pl_namespace, pl_title FROM pagelinks WHERE pl_from = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("pagelink");
        assert_eq!(link, (12, "Intro".to_string()));
        assert_eq!(
            categories(&connection, 1),
            vec![("Boxes".to_string(), "MAIN PAGE".to_string(), "page".to_string())]
        );

        let again = LinkCache::default().update(&mut connection).expect("second update");
        assert_eq!(again.stale, 0);
    }

    #[test]
    fn stale_template_recomputes_its_transcluders() {
        let (_temp, mut connection) = synced_sample();
        LinkCache::default().update(&mut connection).expect("initial update");

        connection
            .execute_batch(
                "UPDATE ws_parser_cache_sync SET wspc_rev_id = 9 WHERE wspc_page_id = 2;
                 UPDATE text SET old_text = '[[Category:Frames]]'
                 WHERE old_id = (SELECT rev_text_id FROM revision WHERE rev_id = 12);",
            )
            .expect("make template stale");

        let report = LinkCache::default().update(&mut connection).expect("update");
        assert_eq!(report.recomputed, 2);
        assert_eq!(marker(&connection, 1), Some(11));
        assert_eq!(marker(&connection, 2), Some(12));
        assert_eq!(
            categories(&connection, 1),
            vec![("Frames".to_string(), "MAIN PAGE".to_string(), "page".to_string())]
        );
    }

    #[test]
    fn invalidation_clears_markers() {
        let (_temp, mut connection) = synced_sample();
        let mut cache = LinkCache::new(1);
        cache.update(&mut connection).expect("update");

        assert_eq!(invalidate_pages(&connection, &[1]).expect("invalidate page"), 1);
        assert_eq!(marker(&connection, 1), None);
        assert_eq!(invalidate_all(&connection).expect("invalidate all"), 1);
        assert_eq!(count(&connection, "ws_parser_cache_sync"), 0);

        let report = cache.update(&mut connection).expect("rebuild");
        assert_eq!(report.recomputed, 2);
        assert_eq!(count(&connection, "templatelinks"), 1);
    }

    #[test]
    fn classifies_links() {
        let titles = seeded_resolver();
        let content = "[[de:Hauptseite]] [[de:Zweite]] [[wikipedia:Rust]] [[:de:Seite]] \
            [[Category:Tools|zeta]] [[:Category:Shown]] [[File:Logo.png|thumb|[[Help:Intro]]]] \
            [[Self page]] [[Self page#Sec]] [[#Local]] http://example.org/x [http:///nohost] mailto:a@b.c\n\
            == Usage ==\n== Usage ==\n";
        let derived = derive_links(&titles, 0, "Self page", content, true);

        assert_eq!(
            derived.languages,
            BTreeMap::from([("de".to_string(), "Hauptseite".to_string())])
        );
        assert_eq!(
            derived.interwiki,
            BTreeSet::from([
                ("de".to_string(), "Seite".to_string()),
                ("wikipedia".to_string(), "Rust".to_string()),
            ])
        );
        assert_eq!(
            derived.categories,
            BTreeMap::from([("Tools".to_string(), "zeta".to_string())])
        );
        assert_eq!(derived.images, BTreeSet::from(["Logo.png".to_string()]));
        assert_eq!(
            derived.pages,
            BTreeSet::from([
                (0, "Self page".to_string()),
                (12, "Intro".to_string()),
                (14, "Shown".to_string()),
            ])
        );
        assert_eq!(
            derived.external,
            BTreeSet::from(["http://example.org/x".to_string(), "mailto:a@b.c".to_string()])
        );
        let anchors = derived
            .sections
            .iter()
            .map(|section| section.anchor.as_str())
            .collect::<Vec<_>>();
        assert_eq!(anchors, vec!["Usage", "Usage_2"]);
        assert_eq!(derived.redirect, None);
        assert_eq!(sort_key("zeta", "Self page"), "ZETA\nSELF PAGE");
    }

    #[test]
    fn redirect_targets_are_recorded() {
        let titles = seeded_resolver();
        let derived = derive_links(
            &titles,
            0,
            "Old",
            "#REDIRECT [[Help:Target#Part]] [[Category:Redirects]]",
            true,
        );
        assert_eq!(
            derived.redirect,
            Some(RedirectRow {
                namespace: Some(12),
                title: "Target".to_string(),
                interwiki: None,
                fragment: Some("Part".to_string()),
            })
        );
        assert!(derived.pages.contains(&(12, "Target".to_string())));
        assert!(derived.categories.contains_key("Redirects"));

        let derived = derive_links(&titles, 0, "Old", "#redirect [[de:Ziel]]", true);
        assert_eq!(
            derived.redirect.map(|row| (row.namespace, row.interwiki)),
            Some((None, Some("de".to_string())))
        );
        assert!(derived.languages.is_empty());
        assert!(derived.interwiki.contains(&("de".to_string(), "Ziel".to_string())));
    }

    fn rows_from(connection: &Connection, table: &str, column: &str, page_id: i64) -> i64 {
        connection
            .query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE {column} = ?1"),
                params![page_id],
                |row| row.get(0),
            )
            .expect("count rows")
    }

    #[test]
    fn language_links_apply_to_every_subject_namespace() {
        let (_temp, mut connection) = synced_sample();
        connection
            .execute(
                "UPDATE text SET old_text = '[[de:Vorlage:Box]]'
                 WHERE old_id = (SELECT rev_text_id FROM revision WHERE rev_id = 12)",
                [],
            )
            .expect("set template text");

        LinkCache::default().update(&mut connection).expect("update");

        assert_eq!(rows_from(&connection, "langlinks", "ll_from", 2), 1);
        assert_eq!(rows_from(&connection, "iwlinks", "iwl_from", 2), 0);
        assert!(is_subject_namespace(10));
        assert!(!is_subject_namespace(11));
        assert!(!is_subject_namespace(-2));
    }

    #[test]
    fn pages_without_text_lose_their_derived_rows() {
        let (_temp, mut connection) = synced_sample();
        LinkCache::default().update(&mut connection).expect("initial update");
        assert_eq!(categories(&connection, 2).len(), 1);

        connection
            .execute_batch(
                "UPDATE revision SET rev_text_id = NULL WHERE rev_id = 12;
                 DELETE FROM ws_parser_cache_sync WHERE wspc_page_id = 2;",
            )
            .expect("drop template text");

        let report = LinkCache::default().update(&mut connection).expect("update");
        assert_eq!((report.recomputed, report.skipped), (1, 1));
        assert!(categories(&connection, 2).is_empty());
        assert_eq!(marker(&connection, 2), None);
        assert!(categories(&connection, 1).is_empty());
    }
}
