use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::api::{
    BlockQuery, FeedBounds, LogQuery, PageSelector, RemoteApi, RemoteBlock, RemoteInterwiki,
    RemoteLogEvent, RemoteNamespace, RemoteNamespaceAlias, RemotePage, RemoteProtectedTitle,
    RemoteRecentChange, RemoteRevision, RemoteTag, RemoteUser, RevisionContent, SiteInfo,
};
use crate::migrate::{migrate_connection, open_connection};
use crate::timestamp::{Clock, format_timestamp, parse_timestamp};
use crate::title::TitleResolver;

pub fn ts(value: &str) -> DateTime<Utc> {
    parse_timestamp(value).expect("valid test timestamp")
}

pub fn migrated_mirror() -> (TempDir, Connection) {
    let temp = tempfile::tempdir().expect("tempdir");
    let connection = open_connection(&temp.path().join("mirror.db")).expect("open");
    migrate_connection(&connection).expect("migrate");
    (temp, connection)
}

pub fn mirror_with_namespaces() -> (TempDir, Connection) {
    let (temp, connection) = migrated_mirror();
    connection
        .execute_batch(
            r#"
            INSERT INTO namespace (ns_id, ns_case, ns_content) VALUES
                (-1, 'first-letter', 0), (0, 'first-letter', 1), (1, 'first-letter', 0),
                (2, 'first-letter', 0), (6, 'first-letter', 0), (10, 'first-letter', 0),
                (12, 'first-letter', 0), (14, 'first-letter', 0);
            INSERT INTO namespace_starname (nss_id, nss_name) VALUES
                (-1, 'Special'), (0, ''), (1, 'Talk'), (2, 'User'), (6, 'File'),
                (10, 'Template'), (12, 'Help'), (14, 'Category');
            INSERT INTO namespace_name (nsn_id, nsn_name) VALUES
                (-1, 'Special'), (0, ''), (1, 'Talk'), (2, 'User'), (6, 'File'), (6, 'Image'),
                (10, 'Template'), (12, 'Help'), (14, 'Category');
            INSERT INTO interwiki (iw_prefix, iw_url, iw_local, iw_trans, iw_language) VALUES
                ('de', 'https://wiki.example.de/$1', 1, 0, 'Deutsch'),
                ('wikipedia', 'https://en.wikipedia.org/wiki/$1', 0, 0, NULL);
            "#,
        )
        .expect("seed namespaces");
    (temp, connection)
}

pub fn seeded_resolver() -> TitleResolver {
    let (_temp, connection) = mirror_with_namespaces();
    TitleResolver::load(&connection).expect("load resolver")
}

pub fn count(connection: &Connection, table: &str) -> i64 {
    connection
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count")
}

/// Every row of every mirrored table, for whole-database comparisons.
pub fn snapshot(connection: &Connection) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for (table, _) in crate::migrate::table_row_counts(connection).expect("tables") {
        let mut statement = connection
            .prepare(&format!("SELECT * FROM \"{table}\""))
            .expect("prepare snapshot");
        let columns = statement.column_count();
        let mut rows = statement
            .query_map([], |row| {
                let mut values = Vec::with_capacity(columns);
                for index in 0..columns {
                    let value: rusqlite::types::Value = row.get(index)?;
                    values.push(format!("{value:?}"));
                }
                Ok(values.join("|"))
            })
            .expect("query snapshot")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("decode snapshot");
        rows.sort();
        out.insert(table, rows);
    }
    out
}

/// Clock that advances by a fixed step on every reading.
pub struct SteppingClock {
    start: DateTime<Utc>,
    step: Duration,
    readings: Cell<i32>,
}

impl SteppingClock {
    pub fn new(start: &str, step_secs: i64) -> Self {
        Self {
            start: ts(start),
            step: Duration::seconds(step_secs),
            readings: Cell::new(0),
        }
    }

    pub fn readings(&self) -> i32 {
        self.readings.get()
    }

    /// The value returned by the reading with the given zero-based index.
    pub fn reading(&self, index: i32) -> DateTime<Utc> {
        self.start + self.step * index
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let index = self.readings.get();
        self.readings.set(index + 1);
        self.reading(index)
    }
}

/// In-memory remote wiki.
#[derive(Default)]
pub struct MockApi {
    pub site: SiteInfo,
    pub interwiki: Vec<RemoteInterwiki>,
    pub tags: Vec<RemoteTag>,
    pub recent_changes: Vec<RemoteRecentChange>,
    pub log_events: Vec<RemoteLogEvent>,
    pub users: Vec<RemoteUser>,
    pub blocks: Vec<RemoteBlock>,
    pub pages: Vec<RemotePage>,
    pub protected_titles: Vec<RemoteProtectedTitle>,
    pub revisions: Vec<RemoteRevision>,
    pub deleted_revisions: Vec<RemoteRevision>,
    pub calls: Vec<String>,
    pub page_requests: Vec<PageSelector>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            site: site_info(),
            ..Self::default()
        }
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls.iter().filter(|call| call.as_str() == name).count()
    }

    fn split_title(&self, full: &str) -> (i64, String) {
        if let Some((prefix, rest)) = full.split_once(':')
            && let Some(entry) = self.site.namespaces.values().find(|entry| entry.name == prefix)
        {
            return (entry.id, rest.to_string());
        }
        (0, full.to_string())
    }

    fn archived_revisions(&self) -> impl Iterator<Item = RemoteRevision> + '_ {
        self.deleted_revisions.iter().map(|revision| RemoteRevision {
            archived: true,
            ..revision.clone()
        })
    }

    fn record(&mut self, name: &str) {
        self.calls.push(name.to_string());
    }
}

fn after(timestamp: &str, since: Option<DateTime<Utc>>) -> bool {
    since.is_none_or(|since| timestamp > format_timestamp(since).as_str())
}

impl RemoteApi for MockApi {
    fn site_info(&mut self) -> Result<SiteInfo> {
        self.record("site_info");
        Ok(self.site.clone())
    }

    fn interwiki_map(&mut self) -> Result<Vec<RemoteInterwiki>> {
        self.record("interwiki_map");
        Ok(self.interwiki.clone())
    }

    fn tags(&mut self) -> Result<Vec<RemoteTag>> {
        self.record("tags");
        Ok(self.tags.clone())
    }

    fn recent_changes(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRecentChange>> {
        self.record("recent_changes");
        let mut out = self
            .recent_changes
            .iter()
            .filter(|rc| after(&rc.timestamp, since))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|left, right| (&left.timestamp, left.rcid).cmp(&(&right.timestamp, right.rcid)));
        Ok(out)
    }

    fn recent_changes_bounds(&mut self) -> Result<Option<FeedBounds>> {
        self.record("recent_changes_bounds");
        let oldest = self.recent_changes.iter().map(|rc| rc.timestamp.as_str()).min();
        let newest = self.recent_changes.iter().map(|rc| rc.timestamp.as_str()).max();
        Ok(match (oldest, newest) {
            (Some(oldest), Some(newest)) => Some(FeedBounds {
                oldest: parse_timestamp(oldest)?,
                newest: parse_timestamp(newest)?,
            }),
            _ => None,
        })
    }

    fn log_events(&mut self, query: &LogQuery) -> Result<Vec<RemoteLogEvent>> {
        self.record("log_events");
        let mut out = self
            .log_events
            .iter()
            .filter(|event| after(&event.timestamp, query.since))
            .filter(|event| {
                query
                    .log_type
                    .as_ref()
                    .is_none_or(|log_type| &event.log_type == log_type)
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|left, right| (&left.timestamp, left.logid).cmp(&(&right.timestamp, right.logid)));
        Ok(out)
    }

    fn all_users(&mut self) -> Result<Vec<RemoteUser>> {
        self.record("all_users");
        Ok(self.users.clone())
    }

    fn users(&mut self, names: &[String]) -> Result<Vec<RemoteUser>> {
        self.record("users");
        Ok(names
            .iter()
            .map(|name| {
                self.users
                    .iter()
                    .find(|user| &user.name == name)
                    .cloned()
                    .unwrap_or_else(|| RemoteUser {
                        name: name.clone(),
                        missing: true,
                        ..RemoteUser::default()
                    })
            })
            .collect())
    }

    fn blocks(&mut self, query: &BlockQuery) -> Result<Vec<RemoteBlock>> {
        self.record("blocks");
        Ok(self
            .blocks
            .iter()
            .filter(|block| {
                query
                    .start
                    .is_none_or(|start| block.timestamp >= format_timestamp(start))
            })
            .filter(|block| query.users.is_empty() || query.users.contains(&block.user))
            .cloned()
            .collect())
    }

    fn all_pages(&mut self) -> Result<Vec<RemotePage>> {
        self.record("all_pages");
        let mut out = self.pages.clone();
        out.sort_by(|left, right| (left.ns, &left.title).cmp(&(right.ns, &right.title)));
        Ok(out)
    }

    fn pages(&mut self, selector: &PageSelector) -> Result<Vec<RemotePage>> {
        self.record("pages");
        self.page_requests.push(selector.clone());
        Ok(match selector {
            PageSelector::Ids(ids) => ids
                .iter()
                .filter_map(|id| self.pages.iter().find(|page| page.pageid == Some(*id)).cloned())
                .collect(),
            PageSelector::Titles(titles) => titles
                .iter()
                .map(|full| {
                    let (ns, _) = self.split_title(full);
                    self.pages
                        .iter()
                        .find(|page| &page.title == full)
                        .cloned()
                        .unwrap_or_else(|| {
                            let protection = self
                                .protected_titles
                                .iter()
                                .filter(|pt| &pt.title == full)
                                .map(|pt| crate::api::RemoteProtection {
                                    kind: "create".to_string(),
                                    level: pt.level.clone(),
                                    expiry: pt.expiry.clone(),
                                    ..Default::default()
                                })
                                .collect();
                            RemotePage {
                                ns,
                                title: full.clone(),
                                missing: true,
                                protection,
                                ..RemotePage::default()
                            }
                        })
                })
                .collect(),
        })
    }

    fn protected_titles(&mut self) -> Result<Vec<RemoteProtectedTitle>> {
        self.record("protected_titles");
        Ok(self.protected_titles.clone())
    }

    fn all_revisions(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRevision>> {
        self.record("all_revisions");
        let mut out = self
            .revisions
            .iter()
            .filter(|revision| after(&revision.timestamp, since))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|left, right| (&left.timestamp, left.revid).cmp(&(&right.timestamp, right.revid)));
        Ok(out)
    }

    fn all_deleted_revisions(&mut self) -> Result<Vec<RemoteRevision>> {
        self.record("all_deleted_revisions");
        Ok(self.archived_revisions().collect())
    }

    fn deleted_revisions(&mut self, titles: &[String]) -> Result<Vec<RemoteRevision>> {
        self.record("deleted_revisions");
        let wanted = titles.iter().cloned().collect::<BTreeSet<_>>();
        Ok(self
            .archived_revisions()
            .filter(|revision| wanted.contains(&revision.title))
            .collect())
    }

    fn page_history(&mut self, selector: &PageSelector) -> Result<Vec<RemoteRevision>> {
        self.record("page_history");
        let matches = |revision: &RemoteRevision| match selector {
            PageSelector::Ids(ids) => revision.pageid.is_some_and(|id| ids.contains(&id)),
            PageSelector::Titles(titles) => titles.contains(&revision.title),
        };
        Ok(self
            .revisions
            .iter()
            .cloned()
            .chain(self.archived_revisions())
            .filter(|revision| matches(revision))
            .collect())
    }

    fn revision_contents(&mut self, revids: &[i64]) -> Result<Vec<RevisionContent>> {
        self.record("revision_contents");
        Ok(revids
            .iter()
            .filter_map(|revid| {
                self.revisions
                    .iter()
                    .find(|revision| revision.revid == *revid)
                    .and_then(|revision| {
                        revision.content.clone().map(|content| RevisionContent {
                            revid: *revid,
                            content,
                        })
                    })
            })
            .collect())
    }

    fn request_count(&self) -> usize {
        self.calls.len()
    }
}

pub fn site_info() -> SiteInfo {
    let namespaces = [
        (-1, "Special", "Special"),
        (0, "", ""),
        (1, "Talk", "Talk"),
        (2, "User", "User"),
        (6, "File", "File"),
        (10, "Template", "Template"),
        (12, "Help", "Help"),
        (14, "Category", "Category"),
    ]
    .into_iter()
    .map(|(id, name, canonical)| {
        (
            id.to_string(),
            RemoteNamespace {
                id,
                case: "first-letter".to_string(),
                name: name.to_string(),
                canonical: (!canonical.is_empty()).then(|| canonical.to_string()),
                content: id == 0,
                subpages: id == 2 || id == 12,
                nonincludable: false,
                defaultcontentmodel: None,
                namespaceprotection: None,
            },
        )
    })
    .collect();
    SiteInfo {
        namespaces,
        namespace_aliases: vec![RemoteNamespaceAlias {
            id: 6,
            alias: "Image".to_string(),
        }],
    }
}

pub fn remote_page(pageid: i64, ns: i64, title: &str, lastrevid: i64, touched: &str) -> RemotePage {
    RemotePage {
        pageid: Some(pageid),
        ns,
        title: title.to_string(),
        contentmodel: Some("wikitext".to_string()),
        pagelanguage: Some("en".to_string()),
        touched: Some(touched.to_string()),
        lastrevid: Some(lastrevid),
        length: Some(10),
        ..RemotePage::default()
    }
}

pub fn remote_revision(revid: i64, pageid: i64, ns: i64, title: &str, timestamp: &str) -> RemoteRevision {
    RemoteRevision {
        pageid: Some(pageid),
        ns,
        title: title.to_string(),
        revid,
        parentid: Some(0),
        timestamp: timestamp.to_string(),
        user: Some("Alice".to_string()),
        userid: Some(1),
        comment: Some(String::new()),
        size: Some(10),
        sha1: Some(format!("sha{revid}")),
        contentmodel: Some("wikitext".to_string()),
        ..RemoteRevision::default()
    }
}

pub fn remote_rc(rcid: i64, kind: &str, ns: i64, title: &str, timestamp: &str) -> RemoteRecentChange {
    RemoteRecentChange {
        rcid,
        kind: kind.to_string(),
        ns,
        title: title.to_string(),
        user: Some("Alice".to_string()),
        userid: Some(1),
        timestamp: timestamp.to_string(),
        comment: Some(String::new()),
        ..RemoteRecentChange::default()
    }
}

pub fn remote_log(
    logid: i64,
    log_type: &str,
    action: &str,
    title: &str,
    timestamp: &str,
    params: Value,
) -> RemoteLogEvent {
    RemoteLogEvent {
        logid,
        log_type: log_type.to_string(),
        action: action.to_string(),
        ns: Some(0),
        title: Some(title.to_string()),
        params,
        user: Some("Admin".to_string()),
        userid: Some(2),
        timestamp: timestamp.to_string(),
        comment: Some(String::new()),
        ..RemoteLogEvent::default()
    }
}

pub fn remote_user(userid: i64, name: &str, groups: &[&str]) -> RemoteUser {
    RemoteUser {
        userid: Some(userid),
        name: name.to_string(),
        registration: Some("2020-01-01T00:00:00Z".to_string()),
        editcount: Some(5),
        groups: groups.iter().map(|group| (*group).to_string()).collect(),
        ..RemoteUser::default()
    }
}

/// A small wiki with two users, a template, a content page and a short feed.
pub fn sample_wiki() -> MockApi {
    let mut api = MockApi::new();
    api.interwiki = vec![
        RemoteInterwiki {
            prefix: "de".to_string(),
            url: "https://wiki.example.de/$1".to_string(),
            api: None,
            local: true,
            trans: false,
            language: Some("Deutsch".to_string()),
        },
        RemoteInterwiki {
            prefix: "wikipedia".to_string(),
            url: "https://en.wikipedia.org/wiki/$1".to_string(),
            api: Some("https://en.wikipedia.org/w/api.php".to_string()),
            local: false,
            trans: false,
            language: None,
        },
    ];
    api.tags = vec![RemoteTag {
        name: "mw-undo".to_string(),
        displayname: Some("Undo".to_string()),
        description: Some("Undid an edit".to_string()),
        defined: true,
        active: true,
        source: vec!["software".to_string()],
    }];
    api.users = vec![
        remote_user(1, "Alice", &["*", "user", "autoconfirmed"]),
        remote_user(2, "Admin", &["*", "user", "sysop"]),
    ];
    api.pages = vec![
        remote_page(1, 0, "Main Page", 11, "2024-01-02T00:00:00Z"),
        remote_page(2, 10, "Template:Box", 12, "2024-01-02T00:00:00Z"),
    ];
    let mut first = remote_revision(10, 1, 0, "Main Page", "2024-01-01T00:00:00Z");
    first.content = Some("Hello".to_string());
    let mut second = remote_revision(11, 1, 0, "Main Page", "2024-01-02T00:00:00Z");
    second.parentid = Some(10);
    second.content = Some("Hello {{Box}} [[Help:Intro]]".to_string());
    second.tags = vec!["mw-undo".to_string()];
    let mut template = remote_revision(12, 2, 10, "Template:Box", "2024-01-02T00:00:00Z");
    template.content = Some("[[Category:Boxes]]".to_string());
    api.revisions = vec![first, second, template];

    let mut created = remote_rc(1, "new", 0, "Main Page", "2024-01-01T00:00:00Z");
    created.pageid = Some(1);
    created.revid = Some(10);
    created.old_revid = Some(0);
    created.new = true;
    let mut edited = remote_rc(2, "edit", 0, "Main Page", "2024-01-02T00:00:00Z");
    edited.pageid = Some(1);
    edited.revid = Some(11);
    edited.old_revid = Some(10);
    edited.tags = vec!["mw-undo".to_string()];
    let mut template_rc = remote_rc(3, "new", 10, "Template:Box", "2024-01-02T00:00:00Z");
    template_rc.pageid = Some(2);
    template_rc.revid = Some(12);
    template_rc.new = true;
    api.recent_changes = vec![created, edited, template_rc];
    api.log_events = vec![remote_log(
        1,
        "newusers",
        "create",
        "User:Alice",
        "2020-01-01T00:00:00Z",
        json!({"userid": 1}),
    )];
    api.log_events[0].ns = Some(2);
    api
}

/// A mirror fully grabbed from [`sample_wiki`], revision content included.
pub fn synced_sample() -> (TempDir, Connection) {
    let (temp, mut connection) = migrated_mirror();
    let mut api = sample_wiki();
    let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
    let runner = crate::grabbers::GrabberRunner::new(&clock, 10);
    for mut grabber in crate::grabbers::default_grabbers(true) {
        runner
            .insert(&mut connection, &mut api, grabber.as_mut())
            .expect("grab sample wiki");
    }
    (temp, connection)
}
