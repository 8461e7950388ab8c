use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::api::{PageSelector, RemotePage};
use crate::changefeed::{ChangeFeed, Coverage};
use crate::row;
use crate::timestamp::{format_timestamp, normalize_expiry, normalize_timestamp};

const UPSERT_PAGE: &str = "INSERT INTO page
        (page_id, page_namespace, page_title, page_is_redirect, page_is_new, page_touched,
         page_latest, page_len, page_content_model, page_lang)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT(page_id) DO UPDATE SET
        page_namespace = excluded.page_namespace,
        page_title = excluded.page_title,
        page_is_redirect = excluded.page_is_redirect,
        page_is_new = excluded.page_is_new,
        page_touched = excluded.page_touched,
        page_latest = excluded.page_latest,
        page_len = excluded.page_len,
        page_content_model = excluded.page_content_model,
        page_lang = excluded.page_lang";
const UPSERT_PROP: &str = "INSERT INTO page_props (pp_page, pp_propname, pp_value, pp_sortkey)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(pp_page, pp_propname) DO UPDATE SET
        pp_value = excluded.pp_value,
        pp_sortkey = excluded.pp_sortkey";
const UPSERT_RESTRICTION: &str = "INSERT INTO page_restrictions
        (pr_page, pr_type, pr_level, pr_cascade, pr_user, pr_expiry)
    VALUES (?1, ?2, ?3, ?4, NULL, ?5)
    ON CONFLICT(pr_page, pr_type) DO UPDATE SET
        pr_level = excluded.pr_level,
        pr_cascade = excluded.pr_cascade,
        pr_expiry = excluded.pr_expiry";
const DELETE_STALE_PROPS: &str = "DELETE FROM page_props
    WHERE pp_page = ?1 AND pp_propname NOT IN (SELECT value FROM json_each(?2))";
const DELETE_STALE_RESTRICTIONS: &str = "DELETE FROM page_restrictions
    WHERE pr_page = ?1 AND pr_type NOT IN (SELECT value FROM json_each(?2))";

const ARCHIVE_REVISIONS: &str = "INSERT INTO archive
        (ar_namespace, ar_title, ar_rev_id, ar_page_id, ar_text_id, ar_comment, ar_user,
         ar_user_text, ar_timestamp, ar_minor_edit, ar_deleted, ar_len, ar_parent_id, ar_sha1,
         ar_content_model, ar_content_format)
    SELECT ?2, ?3, rev_id, rev_page, rev_text_id, rev_comment, rev_user, rev_user_text,
           rev_timestamp, rev_minor_edit, rev_deleted, rev_len, rev_parent_id, rev_sha1,
           rev_content_model, rev_content_format
    FROM revision WHERE rev_page = ?1
    ON CONFLICT(ar_rev_id) DO NOTHING";
const ARCHIVE_TAGS: &str = "INSERT INTO tagged_archived_revision (tgar_tag_id, tgar_rev_id)
    SELECT tgrev_tag_id, tgrev_rev_id FROM tagged_revision
    JOIN revision ON rev_id = tgrev_rev_id
    WHERE rev_page = ?1
    ON CONFLICT DO NOTHING";
const DELETE_REVISIONS: &str = "DELETE FROM revision WHERE rev_page = ?1";
const DELETE_PAGE: &str = "DELETE FROM page WHERE page_id = ?1";
const MOVE_PAGE: &str = "UPDATE page SET page_namespace = ?2, page_title = ?3 WHERE page_id = ?1";
const DELETE_ORPHAN_RECENT_CHANGES: &str = "DELETE FROM recentchanges
    WHERE rc_logid IS NULL AND rc_cur_id NOT IN (SELECT page_id FROM page)";

/// Live pages with their properties and restrictions.
#[derive(Debug, Default)]
pub struct PagesGrabber {
    /// Pages present before the current rebuild started.
    previous: Vec<(i64, i64, String)>,
}

#[derive(Debug)]
struct PendingMove {
    page_id: i64,
    source: (i64, String),
    namespace: i64,
    title: String,
}

impl PagesGrabber {
    fn queue(ctx: &mut GrabContext<'_, '_>, page: &RemotePage, clear_stale: bool) -> Result<()> {
        let Some(page_id) = page.pageid.filter(|_| !page.missing) else {
            return Ok(());
        };
        let title = ctx.titles.db_title(&page.title, page.ns);
        let touched = match page.touched.as_deref() {
            Some(touched) => normalize_timestamp(touched)?,
            None => format_timestamp(ctx.now),
        };
        ctx.execute(
            UPSERT_PAGE,
            row![
                page_id,
                page.ns,
                title,
                page.redirect,
                page.new,
                touched,
                page.lastrevid.unwrap_or_default(),
                page.length.unwrap_or_default(),
                page.contentmodel,
                page.pagelanguage,
            ],
        )?;

        for (name, value) in &page.pageprops {
            let sortkey = value.trim().parse::<f64>().ok();
            ctx.execute(UPSERT_PROP, row![page_id, name, value, sortkey])?;
        }

        let mut kinds = Vec::new();
        for protection in page.protection.iter().filter(|protection| protection.source.is_none()) {
            ctx.execute(
                UPSERT_RESTRICTION,
                row![
                    page_id,
                    protection.kind,
                    protection.level,
                    protection.cascade,
                    normalize_expiry(&protection.expiry)?,
                ],
            )?;
            kinds.push(protection.kind.clone());
        }

        if clear_stale {
            let props = page.pageprops.keys().collect::<Vec<_>>();
            ctx.execute(
                DELETE_STALE_PROPS,
                row![page_id, serde_json::to_string(&props)?],
            )?;
            ctx.execute(
                DELETE_STALE_RESTRICTIONS,
                row![page_id, serde_json::to_string(&kinds)?],
            )?;
        }
        Ok(())
    }

    /// Moves a page's revisions and their tags into the archive.
    fn archive_revisions(
        ctx: &mut GrabContext<'_, '_>,
        page_id: i64,
        namespace: i64,
        title: &str,
    ) -> Result<()> {
        ctx.execute(ARCHIVE_REVISIONS, row![page_id, namespace, title])?;
        ctx.execute(ARCHIVE_TAGS, row![page_id])?;
        ctx.execute(DELETE_REVISIONS, row![page_id])
    }

    fn queue_all_pages(ctx: &mut GrabContext<'_, '_>, clear_stale: bool) -> Result<()> {
        for page in ctx.api.all_pages()? {
            Self::queue(ctx, &page, clear_stale)?;
        }
        Ok(())
    }
}

fn page_location(connection: &Connection, page_id: i64) -> Result<Option<(i64, String)>> {
    connection
        .query_row(
            "SELECT page_namespace, page_title FROM page WHERE page_id = ?1",
            params![page_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to look up page {page_id}"))
}

impl Grabber for PagesGrabber {
    fn name(&self) -> &'static str {
        "GrabberPages"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &["page_restrictions", "page_props", "page"]
    }

    fn prepare_rebuild(&mut self, connection: &Connection) -> Result<()> {
        let mut statement = connection
            .prepare("SELECT page_id, page_namespace, page_title FROM page")
            .context("failed to prepare page snapshot")?;
        self.previous = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .context("failed to snapshot pages")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode page snapshot")?;
        Ok(())
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        Self::queue_all_pages(ctx, false)?;
        ctx.flush()?;

        let previous = std::mem::take(&mut self.previous);
        let mut vanished = 0usize;
        for (page_id, namespace, title) in previous {
            if page_location(ctx.db(), page_id)?.is_none() {
                Self::archive_revisions(ctx, page_id, namespace, &title)?;
                vanished += 1;
            }
        }
        if vanished > 0 {
            tracing::info!(pages = vanished, "archived revisions of pages gone from the remote");
        }
        ctx.execute(DELETE_ORPHAN_RECENT_CHANGES, Vec::new())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let feed = ChangeFeed::new(ctx.db());
        let events = feed.log_events_since(
            Some(since),
            &["delete", "suppress", "protect", "move", "import"],
        )?;

        let mut deleted = BTreeSet::new();
        let mut modified = FirstSeen::default();
        let mut moves = Vec::new();
        for event in &events {
            let Some(page_id) = event.page_id.filter(|id| *id > 0) else {
                continue;
            };
            let action = event.log_action.as_deref().unwrap_or_default();
            let is_delete = (event.is_log("delete") && matches!(action, "delete" | "delete_redir"))
                || event.is_action("suppress", "delete");
            if is_delete {
                deleted.insert(page_id);
                continue;
            }
            if event.is_log("suppress") {
                continue;
            }
            modified.insert(page_id);
            if event.is_log("move")
                && matches!(action, "move" | "move_redir")
                && let Some(target) = event.param_str("target_title")
            {
                let namespace = event.param_i64("target_ns").unwrap_or_default();
                moves.push(PendingMove {
                    page_id,
                    source: (event.namespace, event.title.clone()),
                    namespace,
                    title: ctx.titles.db_title(target, namespace),
                });
            }
        }

        let window_short = match feed.check_window(since)? {
            Coverage::Covered(()) => {
                if let Coverage::Covered(changes) =
                    feed.recent_changes_since(since, &["edit", "new", "log"])?
                {
                    for page_id in changes.iter().filter_map(|event| event.page_id).filter(|id| *id > 0) {
                        modified.insert(page_id);
                    }
                }
                false
            }
            Coverage::WindowTooShort { oldest } => {
                tracing::warn!(
                    oldest = ?oldest.map(format_timestamp),
                    "recent changes do not cover the last page sync, refreshing every page"
                );
                true
            }
        };

        // Redirects left behind by moves have no feed entry of their own.
        if !moves.is_empty() {
            let sources = moves
                .iter()
                .map(|pending| ctx.titles.full_title(pending.source.0, &pending.source.1))
                .collect::<Vec<_>>();
            for page in ctx.api.pages(&PageSelector::Titles(sources))? {
                if let Some(page_id) = page.pageid.filter(|_| !page.missing) {
                    modified.insert(page_id);
                }
            }
        }

        for page_id in deleted {
            ctx.flush()?;
            if let Some((namespace, title)) = page_location(ctx.db(), page_id)? {
                Self::archive_revisions(ctx, page_id, namespace, &title)?;
                ctx.execute(DELETE_PAGE, row![page_id])?;
            }
        }
        ctx.flush()?;

        for pending in &moves {
            ctx.execute(MOVE_PAGE, row![pending.page_id, pending.namespace, pending.title])?;
        }
        ctx.flush()?;

        let ids = modified.ids;
        if !ids.is_empty() {
            for page in ctx.api.pages(&PageSelector::Ids(ids))? {
                Self::queue(ctx, &page, true)?;
            }
        }
        if window_short {
            Self::queue_all_pages(ctx, true)?;
        }

        ctx.execute(DELETE_ORPHAN_RECENT_CHANGES, Vec::new())?;
        Ok(UpdateOutcome::CaughtUp)
    }
}

/// Page ids in the order their events happened, without repeats.
#[derive(Debug, Default)]
struct FirstSeen {
    seen: HashSet<i64>,
    ids: Vec<i64>,
}

impl FirstSeen {
    fn insert(&mut self, id: i64) {
        if self.seen.insert(id) {
            self.ids.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::PagesGrabber;
    use crate::api::{PageSelector, RemoteProtection};
    use crate::grabbers::{GrabberRunner, LoggingGrabber, NamespacesGrabber, RecentChangesGrabber};
    use crate::test_support::{
        SteppingClock, count, migrated_mirror, remote_log, remote_page, sample_wiki, ts,
    };

    fn titles(connection: &rusqlite::Connection) -> Vec<(i64, String)> {
        connection
            .prepare("SELECT page_id, page_title FROM page ORDER BY page_id")
            .expect("prepare")
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("titles")
    }

    fn seed_revision(connection: &rusqlite::Connection, rev_id: i64, page_id: i64) {
        connection
            .execute(
                "INSERT INTO revision (rev_id, rev_page, rev_timestamp, rev_user_text) VALUES (?1, ?2, '2024-01-01T00:00:00Z', 'Alice')",
                [rev_id, page_id],
            )
            .expect("seed revision");
    }

    #[test]
    fn insert_stores_props_and_own_restrictions_only() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        api.pages[0].pageprops.insert("displaytitle".to_string(), "Home".to_string());
        api.pages[0].protection = vec![
            RemoteProtection {
                kind: "edit".to_string(),
                level: "sysop".to_string(),
                expiry: "infinity".to_string(),
                cascade: true,
                source: None,
            },
            RemoteProtection {
                kind: "move".to_string(),
                level: "sysop".to_string(),
                expiry: "infinity".to_string(),
                cascade: false,
                source: Some("Other page".to_string()),
            },
        ];
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner
            .insert(&mut connection, &mut api, &mut PagesGrabber::default())
            .expect("insert");

        assert_eq!(titles(&connection), vec![(1, "Main Page".to_string()), (2, "Box".to_string())]);
        assert_eq!(count(&connection, "page_props"), 1);
        assert_eq!(count(&connection, "page_restrictions"), 1);
    }

    fn replay_chained_moves(batch_size: usize) {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        api.pages = vec![remote_page(1, 0, "X", 11, "2024-01-01T00:00:00Z")];
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, batch_size);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner.insert(&mut connection, &mut api, &mut RecentChangesGrabber).expect("rc");
        runner
            .insert(&mut connection, &mut api, &mut PagesGrabber::default())
            .expect("insert");

        api.pages = vec![remote_page(1, 0, "Z", 11, "2024-01-06T00:00:00Z")];
        let mut first = remote_log(
            60,
            "move",
            "move",
            "X",
            "2024-01-05T00:00:00Z",
            json!({"target_ns": 0, "target_title": "Y", "suppressredirect": true}),
        );
        first.logpage = Some(1);
        let mut second = remote_log(
            61,
            "move",
            "move",
            "Y",
            "2024-01-06T00:00:00Z",
            json!({"target_ns": 0, "target_title": "Z", "suppressredirect": true}),
        );
        second.logpage = Some(1);
        api.log_events.extend([first, second]);
        runner.insert(&mut connection, &mut api, &mut LoggingGrabber).expect("logging");
        runner
            .update(
                &mut connection,
                &mut api,
                &mut PagesGrabber::default(),
                Some(ts("2024-01-03T00:00:00Z")),
            )
            .expect("update");

        assert_eq!(titles(&connection), vec![(1, "Z".to_string())]);
    }

    #[test]
    fn chained_moves_converge_for_any_batch_size() {
        for batch_size in [1, 2, 100] {
            replay_chained_moves(batch_size);
        }
    }

    #[test]
    fn delete_archives_revisions_before_removing_page() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner.insert(&mut connection, &mut api, &mut RecentChangesGrabber).expect("rc");
        runner
            .insert(&mut connection, &mut api, &mut PagesGrabber::default())
            .expect("insert");
        seed_revision(&connection, 12, 2);

        api.pages.retain(|page| page.pageid != Some(2));
        let mut delete = remote_log(70, "delete", "delete", "Template:Box", "2024-01-05T00:00:00Z", json!({}));
        delete.ns = Some(10);
        delete.logpage = Some(2);
        api.log_events.push(delete);
        runner.insert(&mut connection, &mut api, &mut LoggingGrabber).expect("logging");
        runner
            .update(
                &mut connection,
                &mut api,
                &mut PagesGrabber::default(),
                Some(ts("2024-01-03T00:00:00Z")),
            )
            .expect("update");

        assert_eq!(titles(&connection), vec![(1, "Main Page".to_string())]);
        assert_eq!(count(&connection, "revision"), 0);
        let archived: (i64, String) = connection
            .query_row("SELECT ar_namespace, ar_title FROM archive WHERE ar_rev_id = 12", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .expect("archived");
        assert_eq!(archived, (10, "Box".to_string()));
        // the creation of the deleted template no longer has a page
        assert_eq!(count(&connection, "recentchanges"), 2);
    }

    #[test]
    fn changed_pages_are_refetched_in_event_order() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner.insert(&mut connection, &mut api, &mut RecentChangesGrabber).expect("rc");
        runner
            .insert(&mut connection, &mut api, &mut PagesGrabber::default())
            .expect("insert");

        let mut template = remote_log(80, "protect", "protect", "Template:Box", "2024-01-05T00:00:00Z", json!({}));
        template.ns = Some(10);
        template.logpage = Some(2);
        let mut main = remote_log(81, "protect", "protect", "Main Page", "2024-01-06T00:00:00Z", json!({}));
        main.logpage = Some(1);
        let mut again = remote_log(82, "protect", "modify", "Template:Box", "2024-01-07T00:00:00Z", json!({}));
        again.ns = Some(10);
        again.logpage = Some(2);
        api.log_events.extend([template, main, again]);
        runner.insert(&mut connection, &mut api, &mut LoggingGrabber).expect("logging");
        api.page_requests.clear();
        runner
            .update(
                &mut connection,
                &mut api,
                &mut PagesGrabber::default(),
                Some(ts("2024-01-03T00:00:00Z")),
            )
            .expect("update");

        let requested = api
            .page_requests
            .iter()
            .filter_map(|selector| match selector {
                PageSelector::Ids(ids) => Some(ids.clone()),
                PageSelector::Titles(_) => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(requested, vec![vec![2, 1]]);
    }

    #[test]
    fn rebuild_archives_revisions_of_vanished_pages() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner
            .insert(&mut connection, &mut api, &mut PagesGrabber::default())
            .expect("insert");
        seed_revision(&connection, 10, 1);
        seed_revision(&connection, 12, 2);

        api.pages.retain(|page| page.pageid != Some(2));
        runner
            .insert(&mut connection, &mut api, &mut PagesGrabber::default())
            .expect("rebuild");

        assert_eq!(count(&connection, "page"), 1);
        assert_eq!(count(&connection, "revision"), 1);
        assert_eq!(count(&connection, "archive"), 1);
    }
}
