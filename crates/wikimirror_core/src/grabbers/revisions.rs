use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::api::{PageSelector, RemoteRevision};
use crate::changefeed::ChangeFeed;
use crate::row;
use crate::timestamp::{format_timestamp, normalize_timestamp};

const UPSERT_REVISION: &str = "INSERT INTO revision
        (rev_id, rev_page, rev_text_id, rev_comment, rev_user, rev_user_text, rev_timestamp,
         rev_minor_edit, rev_deleted, rev_len, rev_parent_id, rev_sha1, rev_content_model,
         rev_content_format)
    SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
    WHERE EXISTS (SELECT 1 FROM page WHERE page_id = ?2)
    ON CONFLICT(rev_id) DO UPDATE SET
        rev_text_id = COALESCE(excluded.rev_text_id, revision.rev_text_id)";
const UPSERT_ARCHIVE: &str = "INSERT INTO archive
        (ar_namespace, ar_title, ar_rev_id, ar_page_id, ar_text_id, ar_comment, ar_user,
         ar_user_text, ar_timestamp, ar_minor_edit, ar_deleted, ar_len, ar_parent_id, ar_sha1,
         ar_content_model, ar_content_format)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
    ON CONFLICT(ar_rev_id) DO UPDATE SET
        ar_text_id = COALESCE(excluded.ar_text_id, archive.ar_text_id),
        ar_namespace = excluded.ar_namespace,
        ar_title = excluded.ar_title,
        ar_parent_id = excluded.ar_parent_id";
const DROP_LIVE_COPY: &str = "DELETE FROM revision WHERE rev_id = ?1";
const INSERT_TEXT: &str = "INSERT INTO text (old_id, old_text) VALUES (?1, ?2)";

const TAG_LIVE: &str = "INSERT INTO tagged_revision (tgrev_tag_id, tgrev_rev_id)
    SELECT tag_id, ?1 FROM tag WHERE tag_name = ?2 AND EXISTS (SELECT 1 FROM revision WHERE rev_id = ?1)
    ON CONFLICT DO NOTHING";
const TAG_ARCHIVED: &str = "INSERT INTO tagged_archived_revision (tgar_tag_id, tgar_rev_id)
    SELECT tag_id, ?1 FROM tag WHERE tag_name = ?2 AND EXISTS (SELECT 1 FROM archive WHERE ar_rev_id = ?1)
    ON CONFLICT DO NOTHING";
const TAG_RECENT_CHANGE: &str = "INSERT INTO tagged_recentchange (tgrc_tag_id, tgrc_rc_id)
    SELECT tag_id, rc_id FROM tag, recentchanges WHERE tag_name = ?2 AND rc_this_oldid = ?1
    ON CONFLICT DO NOTHING";
const UNTAG_LIVE: &str = "DELETE FROM tagged_revision
    WHERE tgrev_rev_id = ?1 AND tgrev_tag_id IN (SELECT tag_id FROM tag WHERE tag_name = ?2)";
const UNTAG_ARCHIVED: &str = "DELETE FROM tagged_archived_revision
    WHERE tgar_rev_id = ?1 AND tgar_tag_id IN (SELECT tag_id FROM tag WHERE tag_name = ?2)";
const UNTAG_RECENT_CHANGE: &str = "DELETE FROM tagged_recentchange
    WHERE tgrc_rc_id IN (SELECT rc_id FROM recentchanges WHERE rc_this_oldid = ?1)
      AND tgrc_tag_id IN (SELECT tag_id FROM tag WHERE tag_name = ?2)";

const ATTACH_ARCHIVE: &str =
    "UPDATE archive SET ar_page_id = ?1 WHERE ar_namespace = ?2 AND ar_title = ?3";
const RESTORE_REVISIONS: &str = "INSERT INTO revision
        (rev_id, rev_page, rev_text_id, rev_comment, rev_user, rev_user_text, rev_timestamp,
         rev_minor_edit, rev_deleted, rev_len, rev_parent_id, rev_sha1, rev_content_model,
         rev_content_format)
    SELECT ar_rev_id, ar_page_id, ar_text_id, ar_comment, ar_user, ar_user_text, ar_timestamp,
           ar_minor_edit, ar_deleted, ar_len, ar_parent_id, ar_sha1, ar_content_model,
           ar_content_format
    FROM archive
    WHERE ar_page_id = ?1 AND ar_rev_id NOT IN (SELECT value FROM json_each(?2))
    ON CONFLICT(rev_id) DO NOTHING";
const RESTORE_TAGS: &str = "INSERT INTO tagged_revision (tgrev_tag_id, tgrev_rev_id)
    SELECT tgar_tag_id, tgar_rev_id FROM tagged_archived_revision
    JOIN archive ON ar_rev_id = tgar_rev_id
    WHERE ar_page_id = ?1 AND ar_rev_id NOT IN (SELECT value FROM json_each(?2))
    ON CONFLICT DO NOTHING";
const DROP_RESTORED: &str = "DELETE FROM archive
    WHERE ar_page_id = ?1 AND ar_rev_id NOT IN (SELECT value FROM json_each(?2))";

const SUPPRESS_ARCHIVE: &str =
    "UPDATE archive SET ar_deleted = ?1 WHERE ar_namespace = ?2 AND ar_title = ?3";
const MERGE_HISTORY: &str =
    "UPDATE revision SET rev_page = ?1 WHERE rev_page = ?2 AND rev_timestamp <= ?3";
const SET_REVISION_VISIBILITY: &str = "UPDATE revision SET rev_deleted = ?1 WHERE rev_id = ?2";
const SET_ARCHIVE_VISIBILITY: &str = "UPDATE archive SET ar_deleted = ?1 WHERE ar_rev_id = ?2";

/// Live and deleted revision metadata, optionally with content.
#[derive(Debug)]
pub struct RevisionsGrabber {
    with_content: bool,
    next_text_id: i64,
}

#[derive(Debug)]
struct PendingMerge {
    log_id: Option<i64>,
    source: i64,
    namespace: i64,
    title: String,
    mergepoint: String,
}

type TitleKey = (i64, String);

impl RevisionsGrabber {
    pub fn new(with_content: bool) -> Self {
        Self {
            with_content,
            next_text_id: 1,
        }
    }

    fn load_next_text_id(&mut self, connection: &Connection) -> Result<()> {
        let max: Option<i64> = connection
            .query_row("SELECT MAX(old_id) FROM text", [], |row| row.get(0))
            .context("failed to read text id high-water mark")?;
        self.next_text_id = max.unwrap_or_default() + 1;
        Ok(())
    }

    /// Stores the content when enabled and returns its text id.
    fn queue_text(&mut self, ctx: &mut GrabContext<'_, '_>, revision: &RemoteRevision) -> Result<Option<i64>> {
        let Some(content) = revision.content.as_ref().filter(|_| self.with_content) else {
            return Ok(None);
        };
        let text_id = self.next_text_id;
        self.next_text_id += 1;
        ctx.execute(INSERT_TEXT, row![text_id, content])?;
        Ok(Some(text_id))
    }

    fn queue(&mut self, ctx: &mut GrabContext<'_, '_>, revision: &RemoteRevision) -> Result<()> {
        if revision.archived {
            return self.queue_archived(ctx, revision);
        }
        let Some(page_id) = revision.pageid else {
            tracing::warn!(revid = revision.revid, "skipping live revision without page id");
            return Ok(());
        };
        let text_id = self.queue_text(ctx, revision)?;
        ctx.execute(
            UPSERT_REVISION,
            row![
                revision.revid,
                page_id,
                text_id,
                revision.comment.clone().unwrap_or_default(),
                revision.userid.unwrap_or_default(),
                revision.user.clone().unwrap_or_default(),
                normalize_timestamp(&revision.timestamp)?,
                revision.minor,
                revision.deleted.bits(),
                revision.size,
                revision.parentid,
                revision.sha1,
                revision.contentmodel,
                revision.contentformat,
            ],
        )?;
        for tag in &revision.tags {
            ctx.execute(TAG_LIVE, row![revision.revid, tag])?;
        }
        Ok(())
    }

    fn queue_archived(&mut self, ctx: &mut GrabContext<'_, '_>, revision: &RemoteRevision) -> Result<()> {
        let text_id = self.queue_text(ctx, revision)?;
        let title = ctx.titles.db_title(&revision.title, revision.ns);
        ctx.execute(
            UPSERT_ARCHIVE,
            row![
                revision.ns,
                title,
                revision.revid,
                revision.pageid,
                text_id,
                revision.comment.clone().unwrap_or_default(),
                revision.userid.unwrap_or_default(),
                revision.user.clone().unwrap_or_default(),
                normalize_timestamp(&revision.timestamp)?,
                revision.minor,
                revision.deleted.bits(),
                revision.size,
                revision.parentid,
                revision.sha1,
                revision.contentmodel,
                revision.contentformat,
            ],
        )?;
        ctx.execute(DROP_LIVE_COPY, row![revision.revid])?;
        for tag in &revision.tags {
            ctx.execute(TAG_ARCHIVED, row![revision.revid, tag])?;
        }
        Ok(())
    }
}

fn page_at(connection: &Connection, namespace: i64, title: &str) -> Result<Option<i64>> {
    connection
        .query_row(
            "SELECT page_id FROM page WHERE page_namespace = ?1 AND page_title = ?2",
            params![namespace, title],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to look up page {namespace}:{title}"))
}

impl Grabber for RevisionsGrabber {
    fn name(&self) -> &'static str {
        "GrabberRevisions"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &[
            "tagged_revision",
            "tagged_archived_revision",
            "revision",
            "archive",
            "text",
        ]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        self.load_next_text_id(ctx.db())?;
        for revision in ctx.api.all_revisions(None)? {
            self.queue(ctx, &revision)?;
        }
        for revision in ctx.api.all_deleted_revisions()? {
            self.queue_archived(ctx, &revision)?;
        }
        Ok(())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        self.load_next_text_id(ctx.db())?;
        let mut fresh = BTreeSet::new();
        for revision in ctx.api.all_revisions(Some(since))? {
            fresh.insert(revision.revid);
            self.queue(ctx, &revision)?;
        }

        let events = ChangeFeed::new(ctx.db()).log_events_since(
            Some(since),
            &["delete", "suppress", "import", "merge", "move", "tag"],
        )?;
        let mut deleted = BTreeSet::<TitleKey>::new();
        let mut undeleted = BTreeMap::<TitleKey, i64>::new();
        let mut suppressed = BTreeSet::<TitleKey>::new();
        let mut visibility = BTreeMap::<i64, i64>::new();
        let mut imported = BTreeSet::new();
        let mut moved = BTreeSet::new();
        let mut merges = Vec::new();
        let mut tag_changes = BTreeMap::<(i64, String), bool>::new();

        for event in &events {
            let key = (event.namespace, event.title.clone());
            let action = event.log_action.as_deref().unwrap_or_default();
            match (event.log_type.as_deref().unwrap_or_default(), action) {
                ("delete", "delete" | "delete_redir") => {
                    undeleted.remove(&key);
                    deleted.insert(key);
                }
                ("suppress", "delete") => {
                    undeleted.remove(&key);
                    deleted.insert(key.clone());
                    suppressed.insert(key);
                }
                ("delete", "restore") => {
                    deleted.remove(&key);
                    suppressed.remove(&key);
                    if let Some(page_id) = event.page_id.filter(|id| *id > 0) {
                        undeleted.insert(key, page_id);
                    }
                }
                ("delete" | "suppress", "revision") => {
                    if let Some(bitmask) = event.new_bitmask() {
                        visibility.extend(event.param_ids().into_iter().map(|id| (id, bitmask)));
                    }
                }
                ("import", _) => imported.extend(event.page_id.filter(|id| *id > 0)),
                ("move", _) => moved.extend(event.page_id.filter(|id| *id > 0)),
                ("merge", "merge") => {
                    let (Some(source), Some(target), Some(mergepoint)) = (
                        event.page_id,
                        event.param_str("dest_title"),
                        event.param_str("mergepoint"),
                    ) else {
                        tracing::warn!(log_id = ?event.log_id, "merge log entry without parameters");
                        continue;
                    };
                    let namespace = event.param_i64("dest_ns").unwrap_or_default();
                    merges.push(PendingMerge {
                        log_id: event.log_id,
                        source,
                        namespace,
                        title: ctx.titles.db_title(target, namespace),
                        mergepoint: normalize_timestamp(mergepoint)?,
                    });
                }
                ("tag", "update") => {
                    let Some(revid) = event.param_i64("revid").filter(|id| !fresh.contains(id)) else {
                        continue;
                    };
                    for tag in event.param_strings("tagsAdded") {
                        tag_changes.insert((revid, tag), true);
                    }
                    for tag in event.param_strings("tagsRemoved") {
                        tag_changes.insert((revid, tag), false);
                    }
                }
                _ => {}
            }
        }

        // Merges are replayed against current titles; a moved side means the
        // logged destination no longer identifies the right page.
        let mut resolved_merges = Vec::new();
        for merge in &merges {
            let destination = page_at(ctx.db(), merge.namespace, &merge.title)?;
            match destination {
                Some(destination) if !moved.contains(&merge.source) && !moved.contains(&destination) => {
                    resolved_merges.push((merge.source, destination, merge.mergepoint.clone()));
                }
                _ => {
                    tracing::warn!(log_id = ?merge.log_id, "history merge cannot be replayed");
                    return Ok(UpdateOutcome::NeedsRebuild { oldest: None });
                }
            }
        }

        for ((namespace, title), page_id) in &undeleted {
            let full_title = ctx.titles.full_title(*namespace, title);
            let still_deleted = ctx
                .api
                .deleted_revisions(&[full_title])?
                .iter()
                .map(|revision| revision.revid)
                .collect::<Vec<_>>();
            let still_deleted = serde_json::to_string(&still_deleted)?;
            ctx.execute(ATTACH_ARCHIVE, row![page_id, namespace, title])?;
            ctx.execute(RESTORE_REVISIONS, row![page_id, still_deleted])?;
            ctx.execute(RESTORE_TAGS, row![page_id, still_deleted])?;
            ctx.execute(DROP_RESTORED, row![page_id, still_deleted])?;
        }
        ctx.flush()?;

        if !deleted.is_empty() {
            let titles = deleted
                .iter()
                .map(|(namespace, title)| ctx.titles.full_title(*namespace, title))
                .collect::<Vec<_>>();
            for revision in ctx.api.deleted_revisions(&titles)? {
                self.queue_archived(ctx, &revision)?;
            }
        }

        for (namespace, title) in &suppressed {
            ctx.execute(
                SUPPRESS_ARCHIVE,
                row![crate::flags::DeletedFlags::all().bits(), namespace, title],
            )?;
        }

        if !imported.is_empty() {
            let history = ctx
                .api
                .page_history(&PageSelector::Ids(imported.into_iter().collect()))?;
            for revision in history {
                self.queue(ctx, &revision)?;
            }
        }
        ctx.flush()?;

        for (source, destination, mergepoint) in resolved_merges {
            ctx.execute(MERGE_HISTORY, row![destination, source, mergepoint])?;
        }

        for (revid, bitmask) in visibility {
            ctx.execute(SET_REVISION_VISIBILITY, row![bitmask, revid])?;
            ctx.execute(SET_ARCHIVE_VISIBILITY, row![bitmask, revid])?;
        }

        for ((revid, tag), added) in tag_changes {
            if added {
                ctx.execute(TAG_LIVE, row![revid, tag])?;
                ctx.execute(TAG_ARCHIVED, row![revid, tag])?;
                ctx.execute(TAG_RECENT_CHANGE, row![revid, tag])?;
            } else {
                ctx.execute(UNTAG_LIVE, row![revid, tag])?;
                ctx.execute(UNTAG_ARCHIVED, row![revid, tag])?;
                ctx.execute(UNTAG_RECENT_CHANGE, row![revid, tag])?;
            }
        }

        tracing::debug!(since = %format_timestamp(since), "revision log replay queued");
        Ok(UpdateOutcome::CaughtUp)
    }
}
