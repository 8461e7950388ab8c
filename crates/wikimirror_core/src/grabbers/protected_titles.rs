use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::api::PageSelector;
use crate::changefeed::{ChangeFeed, ChangeKind, Coverage};
use crate::row;
use crate::timestamp::{normalize_expiry, normalize_timestamp};

const UPSERT_PROTECTED_TITLE: &str = "INSERT INTO protected_titles
        (pt_namespace, pt_title, pt_level, pt_expiry, pt_timestamp, pt_user, pt_user_text, pt_reason)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(pt_namespace, pt_title) DO UPDATE SET
        pt_level = excluded.pt_level,
        pt_expiry = excluded.pt_expiry,
        pt_timestamp = excluded.pt_timestamp,
        pt_user = excluded.pt_user,
        pt_user_text = excluded.pt_user_text,
        pt_reason = excluded.pt_reason";
// Protection metadata from the change that protected the title; the reason
// comes from the mirrored log entry.
const UPSERT_FROM_CHANGE: &str = "INSERT INTO protected_titles
        (pt_namespace, pt_title, pt_level, pt_expiry, pt_timestamp, pt_user, pt_user_text, pt_reason)
    VALUES (?1, ?2, ?3, ?4, ?5, (SELECT user_id FROM user WHERE user_name = ?6), ?6,
        COALESCE((SELECT log_comment FROM logging WHERE log_id = ?7), ''))
    ON CONFLICT(pt_namespace, pt_title) DO UPDATE SET
        pt_level = excluded.pt_level,
        pt_expiry = excluded.pt_expiry,
        pt_timestamp = excluded.pt_timestamp,
        pt_user = excluded.pt_user,
        pt_user_text = excluded.pt_user_text,
        pt_reason = excluded.pt_reason";
const DELETE_PROTECTED_TITLE: &str =
    "DELETE FROM protected_titles WHERE pt_namespace = ?1 AND pt_title = ?2";

/// Create-protection on titles that do not exist yet.
pub struct ProtectedTitlesGrabber;

impl Grabber for ProtectedTitlesGrabber {
    fn name(&self) -> &'static str {
        "GrabberProtectedTitles"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &["protected_titles"]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        for entry in ctx.api.protected_titles()? {
            let title = ctx.titles.db_title(&entry.title, entry.ns);
            ctx.execute(
                UPSERT_PROTECTED_TITLE,
                row![
                    entry.ns,
                    title,
                    entry.level,
                    normalize_expiry(&entry.expiry)?,
                    stored_timestamp(&entry.timestamp)?,
                    entry.userid,
                    entry.user.clone().unwrap_or_default(),
                    entry.comment,
                ],
            )?;
        }
        Ok(())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let events = match ChangeFeed::new(ctx.db()).recent_changes_since(since, &["new", "log"])? {
            Coverage::Covered(events) => events,
            Coverage::WindowTooShort { oldest } => return Ok(UpdateOutcome::NeedsRebuild { oldest }),
        };

        // The latest change per title supplies the protection metadata.
        let candidates = events
            .iter()
            .filter(|event| {
                event.kind == ChangeKind::Create
                    || (event.is_log("protect") && event.page_id.unwrap_or_default() == 0)
            })
            .map(|event| {
                let full_title = ctx.titles.full_title(event.namespace, &event.title);
                let title = ctx.titles.db_title(&full_title, event.namespace);
                ((event.namespace, title), (full_title, event))
            })
            .collect::<BTreeMap<_, _>>();
        if candidates.is_empty() {
            return Ok(UpdateOutcome::CaughtUp);
        }

        let titles = candidates.values().map(|(full_title, _)| full_title.clone()).collect();
        let pages = ctx.api.pages(&PageSelector::Titles(titles))?;
        for page in pages {
            let title = ctx.titles.db_title(&page.title, page.ns);
            let protection = page
                .protection
                .iter()
                .find(|protection| protection.kind == "create");
            let change = candidates.get(&(page.ns, title.clone())).map(|(_, event)| *event);
            match (protection, change) {
                (Some(protection), Some(event)) if page.missing => ctx.execute(
                    UPSERT_FROM_CHANGE,
                    row![
                        page.ns,
                        title,
                        protection.level,
                        normalize_expiry(&protection.expiry)?,
                        event.timestamp,
                        event.user_text,
                        event.log_id,
                    ],
                )?,
                _ => ctx.execute(DELETE_PROTECTED_TITLE, row![page.ns, title])?,
            }
        }
        Ok(UpdateOutcome::CaughtUp)
    }
}

fn stored_timestamp(value: &str) -> Result<String> {
    if value.is_empty() {
        Ok(String::new())
    } else {
        normalize_timestamp(value)
    }
}
