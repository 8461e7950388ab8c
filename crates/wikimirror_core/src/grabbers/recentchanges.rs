use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, TAG_RECENTCHANGE, UpdateOutcome};
use crate::api::{LogQuery, RemoteRecentChange};
use crate::changefeed::{ChangeEvent, Coverage, remote_window};
use crate::row;
use crate::timestamp::{format_timestamp, normalize_timestamp};

const INSERT_RECENT_CHANGE: &str = "INSERT INTO recentchanges
        (rc_id, rc_timestamp, rc_user, rc_user_text, rc_namespace, rc_title, rc_comment,
         rc_minor, rc_bot, rc_new, rc_cur_id, rc_this_oldid, rc_last_oldid, rc_type,
         rc_patrolled, rc_old_len, rc_new_len, rc_deleted, rc_logid, rc_log_type,
         rc_log_action, rc_params)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22)
    ON CONFLICT(rc_id) DO NOTHING";
const UPDATE_REVISION_VISIBILITY: &str =
    "UPDATE recentchanges SET rc_deleted = ?1 WHERE rc_this_oldid = ?2";
const UPDATE_EVENT_VISIBILITY: &str = "UPDATE recentchanges SET rc_deleted = ?1 WHERE rc_logid = ?2";
const MARK_PATROLLED: &str = "UPDATE recentchanges SET rc_patrolled = 1 WHERE rc_this_oldid = ?1";
const PURGE_OLD: &str = "DELETE FROM recentchanges WHERE rc_timestamp < ?1";

/// The short-retention change feed itself.
pub struct RecentChangesGrabber;

impl RecentChangesGrabber {
    fn queue(ctx: &mut GrabContext<'_, '_>, rc: &RemoteRecentChange) -> Result<()> {
        let title = ctx.titles.db_title(&rc.title, rc.ns);
        let params = rc
            .logparams
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        ctx.execute(
            INSERT_RECENT_CHANGE,
            row![
                rc.rcid,
                normalize_timestamp(&rc.timestamp)?,
                rc.userid,
                rc.user.clone().unwrap_or_default(),
                rc.ns,
                title,
                rc.comment.clone().unwrap_or_default(),
                rc.minor,
                rc.bot,
                rc.new,
                rc.pageid,
                rc.revid,
                rc.old_revid,
                rc.kind,
                rc.patrolled,
                rc.oldlen,
                rc.newlen,
                rc.deleted_flags().bits(),
                rc.logid,
                rc.logtype,
                rc.logaction,
                params,
            ],
        )?;
        for tag in &rc.tags {
            ctx.execute(TAG_RECENTCHANGE, row![rc.rcid, tag])?;
        }
        Ok(())
    }
}

impl Grabber for RecentChangesGrabber {
    fn name(&self) -> &'static str {
        "GrabberRecentChanges"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &["tagged_recentchange", "recentchanges"]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        for rc in ctx.api.recent_changes(None)? {
            Self::queue(ctx, &rc)?;
        }
        Ok(())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let bounds = match remote_window(ctx.api, since)? {
            Coverage::Covered(bounds) => bounds,
            Coverage::WindowTooShort { oldest } => return Ok(UpdateOutcome::NeedsRebuild { oldest }),
        };

        for rc in ctx.api.recent_changes(Some(since))? {
            Self::queue(ctx, &rc)?;
        }

        for event in ctx.api.log_events(&LogQuery::of_type("delete", Some(since)))? {
            let event = ChangeEvent::from_remote_log(&event, &ctx.titles)?;
            let Some(bitmask) = event.new_bitmask() else {
                continue;
            };
            let statement = match event.log_action.as_deref() {
                Some("revision") => UPDATE_REVISION_VISIBILITY,
                Some("event") => UPDATE_EVENT_VISIBILITY,
                _ => continue,
            };
            for id in event.param_ids() {
                ctx.execute(statement, row![bitmask, id])?;
            }
        }

        for event in ctx.api.log_events(&LogQuery::of_type("patrol", Some(since)))? {
            let event = ChangeEvent::from_remote_log(&event, &ctx.titles)?;
            if event.is_action("patrol", "patrol")
                && let Some(revid) = event.param_i64("curid")
            {
                ctx.execute(MARK_PATROLLED, row![revid])?;
            }
        }

        if let Some(bounds) = bounds {
            ctx.execute(PURGE_OLD, row![format_timestamp(bounds.oldest)])?;
        }
        Ok(UpdateOutcome::CaughtUp)
    }
}
