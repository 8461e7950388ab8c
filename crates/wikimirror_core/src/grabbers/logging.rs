use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, TAG_LOGEVENT, UpdateOutcome};
use crate::api::{LogQuery, RemoteLogEvent};
use crate::changefeed::ChangeEvent;
use crate::row;
use crate::timestamp::normalize_timestamp;

const UPSERT_LOG: &str = "INSERT INTO logging
        (log_id, log_type, log_action, log_timestamp, log_user, log_user_text, log_namespace,
         log_title, log_page, log_comment, log_params, log_deleted)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
    ON CONFLICT(log_id) DO UPDATE SET log_deleted = excluded.log_deleted";
const UPDATE_VISIBILITY: &str = "UPDATE logging SET log_deleted = ?1 WHERE log_id = ?2";
const ADD_LOG_TAG: &str = "INSERT INTO tagged_logevent (tgle_tag_id, tgle_log_id)
    SELECT tag_id, ?1 FROM tag WHERE tag_name = ?2 AND EXISTS (SELECT 1 FROM logging WHERE log_id = ?1)
    ON CONFLICT DO NOTHING";
const ADD_RC_TAG: &str = "INSERT INTO tagged_recentchange (tgrc_tag_id, tgrc_rc_id)
    SELECT tag_id, rc_id FROM tag, recentchanges WHERE tag_name = ?2 AND rc_logid = ?1
    ON CONFLICT DO NOTHING";
const REMOVE_LOG_TAG: &str = "DELETE FROM tagged_logevent
    WHERE tgle_log_id = ?1 AND tgle_tag_id IN (SELECT tag_id FROM tag WHERE tag_name = ?2)";
const REMOVE_RC_TAG: &str = "DELETE FROM tagged_recentchange
    WHERE tgrc_rc_id IN (SELECT rc_id FROM recentchanges WHERE rc_logid = ?1)
      AND tgrc_tag_id IN (SELECT tag_id FROM tag WHERE tag_name = ?2)";

/// The permanent administrative log.
pub struct LoggingGrabber;

impl LoggingGrabber {
    fn queue(ctx: &mut GrabContext<'_, '_>, event: &RemoteLogEvent) -> Result<()> {
        let namespace = event.ns.unwrap_or_default();
        let title = event
            .title
            .as_deref()
            .map(|title| ctx.titles.db_title(title, namespace))
            .unwrap_or_default();
        let params = if event.params.is_null() {
            "{}".to_string()
        } else {
            serde_json::to_string(&event.params)?
        };
        ctx.execute(
            UPSERT_LOG,
            row![
                event.logid,
                event.log_type,
                event.action,
                normalize_timestamp(&event.timestamp)?,
                event.userid,
                event.user.clone().unwrap_or_default(),
                namespace,
                title,
                event.logpage.or(event.pageid),
                event.comment.clone().unwrap_or_default(),
                params,
                event.deleted_flags().bits(),
            ],
        )?;
        for tag in &event.tags {
            ctx.execute(TAG_LOGEVENT, row![event.logid, tag])?;
        }
        Ok(())
    }
}

impl Grabber for LoggingGrabber {
    fn name(&self) -> &'static str {
        "GrabberLogging"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &["tagged_logevent", "logging"]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        for event in ctx.api.log_events(&LogQuery::since(None))? {
            Self::queue(ctx, &event)?;
        }
        Ok(())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let mut visibility = Vec::new();
        // (logid, tag) -> added; later entries win
        let mut tag_changes = BTreeMap::new();
        for remote in ctx.api.log_events(&LogQuery::since(Some(since)))? {
            Self::queue(ctx, &remote)?;
            let event = ChangeEvent::from_remote_log(&remote, &ctx.titles)?;
            if event.is_action("delete", "event")
                && let Some(bitmask) = event.new_bitmask()
            {
                visibility.extend(event.param_ids().into_iter().map(|id| (id, bitmask)));
            }
            if event.is_action("tag", "update")
                && let Some(logid) = event.param_i64("logid")
            {
                for tag in event.param_strings("tagsAdded") {
                    tag_changes.insert((logid, tag), true);
                }
                for tag in event.param_strings("tagsRemoved") {
                    tag_changes.insert((logid, tag), false);
                }
            }
        }

        for (id, bitmask) in visibility {
            ctx.execute(UPDATE_VISIBILITY, row![bitmask, id])?;
        }
        for ((logid, tag), added) in tag_changes {
            if added {
                ctx.execute(ADD_LOG_TAG, row![logid, tag])?;
                ctx.execute(ADD_RC_TAG, row![logid, tag])?;
            } else {
                ctx.execute(REMOVE_LOG_TAG, row![logid, tag])?;
                ctx.execute(REMOVE_RC_TAG, row![logid, tag])?;
            }
        }
        Ok(UpdateOutcome::CaughtUp)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::LoggingGrabber;
    use crate::grabbers::{GrabberRunner, NamespacesGrabber, RecentChangesGrabber, TagsGrabber};
    use crate::test_support::{
        SteppingClock, count, migrated_mirror, remote_log, remote_rc, sample_wiki, ts,
    };

    #[test]
    fn insert_strips_namespace_prefix_and_keeps_params() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner.insert(&mut connection, &mut api, &mut LoggingGrabber).expect("insert");

        let (namespace, title, params): (i64, String, String) = connection
            .query_row(
                "SELECT log_namespace, log_title, log_params FROM logging WHERE log_id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("log row");
        assert_eq!((namespace, title.as_str()), (2, "Alice"));
        assert_eq!(params, r#"{"userid":1}"#);
    }

    #[test]
    fn update_replays_event_visibility_and_tag_changes() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let mut protect = remote_log(
            2,
            "protect",
            "protect",
            "Main Page",
            "2024-01-01T12:00:00Z",
            json!({"description": "[edit=sysop]"}),
        );
        protect.tags = vec!["mw-undo".to_string()];
        api.log_events.push(protect);
        let mut protect_rc = remote_rc(9, "log", 0, "Main Page", "2024-01-01T12:00:00Z");
        protect_rc.logid = Some(2);
        protect_rc.logtype = Some("protect".to_string());
        protect_rc.logaction = Some("protect".to_string());
        api.recent_changes.push(protect_rc);

        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 3);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner.insert(&mut connection, &mut api, &mut TagsGrabber).expect("tags");
        runner.insert(&mut connection, &mut api, &mut RecentChangesGrabber).expect("rc");
        runner.insert(&mut connection, &mut api, &mut LoggingGrabber).expect("logging");
        assert_eq!(count(&connection, "tagged_logevent"), 1);

        api.log_events.push(remote_log(
            3,
            "delete",
            "event",
            "Main Page",
            "2024-01-05T00:00:00Z",
            json!({"type": "logging", "ids": ["2"], "new": {"bitmask": 2}}),
        ));
        api.log_events.push(remote_log(
            4,
            "tag",
            "update",
            "Main Page",
            "2024-01-05T01:00:00Z",
            json!({"logid": 2, "tagsAdded": ["mw-undo"], "tagsRemoved": []}),
        ));
        api.log_events.push(remote_log(
            5,
            "tag",
            "update",
            "Main Page",
            "2024-01-05T02:00:00Z",
            json!({"logid": 2, "tagsAdded": [], "tagsRemoved": ["mw-undo"]}),
        ));
        runner
            .update(
                &mut connection,
                &mut api,
                &mut LoggingGrabber,
                Some(ts("2024-01-04T00:00:00Z")),
            )
            .expect("update");

        assert_eq!(count(&connection, "logging"), 5);
        let deleted: i64 = connection
            .query_row("SELECT log_deleted FROM logging WHERE log_id = 2", [], |row| row.get(0))
            .expect("deleted");
        assert_eq!(deleted, 2);
        assert_eq!(count(&connection, "tagged_logevent"), 0);
        assert_eq!(count(&connection, "tagged_recentchange"), 1);
    }
}
