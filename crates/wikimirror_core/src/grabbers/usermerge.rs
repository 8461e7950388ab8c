use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::changefeed::ChangeFeed;
use crate::row;

const REWRITE_AUTHOR: &[&str] = &[
    "UPDATE logging SET log_user = ?1, log_user_text = ?2 WHERE log_user = ?3",
    "UPDATE ipblocks SET ipb_by = ?1, ipb_by_text = ?2 WHERE ipb_by = ?3",
    "UPDATE archive SET ar_user = ?1, ar_user_text = ?2 WHERE ar_user = ?3",
    "UPDATE revision SET rev_user = ?1, rev_user_text = ?2 WHERE rev_user = ?3",
    "UPDATE recentchanges SET rc_user = ?1, rc_user_text = ?2 WHERE rc_user = ?3",
];
const DELETE_USER: &str = "DELETE FROM user WHERE user_id = ?1";

/// Replays account merges recorded in the mirrored log onto every authored row.
pub struct UserMergeGrabber;

impl UserMergeGrabber {
    fn replay(ctx: &mut GrabContext<'_, '_>, since: Option<DateTime<Utc>>) -> Result<()> {
        let events = ChangeFeed::new(ctx.db()).log_events_since(since, &["usermerge"])?;
        for event in events {
            let Some(old_id) = event.param_i64("oldId") else {
                tracing::warn!(log_id = ?event.log_id, "user merge entry without oldId");
                continue;
            };
            match event.log_action.as_deref() {
                Some("mergeuser") => {
                    let (Some(new_id), Some(new_name)) =
                        (event.param_i64("newId"), event.param_str("newName"))
                    else {
                        tracing::warn!(log_id = ?event.log_id, "user merge entry without target");
                        continue;
                    };
                    for statement in REWRITE_AUTHOR {
                        ctx.execute(statement, row![new_id, new_name, old_id])?;
                    }
                }
                Some("deleteuser") => ctx.execute(DELETE_USER, row![old_id])?,
                _ => {}
            }
        }
        Ok(())
    }
}

impl Grabber for UserMergeGrabber {
    fn name(&self) -> &'static str {
        "GrabberUserMerge"
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        Self::replay(ctx, None)
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        Self::replay(ctx, Some(since))?;
        Ok(UpdateOutcome::CaughtUp)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::UserMergeGrabber;
    use crate::grabbers::{GrabberRunner, LoggingGrabber, UsersGrabber};
    use crate::test_support::{SteppingClock, count, migrated_mirror, remote_log, sample_wiki};

    #[test]
    fn merges_authorship_and_deletes_old_account() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        api.log_events.push(remote_log(
            30,
            "usermerge",
            "mergeuser",
            "User:Alice",
            "2024-01-10T00:00:00Z",
            json!({"oldName": "Alice", "oldId": 1, "newName": "Admin", "newId": 2}),
        ));
        api.log_events.push(remote_log(
            31,
            "usermerge",
            "deleteuser",
            "User:Alice",
            "2024-01-10T00:00:01Z",
            json!({"oldName": "Alice", "oldId": 1}),
        ));
        api.log_events[0].userid = Some(1);
        api.log_events[0].user = Some("Alice".to_string());

        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut UsersGrabber).expect("users");
        runner.insert(&mut connection, &mut api, &mut LoggingGrabber).expect("logging");
        runner.insert(&mut connection, &mut api, &mut UserMergeGrabber).expect("merge");

        let author: (i64, String) = connection
            .query_row(
                "SELECT log_user, log_user_text FROM logging WHERE log_id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("author");
        assert_eq!(author, (2, "Admin".to_string()));
        // anonymous and Admin remain
        assert_eq!(count(&connection, "user"), 2);
    }
}
